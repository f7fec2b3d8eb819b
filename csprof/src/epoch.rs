//! Epoch registry (C2, spec §3.4, §4.2).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// One loaded executable segment, as seen at epoch-creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadModule {
    pub name: String,
    pub preferred_vaddr: u64,
    pub actual_mapaddr: u64,
    pub size: u64,
}

/// A snapshot of the set of loaded executable segments, linked to the
/// previous (older) snapshot. Epochs are append-only and immutable once
/// installed as current (spec §3.4).
#[derive(Debug)]
pub struct Epoch {
    pub id: u32,
    pub modules: Vec<LoadModule>,
    pub next: Option<Arc<Epoch>>,
}

/// The process-wide epoch registry: a spinlock-protected "in-flight"
/// module list plus a many-reader current-epoch pointer.
///
/// The spinlock is deliberately a distinct primitive from whatever
/// protects `current` internally: spec §4.2 describes `lock()`/`unlock()`
/// as observable API used both to serialize concurrent `dlopen`s *and* as
/// the signal handler's "is the module set in flux?" check (spec §4.5.4).
/// `current()` readers do not take this lock; they read through a
/// `RwLock` and accept whatever epoch was installed most recently, which
/// is the "slightly stale view" spec §5 calls out as acceptable.
pub struct EpochRegistry {
    flux: AtomicBool,
    next_id: AtomicU32,
    current: RwLock<Option<Arc<Epoch>>>,
    in_flight: Mutex<Vec<LoadModule>>,
}

impl Default for EpochRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochRegistry {
    pub fn new() -> Self {
        EpochRegistry {
            flux: AtomicBool::new(false),
            next_id: AtomicU32::new(0),
            current: RwLock::new(None),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Test-and-set spinlock acquire (spec §4.2). Held across `new_epoch()`
    /// so concurrent `dlopen`s can't race, and held by the sampler's
    /// "epoch in flux" unsafe-context check.
    pub fn lock(&self) {
        while self
            .flux
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        self.flux.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.flux.load(Ordering::Relaxed)
    }

    /// Append one module to the in-flight new epoch (spec §4.2). Callers
    /// must hold the lock across a sequence of `add_module` calls followed
    /// by `new_epoch`.
    pub fn add_module(&self, name: impl Into<String>, vaddr: u64, mapaddr: u64, size: u64) {
        self.in_flight.lock().unwrap().push(LoadModule {
            name: name.into(),
            preferred_vaddr: vaddr,
            actual_mapaddr: mapaddr,
            size,
        });
    }

    /// Forge a new epoch from the in-flight module list plus everything
    /// the previous epoch already knew about (modules are never removed
    /// from the chain on `dlclose`, spec §3.4, and testable property I4
    /// requires each epoch's module set to be a superset of any earlier
    /// one's). Installs it as current and returns it.
    pub fn new_epoch(&self) -> Arc<Epoch> {
        let fresh = std::mem::take(&mut *self.in_flight.lock().unwrap());
        let prev = self.current.read().unwrap().clone();
        let mut modules = prev.as_ref().map(|e| e.modules.clone()).unwrap_or_default();
        modules.extend(fresh);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let epoch = Arc::new(Epoch {
            id,
            modules,
            next: prev,
        });
        *self.current.write().unwrap() = Some(epoch.clone());
        log::debug!(
            "epoch turn: now epoch {} with {} modules",
            epoch.id,
            epoch.modules.len()
        );
        epoch
    }

    /// `None` is the `NO_EPOCH` state, before the first `dlopen`/initial
    /// module enumeration.
    pub fn current(&self) -> Option<Arc<Epoch>> {
        self.current.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_is_monotonic_and_append_only() {
        let registry = EpochRegistry::new();
        assert!(registry.current().is_none());

        registry.lock();
        registry.add_module("liba.so", 0x1000, 0x7f0000000000, 0x2000);
        let e1 = registry.new_epoch();
        registry.unlock();
        assert_eq!(e1.id, 1);
        assert_eq!(e1.modules.len(), 1);

        registry.lock();
        registry.add_module("libb.so", 0x1000, 0x7f0000100000, 0x1000);
        let e2 = registry.new_epoch();
        registry.unlock();
        assert_eq!(e2.id, 2);
        // Superset: libb.so is new, but liba.so's entry survives.
        assert_eq!(e2.modules.len(), 2);
        assert!(e2.modules.iter().any(|m| m.name == "liba.so"));
        assert!(e2.modules.iter().any(|m| m.name == "libb.so"));
        assert!(std::ptr::eq(
            e2.next.as_ref().unwrap().as_ref(),
            e1.as_ref()
        ));
    }

    #[test]
    fn lock_unlock_observable_by_is_locked() {
        let registry = EpochRegistry::new();
        assert!(!registry.is_locked());
        registry.lock();
        assert!(registry.is_locked());
        registry.unlock();
        assert!(!registry.is_locked());
    }
}
