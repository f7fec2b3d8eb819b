//! Per-thread profiling state (C4, spec §4.4).

use std::sync::Arc;

use csprof_unwind::{Frame, LushAgents};

use crate::cct::{Cct, ContextChainEntry};
use crate::epoch::Epoch;
use crate::ids::PersistentIdCounter;

/// Bitset for the flags named in spec §4.4. Kept as a small struct of
/// named `bool`s rather than a packed integer: nothing on the wire needs
/// these packed (unlike [`crate::metric::MetricFlags`], these never leave
/// the process), and named fields read better at every call site.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadFlags {
    pub exc_handling: bool,
    pub thru_tramp: bool,
    pub tail_call: bool,
    pub epilogue_ra_reloaded: bool,
    pub epilogue_sp_reset: bool,
    pub signaled_during_trampoline: bool,
    pub mallocing_during_realloc: bool,
}

impl ThreadFlags {
    /// Cleared at the end of every sample (spec §4.7.3).
    pub fn clear_per_sample(&mut self) {
        self.thru_tramp = false;
        self.tail_call = false;
        self.epilogue_ra_reloaded = false;
        self.epilogue_sp_reset = false;
    }
}

/// `pstate` (spec §4.4): used only for filename generation (spec §4.8).
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistentIdentity {
    pub hostid: u64,
    pub pid: u32,
    pub thrid: u32,
    pub ninit: u32,
}

/// The backtrace buffer (spec §3.3): the current unwind-in-progress
/// region and the previous sample's cached innermost frames. Modeled with
/// `Vec<Frame>` rather than raw cursors into a manually doubled byte
/// buffer — the doubling-growth behavior spec §3.3 describes is exactly
/// what `Vec::push` already gives us, so there is no byte-level
/// bookkeeping left to hand-roll.
#[derive(Debug, Clone, Default)]
pub struct BacktraceBuffer {
    /// Frames written by the unwind currently in progress, innermost
    /// first. Empty between samples.
    pub current: Vec<Frame>,
    /// The innermost portion of the previous sample's call stack, kept
    /// around for potential fast-path common-prefix reuse (not
    /// implemented as an optimization here, but retained as a handle
    /// future sampling logic can use — see DESIGN.md).
    pub cached: Vec<Frame>,
}

impl BacktraceBuffer {
    pub fn commit(&mut self) {
        std::mem::swap(&mut self.current, &mut self.cached);
        self.current.clear();
    }
}

/// One thread's complete profiling state (spec §4.4). Accessible only via
/// thread-local storage in a real host; the type itself has no such
/// requirement and is plain `!Sync` data owned by its thread.
pub struct ThreadProfilingState {
    pub buffer: BacktraceBuffer,
    /// Cursor in the CCT: the deepest node reached by the previous sample.
    pub treenode: std::ptr::NonNull<crate::cct::Node>,
    pub flags: ThreadFlags,
    pub pstate: PersistentIdentity,
    /// Count of samples discarded due to unsafe context — epoch-locked,
    /// a pending trampoline unwound, or an unsafe-context gate failure
    /// all fall through to this same counter (spec §4.4, B2).
    pub trampoline_samples: u64,
    pub bad_unwind_count: u64,
    /// The thread's current (most recent epoch's) CCT.
    pub cct: Cct,
    /// Prior-epoch CCTs this thread owns, oldest first (spec §4.4 `next`
    /// "Chain of prior-epoch CCTs owned by this thread").
    pub prior_ccts: Vec<Cct>,
    pub epoch: Arc<Epoch>,
    pub lush_agents: LushAgents,
    /// Creation-context chain (spec §3.6), snapshotted once at thread
    /// creation; `None` for the very first thread (no creator).
    pub ctxt: Vec<ContextChainEntry>,
}

impl ThreadProfilingState {
    /// Spec §4.4 "Lifecycle: allocated at thread creation; initialized
    /// (buffer allocated, CCT root allocated, epoch linked)".
    pub fn new(
        metric_width: usize,
        epoch: Arc<Epoch>,
        ids: &PersistentIdCounter,
        pstate: PersistentIdentity,
        lush_agents: LushAgents,
        ctxt: Vec<ContextChainEntry>,
    ) -> Self {
        let cct = Cct::new(metric_width, epoch.id, ids);
        let root = cct.root();
        ThreadProfilingState {
            buffer: BacktraceBuffer::default(),
            treenode: root,
            flags: ThreadFlags::default(),
            pstate,
            trampoline_samples: 0,
            bad_unwind_count: 0,
            cct,
            prior_ccts: Vec::new(),
            epoch,
            lush_agents,
            ctxt,
        }
    }

    /// Spec §4.2 "Sample interaction": if the thread's recorded epoch
    /// differs from the registry's current one, fork the thread's CCT —
    /// allocate a new one seeded so fast-path prefix tracking continues,
    /// and retire the old one onto `prior_ccts` for serialization.
    pub fn fork_cct_if_epoch_turned(&mut self, current_epoch: &Arc<Epoch>, ids: &PersistentIdCounter) {
        if Arc::ptr_eq(&self.epoch, current_epoch) {
            return;
        }
        let metric_width = self.cct.metric_width();
        let new_cct = Cct::new(metric_width, current_epoch.id, ids);
        let new_root = new_cct.root();
        let old_cct = std::mem::replace(&mut self.cct, new_cct);
        self.prior_ccts.push(old_cct);
        self.treenode = new_root;
        self.epoch = current_epoch.clone();
        log::debug!("thread forked CCT onto epoch {}", current_epoch.id);
    }

    /// Every CCT this thread owns, oldest to newest, for serialization
    /// (spec §4.8 "for each state").
    pub fn all_ccts(&self) -> impl Iterator<Item = &Cct> {
        self.prior_ccts.iter().chain(std::iter::once(&self.cct))
    }
}
