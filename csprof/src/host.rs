//! Host lifecycle shim (C11, spec §6.1).
//!
//! The handful of entry points a host embedding this core is expected to
//! call at well-known points in the process lifecycle: process start/end,
//! around `fork`, thread start/end, and after `dlopen`/`dlclose`. None of
//! these touch the OS directly (no `sigaction`, no `dl_iterate_phdr`) —
//! that belongs to the host, the same way `framehop-in-process` leaves
//! memory-reading to its caller. This module only sequences the
//! component calls those events must trigger.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use csprof_unwind::LushAgents;

use crate::config::Config;
use crate::epoch::EpochRegistry;
use crate::error::FatalError;
use crate::ids::PersistentIdCounter;
use crate::metric::MetricDescriptorTable;
use crate::sampler::{Sampler, STATUS_FINI, STATUS_RUNNING};
use crate::state::{PersistentIdentity, ThreadProfilingState};

/// Everything that lives for the whole process, built once by
/// [`Process::init`] and torn down once by [`Process::fini`].
pub struct Process {
    pub config: Config,
    pub metrics: MetricDescriptorTable,
    pub epochs: EpochRegistry,
    pub ids: PersistentIdCounter,
    hostid: u64,
    pid: u32,
    next_thrid: AtomicU32,
    sampler_status: AtomicU8,
}

/// Returned by [`Process::fork_pre`], and passed back to
/// [`Process::fork_post`] in the parent: records whether sampling was
/// actually running before the fork, so `fork_post` only restarts it if
/// `fork_pre` is the one that stopped it (spec §6.1 `fork_pre() -> token`
/// / `fork_post(child_pid, token)`).
pub struct ForkToken {
    was_running: bool,
}

impl Process {
    /// Convenience over [`Process::init`] for a real host: reads the OS
    /// process id directly rather than requiring the caller to supply it.
    /// `hostid` still has to come from the host (spec §4.8 only requires
    /// it be stable for the machine's lifetime; gethostid(3) is a
    /// reasonable source but this crate doesn't assume one).
    pub fn init_from_os(hostid: u64) -> Result<Self, FatalError> {
        // SAFETY: `getpid` has no preconditions and never fails.
        let pid = unsafe { libc::getpid() } as u32;
        Self::init(hostid, pid)
    }

    /// Spec §6.1 `process_init`: read configuration, build the
    /// process-wide tables, and freeze the metric table once the host has
    /// finished describing metrics via the returned `&mut MetricDescriptorTable`
    /// (the host calls [`Process::finish_metric_setup`] when done).
    pub fn init(hostid: u64, pid: u32) -> Result<Self, FatalError> {
        let config = Config::from_env()?;
        let mut metrics = MetricDescriptorTable::new();
        metrics.set_max(config.max_metrics)?;
        log::info!("process_init: hostid={:#x} pid={}", hostid, pid);
        Ok(Process {
            config,
            metrics,
            epochs: EpochRegistry::new(),
            ids: PersistentIdCounter::new(),
            hostid,
            pid,
            next_thrid: AtomicU32::new(0),
            sampler_status: AtomicU8::new(STATUS_RUNNING),
        })
    }

    /// Called once, after the host has registered every metric it wants,
    /// right before sampling starts (spec §4.3 "immutable once sampling
    /// begins").
    pub fn finish_metric_setup(&mut self) {
        self.metrics.freeze();
    }

    pub fn sampler(&self) -> Sampler<'_> {
        Sampler::new(&self.epochs, &self.ids, &self.sampler_status)
    }

    /// Spec §6.1 `thread_init`: allocate a new thread's profiling state,
    /// bound to the epoch current at creation time, with a creation
    /// context snapshotted from the creator's cursor (spec §4.6.3). Pass
    /// `creator` as `None` for the process's initial thread.
    pub fn thread_init(
        &self,
        creator: Option<&ThreadProfilingState>,
        lush_agents: LushAgents,
    ) -> ThreadProfilingState {
        let thrid = self.next_thrid.fetch_add(1, Ordering::Relaxed);
        let pstate = PersistentIdentity {
            hostid: self.hostid,
            pid: self.pid,
            thrid,
            ninit: 0,
        };
        let epoch = self.epochs.current().unwrap_or_else(|| {
            self.epochs.lock();
            let e = self.epochs.new_epoch();
            self.epochs.unlock();
            e
        });
        let ctxt = match creator {
            Some(creator_state) => {
                crate::cct::Cct::snapshot_creation_context(creator_state.treenode, &self.ids)
            }
            None => Vec::new(),
        };
        log::debug!("thread_init: thrid={}", thrid);
        ThreadProfilingState::new(self.metrics.width(), epoch, &self.ids, pstate, lush_agents, ctxt)
    }

    /// Spec §6.1 `thread_fini`: prune chaff and hand back the finished
    /// state so the host can serialize or merge it; this function itself
    /// does not write anything to disk.
    pub fn thread_fini(&self, mut state: ThreadProfilingState) -> ThreadProfilingState {
        let pruned = state.cct.prune_chaff();
        log::debug!(
            "thread_fini: thrid={} pruned={} remaining={}",
            state.pstate.thrid,
            pruned,
            state.cct.node_count()
        );
        state
    }

    /// Spec §6.1 `process_fini`: write every still-live thread's state to
    /// a profile file. The host is responsible for having quiesced
    /// sampling (called [`Sampler::request_fini`]) before this runs.
    pub fn process_fini(
        &self,
        states: &[&ThreadProfilingState],
        total_trampoline_samples: u64,
    ) -> Result<std::path::PathBuf, FatalError> {
        log::info!("process_fini: pid={} states={}", self.pid, states.len());
        let newest_epoch = self.epochs.current();
        crate::serialize::write_profile_file(
            &self.config.out_path,
            self.hostid,
            self.pid,
            None,
            &self.metrics,
            newest_epoch.as_deref(),
            states,
            total_trampoline_samples,
        )
    }

    /// Spec §6.1 `dlopen_post`: record a newly mapped load module as a new
    /// epoch. Must be called with no sample in flight on this thread; the
    /// epoch lock serializes against concurrent `dlopen`s from other
    /// threads.
    pub fn dlopen_post(&self, name: impl Into<String>, vaddr: u64, mapaddr: u64, size: u64) -> Arc<crate::epoch::Epoch> {
        self.epochs.lock();
        self.epochs.add_module(name, vaddr, mapaddr, size);
        let epoch = self.epochs.new_epoch();
        self.epochs.unlock();
        epoch
    }

    /// Spec §6.1 `dlclose_post`: per spec §3.4, modules are never removed
    /// from the chain, so closing a module does not need its own epoch —
    /// it is folded into whatever the next `dlopen_post` produces. This
    /// is a no-op kept as an explicit entry point so hosts have a single
    /// place to call, matching the `process_init`/`process_fini` symmetry
    /// of spec §6.1's table.
    pub fn dlclose_post(&self) {}

    /// Spec §6.1 `fork_pre`: called in the parent immediately before
    /// `fork`. Stops sampling (same effect as [`Sampler::request_fini`]
    /// would have, but reversible) so the child doesn't inherit a sample
    /// mid-flight, and hands back a token recording whether sampling was
    /// actually running, for [`Process::fork_post`] to undo.
    pub fn fork_pre(&self) -> ForkToken {
        let was_running = self.sampler_status.swap(STATUS_FINI, Ordering::AcqRel) == STATUS_RUNNING;
        log::debug!("fork_pre: sampling stopped (was_running={})", was_running);
        ForkToken { was_running }
    }

    /// Spec §6.1 `fork_post`: called in the parent immediately after
    /// `fork` returns the child's pid. Restarts sampling if (and only if)
    /// [`Process::fork_pre`] is the one that stopped it.
    pub fn fork_post(&self, child_pid: u32, token: ForkToken) {
        if token.was_running {
            self.sampler_status.store(STATUS_RUNNING, Ordering::Release);
        }
        log::info!(
            "fork_post (parent): child pid={} sampling_restarted={}",
            child_pid,
            token.was_running
        );
    }

    /// Spec §6.1 `fork_post` in the child: every thread but the one that
    /// called `fork` vanishes without running `thread_fini`; the
    /// surviving thread keeps its state and simply gets a new `pid`
    /// recorded so the eventual profile filename doesn't collide with the
    /// parent's. Distinct from [`Process::fork_pre`]/[`Process::fork_post`]
    /// (the parent-side stop/restart pair) since the child has its own
    /// `Process` rather than sharing the parent's sampler status.
    pub fn fork_post_child(&mut self, new_pid: u32) {
        self.pid = new_pid;
        log::info!("fork_post (child): new pid={}", new_pid);
    }
}
