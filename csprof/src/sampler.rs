//! Signal-driven sampler (C7, spec §4.7).
//!
//! Modeled after a SIGPROF handler, but expressed as an ordinary method so
//! it can be driven either by a real signal handler (installed by
//! [`crate::host`]) or directly from a test. The actual `sigaction`
//! plumbing lives in `host.rs`; this module only contains the logic that
//! must run between "a timer fired" and "the mutator resumes".

use std::sync::atomic::{AtomicU64, Ordering};

use csprof_unwind::{MachineContext, Unwinder, UnsafeContextInputs};

use crate::epoch::EpochRegistry;
use crate::error::SampleError;
use crate::ids::PersistentIdCounter;
use crate::metric::MetricId;
use crate::state::ThreadProfilingState;

/// Default sampling period (spec §4.7.4, `PROF_SAMPLE_PERIOD` default).
pub const DEFAULT_SAMPLE_PERIOD_USEC: u64 = 5000;

/// Round-robin signal distribution bookkeeping (spec §9 Open Question).
/// Not one of spec §6.2's named `PROF_*` variables; SPEC_FULL.md §6.2
/// introduces it as a host-selected mode, defaulting to off, for hosts
/// that fan a single process-wide timer out across threads instead of
/// giving each thread its own timer.
#[derive(Debug, Default)]
pub struct RoundRobinState {
    pub outstanding_signal_count: AtomicU64,
}

impl RoundRobinState {
    pub fn note_signal_sent(&self) {
        self.outstanding_signal_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_signal_handled(&self) {
        self.outstanding_signal_count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Process-wide status the sampler checks on every signal (spec §4.7.5):
/// once `Fini` is set, further signals are a no-op so shutdown doesn't
/// race a profile write against an in-progress sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerStatus {
    Running,
    Fini,
}

/// Process-wide handles the sampler needs on every sample; a thin bundle
/// rather than a god object, since each field is independently owned and
/// already has its own synchronization. `status` is borrowed rather than
/// owned so that [`crate::host::Process`] can hold the one true status
/// cell and hand out a fresh `Sampler` per call (e.g. around `fork`)
/// without losing a `request_fini`/`fork_pre` already recorded on it.
pub struct Sampler<'a> {
    pub epochs: &'a EpochRegistry,
    pub ids: &'a PersistentIdCounter,
    status: &'a std::sync::atomic::AtomicU8,
}

pub(crate) const STATUS_RUNNING: u8 = 0;
pub(crate) const STATUS_FINI: u8 = 1;

impl<'a> Sampler<'a> {
    pub fn new(
        epochs: &'a EpochRegistry,
        ids: &'a PersistentIdCounter,
        status: &'a std::sync::atomic::AtomicU8,
    ) -> Self {
        Sampler { epochs, ids, status }
    }

    pub fn status(&self) -> SamplerStatus {
        match self.status.load(Ordering::Acquire) {
            STATUS_FINI => SamplerStatus::Fini,
            _ => SamplerStatus::Running,
        }
    }

    /// Spec §4.7.5: stop responding to timer fire events. Idempotent.
    pub fn request_fini(&self) {
        self.status.store(STATUS_FINI, Ordering::Release);
    }

    /// Spec §4.7.3's per-sample driver. Returns `Ok(())` on a credited
    /// sample, or a [`SampleError`] describing why the sample was
    /// dropped — both cases are non-fatal to the mutator thread, and the
    /// caller (the real signal handler) must not propagate panics out
    /// across the signal boundary.
    #[allow(clippy::too_many_arguments)]
    pub fn on_signal(
        &self,
        state: &mut ThreadProfilingState,
        unwinder: &Unwinder,
        ctx: MachineContext,
        inputs: UnsafeContextInputs,
        metric_id: MetricId,
        sample_count: u64,
    ) -> Result<(), SampleError> {
        if self.status() == SamplerStatus::Fini {
            return Ok(());
        }

        // Epoch-in-flux and "unsafe context" are both checked before any
        // attempt to touch the CCT (spec §4.5.4, §4.7.3). Both fall
        // through to `trampoline_samples`, same as the original's
        // `csprof_take_profile_sample` (B2).
        if self.epochs.is_locked() {
            state.trampoline_samples += 1;
            log::trace!("sample dropped: epoch registry locked");
            return Err(SampleError::EpochLocked);
        }

        if let Some(current) = self.epochs.current() {
            state.fork_cct_if_epoch_turned(&current, self.ids);
        }

        if state.flags.thru_tramp {
            // Undo-trampoline (spec §4.7.2): the previous sample installed
            // a return trampoline that has since fired; account for it and
            // clear the flag before unwinding fresh.
            state.trampoline_samples += 1;
            state.flags.thru_tramp = false;
        }

        let result = match unwinder.unwind(ctx, inputs) {
            Ok(result) => result,
            Err(csprof_unwind::UnwindError::Unsafe { ip }) => {
                state.trampoline_samples += 1;
                log::trace!("sample dropped: unsafe context at ip={:#x}", ip);
                return Ok(());
            }
            Err(err @ csprof_unwind::UnwindError::BadUnwind { .. }) => {
                state.bad_unwind_count += 1;
                log::trace!("sample dropped: {}", err);
                return Ok(());
            }
        };

        if !result.frames.is_empty() {
            state.treenode = state.cct.insert_backtrace(
                state.treenode,
                &result.frames,
                metric_id,
                sample_count,
                self.ids,
            );
        }

        if result.flags.epilogue_ra_reloaded {
            state.flags.epilogue_ra_reloaded = true;
        }
        if result.flags.epilogue_sp_reset {
            state.flags.epilogue_sp_reset = true;
        }

        // Install-trampoline: the host installs the return-address
        // rewrite that will fire `thru_tramp` next time; this module only
        // records that the thread is now "inside" one (spec §4.7.2).
        state.flags.thru_tramp = true;

        log::trace!(
            "sample credited: {} frames, leaf ip={:#x}",
            result.frames.len(),
            unsafe { state.treenode.as_ref() }.ip
        );

        Ok(())
    }

    /// Spec §4.5.3/§4.7.4 `nlx(target_sp, target_ip)`: a `longjmp`/exception
    /// unwind landed at `target_ip` with stack pointer `target_sp`, outside
    /// the normal sample path. Pops the thread's CCT cursor back to the
    /// node the destination frame belongs to, unswizzles any trampoline
    /// that was pending across the popped frames, and (if the destination
    /// isn't the synthetic root) marks a fresh trampoline as pending there
    /// — mirroring `do_nlx_twiddling`'s pop-then-reswizzle sequence
    /// (original_source/ `trunk/.../alpha/libc.c`), with the real register
    /// patch itself left to the host, same as `install`/`undo` elsewhere
    /// in this module.
    pub fn handle_non_local_exit(&self, state: &mut ThreadProfilingState, target_sp: u64, target_ip: u64) {
        let was_pending = state.flags.thru_tramp;
        if was_pending {
            // Unswizzle: the trampoline return address being popped no
            // longer applies once we've jumped past it.
            state.flags.signaled_during_trampoline = true;
            state.flags.thru_tramp = false;
        }

        // Frames get shallower (sp increases) walking from the cached leaf
        // toward the root, mirroring the original's "pop 'til stack
        // pointers match" loop over its innermost-first cached backtrace.
        let mut cursor = state.treenode;
        let mut popped = 0u32;
        loop {
            let node = unsafe { cursor.as_ref() };
            if node.is_root() || node.sp >= target_sp {
                break;
            }
            match node.parent() {
                Some(parent) => {
                    cursor = parent;
                    popped += 1;
                }
                None => break,
            }
        }
        state.treenode = cursor;

        let landed_on_root = unsafe { cursor.as_ref() }.is_root();
        if was_pending && !landed_on_root {
            // Reinstall: the host will patch a fresh trampoline at the
            // frame we just landed on.
            state.flags.thru_tramp = true;
        }

        log::debug!(
            "non-local exit to ip={:#x} sp={:#x}: popped {} frame(s), trampoline {}",
            target_ip,
            target_sp,
            popped,
            if was_pending && !landed_on_root { "reinstalled" } else { "cleared" },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PersistentIdentity;
    use csprof_unwind::{Frame, LushAgents};

    #[test]
    fn non_local_exit_pops_cursor_to_destination_frame_and_reinstalls_trampoline() {
        let ids = PersistentIdCounter::new();
        let epoch_registry = EpochRegistry::new();
        epoch_registry.lock();
        let epoch = epoch_registry.new_epoch();
        epoch_registry.unlock();

        let pstate = PersistentIdentity {
            hostid: 0xdead,
            pid: 1,
            thrid: 0,
            ninit: 0,
        };
        let mut state =
            ThreadProfilingState::new(1, epoch, &ids, pstate, LushAgents::default(), Vec::new());

        // root(sp=MAX) -> foo(sp=0x2000) -> bar(sp=0x1000), leaf cursor at bar.
        let frames = vec![
            Frame::physical(0x400700, 0x1000), // bar, innermost
            Frame::physical(0x400600, 0x2000), // foo
        ];
        state.treenode =
            state
                .cct
                .insert_backtrace(state.treenode, &frames, MetricId(0), 1, &ids);
        assert_eq!(unsafe { state.treenode.as_ref() }.ip, 0x400700);

        state.flags.thru_tramp = true;

        let sampler_epochs = EpochRegistry::new();
        let sampler_ids = PersistentIdCounter::new();
        let sampler_status = std::sync::atomic::AtomicU8::new(STATUS_RUNNING);
        let sampler = Sampler::new(&sampler_epochs, &sampler_ids, &sampler_status);

        // longjmp lands back at foo's frame: target_sp == foo's canonical sp.
        sampler.handle_non_local_exit(&mut state, 0x2000, 0x400600);

        assert_eq!(unsafe { state.treenode.as_ref() }.ip, 0x400600, "cursor popped up to foo");
        assert!(state.flags.signaled_during_trampoline, "the popped trampoline was unswizzled");
        assert!(state.flags.thru_tramp, "a fresh trampoline is pending at the destination frame");
    }

    #[test]
    fn non_local_exit_past_the_whole_cached_stack_lands_on_root_without_reinstalling() {
        let ids = PersistentIdCounter::new();
        let epoch_registry = EpochRegistry::new();
        epoch_registry.lock();
        let epoch = epoch_registry.new_epoch();
        epoch_registry.unlock();

        let pstate = PersistentIdentity {
            hostid: 0xdead,
            pid: 1,
            thrid: 0,
            ninit: 0,
        };
        let mut state =
            ThreadProfilingState::new(1, epoch, &ids, pstate, LushAgents::default(), Vec::new());

        let frames = vec![Frame::physical(0x400700, 0x1000)];
        state.treenode =
            state
                .cct
                .insert_backtrace(state.treenode, &frames, MetricId(0), 1, &ids);
        state.flags.thru_tramp = true;

        let sampler_epochs = EpochRegistry::new();
        let sampler_ids = PersistentIdCounter::new();
        let sampler_status = std::sync::atomic::AtomicU8::new(STATUS_RUNNING);
        let sampler = Sampler::new(&sampler_epochs, &sampler_ids, &sampler_status);

        sampler.handle_non_local_exit(&mut state, u64::MAX, 0x100000);

        assert!(unsafe { state.treenode.as_ref() }.is_root());
        assert!(!state.flags.thru_tramp, "no destination frame to reinstall a trampoline on");
    }
}
