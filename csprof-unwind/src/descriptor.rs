//! Procedure descriptors (PD) and code-range descriptors (CRD), §4.5.2 step 2.
//!
//! Resolving an instruction pointer to one of these is the job of the
//! platform-specific machine-instruction decoder, which is out of scope for
//! this crate (spec §1). Callers supply a [`DescriptorSource`] that wraps
//! whatever decoder they have.

/// Which register the return address lives in, or which register the
/// canonical stack pointer is computed relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseReg {
    Sp,
    Fp,
}

/// How a procedure stores (or doesn't store) its return address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureDescriptor {
    /// No stack frame at all; the return address is in the link register.
    NullFrame,
    /// The return address is preserved in a register across the whole
    /// procedure body; `save_reg` names which callee-saved slot it lives in
    /// once past the prologue, `entry_reg` is where it lives before that.
    RegisterFrame { save_reg: u8, entry_reg: u8 },
    /// The return address is spilled to the stack at `rsa_offset` bytes
    /// from `base_reg`, once past the prologue's RA-store instruction.
    StackFrame {
        base_reg: BaseReg,
        rsa_offset: i64,
        frame_size: u64,
        entry_reg: u8,
    },
}

/// Where within a procedure's instruction range the interrupted IP falls,
/// relative to the prologue/epilogue landmarks the decoder identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrologueEpiloguePosition {
    /// Before the SP-adjust instruction: entry register still holds RA,
    /// SP has not yet been decremented by `frame_size`.
    PrologueBeforeSpAdjust,
    /// After the SP-adjust but before the RA-store instruction.
    PrologueBeforeRaStore,
    /// Ordinary function body; RA (if spilled) is at its stack slot.
    Body,
    /// Past an epilogue RA-reload instruction: the return-address register
    /// already holds the outer RA and SP is about to be restored.
    EpilogueRaReloaded,
}

/// The kind of code range containing an instruction pointer (§4.5.2 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeRangeKind {
    /// Prologue + body, ordinary unwindable function.
    Standard,
    /// Body only (e.g. a range that starts mid-function after a branch
    /// target); no further prologue analysis needed.
    Context,
    /// Not unwindable: data, not code.
    Data,
    /// No stack management performed in this range.
    NonContext,
    /// Stack allocated but out of normal flow (exception landing pads).
    NonContextStack,
}

/// What the decoder returned for one instruction pointer: the procedure's
/// overall frame shape, the code-range classification, and — when relevant —
/// where the IP sits relative to prologue/epilogue landmarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDescriptor {
    pub pd: ProcedureDescriptor,
    pub crd: CodeRangeKind,
    pub position: PrologueEpiloguePosition,
}

/// A source of procedure descriptors for instruction pointers. Implemented
/// by the host on top of its own instruction decoder; csprof-unwind never
/// decodes machine code itself.
pub trait DescriptorSource {
    /// Resolve `ip` to the descriptor of the procedure (and code range)
    /// that contains it. `None` means the IP is not recognized at all,
    /// which the unwinder treats the same as [`CodeRangeKind::Data`].
    fn resolve(&self, ip: u64) -> Option<ResolvedDescriptor>;
}
