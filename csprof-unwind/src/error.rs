use thiserror::Error;

/// Per-sample unwind outcomes (spec §4.5.1 "Result").
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UnwindError {
    /// The context failed a safety gate before any unwinding was attempted.
    #[error("unsafe context at ip={ip:#x}")]
    Unsafe { ip: u64 },

    /// The unwinder encountered an error partway through: invalid return
    /// address, unreadable memory, a code range marked `Data`, or a lost
    /// frame pointer.
    #[error("bad unwind at depth {depth}, ip={ip:#x}: {reason}")]
    BadUnwind {
        depth: usize,
        ip: u64,
        reason: &'static str,
    },
}
