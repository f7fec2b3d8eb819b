//! Machine-context-to-call-frame unwinding (C5).
//!
//! This crate implements only the per-frame state machine described in the
//! design: resolving return addresses and canonical stack pointers given a
//! procedure descriptor. It does not decode machine instructions itself —
//! callers supply a [`descriptor::DescriptorSource`] backed by whatever
//! platform decoder they have.

pub mod context;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod lush;
pub mod safety;
pub mod unwinder;

pub use context::{MachineContext, SliceStackReader, StackReader};
pub use descriptor::{
    BaseReg, CodeRangeKind, DescriptorSource, ProcedureDescriptor, PrologueEpiloguePosition,
    ResolvedDescriptor,
};
pub use error::UnwindError;
pub use frame::{AsInfo, Assoc, Frame, Lip};
pub use lush::{LushAgent, LushAgents};
pub use safety::{is_unsafe_context, AddressRange, SafetyTables, UnsafeContextInputs};
pub use unwinder::{UnwindFlags, UnwindResult, Unwinder};
