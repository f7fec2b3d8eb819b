//! Logical-unwinder plug-in capability (spec §9 "Dynamic dispatch").
//!
//! The original expresses this as a variant set of per-plug-in function
//! pointers (`{NONE, LOGICAL_AGENT_0, ...}`); a capability trait is the
//! idiomatic equivalent.

use crate::frame::{AsInfo, Lip};

/// One step of logical-unwinder participation in a physical unwind step.
/// A physical-only unwind never calls through this trait.
pub trait LushAgent: Send + Sync {
    /// Advance the logical unwinder's own state by one physical frame,
    /// returning the logical identity to attach to this frame, if any.
    fn step(&self, physical_ip: u64, physical_sp: u64) -> Option<Lip>;

    /// The association descriptor this agent reports for the frame it
    /// just stepped over.
    fn associate(&self, physical_ip: u64) -> AsInfo;
}

/// The set of logical-unwinder plug-ins active for a thread, borrowed from
/// process-wide state (`PROF_LUSH_AGENTS`, §6.2). Empty means physical-only.
#[derive(Default, Clone)]
pub struct LushAgents(Vec<std::sync::Arc<dyn LushAgent>>);

impl LushAgents {
    pub fn new(agents: Vec<std::sync::Arc<dyn LushAgent>>) -> Self {
        Self(agents)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &std::sync::Arc<dyn LushAgent>> {
        self.0.iter()
    }
}
