//! The process-wide persistent-ID counter (spec §4.6.4, §5, §9).
//!
//! Persistent IDs are assigned monotonically by fetch-and-add-by-2,
//! reserving even numbers for ordinary nodes; 0 is never assigned. Odd IDs
//! are a node's own business (§9 "persistent-ID parity convention") — this
//! counter only ever hands out even numbers, and [`crate::cct::Node`]
//! tracks "must retain" as a separate flag rather than by incrementing the
//! value it was given.

use std::sync::atomic::{AtomicU32, Ordering};

/// Lock-free, process-wide. The only other pieces of truly global mutable
/// state are the epoch registry and the (write-once) metric descriptor
/// table (spec §9).
#[derive(Debug)]
pub struct PersistentIdCounter(AtomicU32);

impl PersistentIdCounter {
    pub const fn new() -> Self {
        // Start at 0 so the first `next()` returns 2; 0 itself is never handed out.
        Self(AtomicU32::new(0))
    }

    /// Returns the next even, nonzero persistent ID.
    pub fn next(&self) -> u32 {
        self.0.fetch_add(2, Ordering::Relaxed) + 2
    }
}

impl Default for PersistentIdCounter {
    fn default() -> Self {
        Self::new()
    }
}
