//! The CCT node itself (spec §3.2).
//!
//! Nodes live in a thread's [`crate::arena::PersistentArena`] and are
//! never individually freed; the whole arena goes away at thread teardown
//! (spec §3.2 "Lifecycle"). The per-node metric-accumulator vector is
//! stored immediately after the node header in the same allocation, to
//! keep metric access cache-local (spec §4.3).

use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use csprof_unwind::AsInfo;

#[repr(C)]
pub struct Node {
    pub(crate) parent: Cell<Option<NonNull<Node>>>,
    pub(crate) first_child: Cell<Option<NonNull<Node>>>,
    pub(crate) next_sibling: Cell<Option<NonNull<Node>>>,
    pub ip: u64,
    pub sp: u64,
    pub(crate) as_info: Cell<AsInfo>,
    lip_ptr: Option<NonNull<u8>>,
    lip_len: u32,
    pub persistent_id: u32,
    retained: Cell<bool>,
    pub epoch: u32,
    metric_count: u32,
}

impl Node {
    /// Build a node in place. Used only by [`crate::cct::Cct`]'s arena
    /// allocation path; kept as a constructor rather than a public struct
    /// literal so the tail-array layout invariants stay in one place.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        parent: Option<NonNull<Node>>,
        ip: u64,
        sp: u64,
        as_info: AsInfo,
        lip: Option<(NonNull<u8>, u32)>,
        persistent_id: u32,
        epoch: u32,
        metric_count: u32,
    ) -> Node {
        Node {
            parent: Cell::new(parent),
            first_child: Cell::new(None),
            next_sibling: Cell::new(None),
            ip,
            sp,
            as_info: Cell::new(as_info),
            lip_ptr: lip.map(|(p, _)| p),
            lip_len: lip.map(|(_, l)| l).unwrap_or(0),
            persistent_id,
            retained: Cell::new(false),
            epoch,
            metric_count,
        }
    }

    /// Byte offset, from the start of the node, at which the metric
    /// accumulator array begins. `Node`'s largest field is 8-byte aligned
    /// (pointers / u64), so `size_of::<Node>()` is already a multiple of
    /// 8 under `repr(C)`; the rounding here just documents that
    /// requirement rather than relying on it silently.
    pub(crate) fn metrics_byte_offset() -> usize {
        (std::mem::size_of::<Node>() + 7) & !7
    }

    pub(crate) fn alloc_size(metric_width: usize) -> usize {
        Self::metrics_byte_offset() + metric_width * std::mem::size_of::<u64>()
    }

    pub fn lip(&self) -> Option<&[u8]> {
        self.lip_ptr
            .map(|p| unsafe { std::slice::from_raw_parts(p.as_ptr(), self.lip_len as usize) })
    }

    pub fn as_info(&self) -> AsInfo {
        self.as_info.get()
    }

    pub(crate) fn set_as_info(&self, info: AsInfo) {
        self.as_info.set(info);
    }

    /// §3.2 invariant: a node with an odd on-disk ID has been referenced
    /// by an out-of-band trace consumer and must survive chaff pruning.
    /// Modeled here as an explicit flag (spec §9) rather than mutating
    /// `persistent_id` itself.
    pub fn is_retained(&self) -> bool {
        self.retained.get()
    }

    pub fn mark_retained(&self) {
        self.retained.set(true);
    }

    /// The parity-trick value written to disk (spec §9): even unless
    /// retained, in which case the low bit is forced on.
    pub fn disk_persistent_id(&self) -> u32 {
        if self.retained.get() {
            self.persistent_id | 1
        } else {
            self.persistent_id
        }
    }

    pub fn parent(&self) -> Option<NonNull<Node>> {
        self.parent.get()
    }

    pub fn first_child(&self) -> Option<NonNull<Node>> {
        self.first_child.get()
    }

    pub fn next_sibling(&self) -> Option<NonNull<Node>> {
        self.next_sibling.get()
    }

    pub fn is_root(&self) -> bool {
        self.parent.get().is_none()
    }

    /// The tail metric-accumulator array. `AtomicU64` rather than plain
    /// `u64` so the increment in §4.6.1's insertion pseudocode
    /// ("atomic-add increment into cursor.metrics[metric_id]") is literal,
    /// even though in practice a thread's own CCT is touched only by that
    /// thread (spec §5 "Shared-resource policy").
    pub fn metrics(&self) -> &[AtomicU64] {
        if self.metric_count == 0 {
            return &[];
        }
        let base_ptr = self as *const Node as *const u8;
        unsafe {
            let metrics_ptr = base_ptr.add(Self::metrics_byte_offset()) as *const AtomicU64;
            std::slice::from_raw_parts(metrics_ptr, self.metric_count as usize)
        }
    }

    pub fn add_metric(&self, index: usize, amount: u64) {
        self.metrics()[index].fetch_add(amount, Ordering::Relaxed);
    }

    pub fn metric_value(&self, index: usize) -> u64 {
        self.metrics()[index].load(Ordering::Relaxed)
    }

    /// Iterate this node's children, outermost-linkage order undefined
    /// (spec §3.2: "insertion order irrelevant; order not observable").
    pub fn children(&self) -> ChildIter {
        ChildIter(self.first_child.get())
    }

    /// §4.6.2: two children are the same identity class iff `(ip, lip,
    /// assoc-class, assoc-path-length)` all agree.
    pub(crate) fn matches(&self, ip: u64, lip: Option<&[u8]>, as_info: AsInfo) -> bool {
        self.ip == ip && self.lip() == lip && self.as_info().same_class(&as_info)
    }
}

pub struct ChildIter(Option<NonNull<Node>>);

impl Iterator for ChildIter {
    type Item = NonNull<Node>;

    fn next(&mut self) -> Option<NonNull<Node>> {
        let cur = self.0?;
        // SAFETY: nodes are never moved or freed while their owning Cct
        // is alive; `next_sibling` was set at construction time.
        self.0 = unsafe { cur.as_ref() }.next_sibling.get();
        Some(cur)
    }
}
