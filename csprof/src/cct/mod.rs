//! The Calling-Context Tree engine (C6, spec §4.6).

pub mod node;

use std::ptr::NonNull;

use csprof_unwind::{AsInfo, Assoc, Frame};
use rustc_hash::FxHashMap;

use crate::arena::PersistentArena;
use crate::ids::PersistentIdCounter;
use crate::metric::MetricId;
pub use node::Node;

/// One entry of a thread's creation-context chain (spec §3.6): a
/// read-only-on-the-creator-side duplicate of one node along the
/// creator's CCT path, owned by the child thread.
#[derive(Debug, Clone)]
pub struct ContextChainEntry {
    pub ip: u64,
    pub sp: u64,
    pub as_info: AsInfo,
    pub lip: Option<Vec<u8>>,
    pub persistent_id: u32,
}

/// A single thread's Calling-Context Tree: a persistent arena, the
/// synthetic root, and a running node count (spec §3.2, §4.4 `csdata`).
pub struct Cct {
    arena: PersistentArena,
    root: NonNull<Node>,
    node_count: u64,
    metric_width: usize,
    pub epoch_id: u32,
}

impl Cct {
    /// Build a fresh CCT with only its synthetic root, bound to `epoch_id`.
    pub fn new(metric_width: usize, epoch_id: u32, ids: &PersistentIdCounter) -> Self {
        let mut arena = PersistentArena::new(crate::arena::DEFAULT_SEGMENT_SIZE);
        let root = Self::raw_new_node(
            &mut arena,
            None,
            0,
            0,
            AsInfo::PHYSICAL_ONLY,
            None,
            epoch_id,
            ids,
            metric_width,
        );
        Cct {
            arena,
            root,
            node_count: 1,
            metric_width,
            epoch_id,
        }
    }

    pub fn root(&self) -> NonNull<Node> {
        self.root
    }

    pub fn node_count(&self) -> u64 {
        self.node_count
    }

    pub fn metric_width(&self) -> usize {
        self.metric_width
    }

    pub fn reserved_bytes(&self) -> usize {
        self.arena.reserved_bytes()
    }

    fn raw_new_node(
        arena: &mut PersistentArena,
        parent: Option<NonNull<Node>>,
        ip: u64,
        sp: u64,
        as_info: AsInfo,
        lip: Option<&[u8]>,
        epoch_id: u32,
        ids: &PersistentIdCounter,
        metric_width: usize,
    ) -> NonNull<Node> {
        let size = Node::alloc_size(metric_width);
        let raw = arena.alloc(size).cast::<Node>();

        let lip_storage = lip.map(|bytes| {
            let ptr = arena.alloc(bytes.len().max(1));
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
            }
            (ptr, bytes.len() as u32)
        });

        let node = Node::new(
            parent,
            ip,
            sp,
            as_info,
            lip_storage,
            ids.next(),
            epoch_id,
            metric_width as u32,
        );
        // SAFETY: `raw` is a fresh, correctly-sized, 8-byte-aligned
        // allocation from the arena; nothing else observes it until this
        // write completes. The metric accumulator tail is backed by the
        // arena's freshly allocated `vec![0u8; ...]` memory, so the
        // `AtomicU64`s there are already zero-valued.
        unsafe {
            raw.as_ptr().write(node);
        }

        if let Some(parent) = parent {
            let parent_ref = unsafe { parent.as_ref() };
            let node_ref = unsafe { raw.as_ref() };
            node_ref.next_sibling.set(parent_ref.first_child.get());
            parent_ref.first_child.set(Some(raw));
        }

        raw
    }

    fn new_node(&mut self, parent: NonNull<Node>, frame: &Frame, ids: &PersistentIdCounter) -> NonNull<Node> {
        let node = Self::raw_new_node(
            &mut self.arena,
            Some(parent),
            frame.ip,
            frame.sp,
            frame.as_info,
            frame.lip.as_deref(),
            self.epoch_id,
            ids,
            self.metric_width,
        );
        self.node_count += 1;
        node
    }

    /// §4.6.1 `find_child`: a linear scan of the parent's child list,
    /// keyed by the 4-tuple in §4.6.2.
    fn find_child(parent: NonNull<Node>, frame: &Frame) -> Option<NonNull<Node>> {
        let parent_ref = unsafe { parent.as_ref() };
        parent_ref
            .children()
            .find(|&c| unsafe { c.as_ref() }.matches(frame.ip, frame.lip.as_deref(), frame.as_info))
    }

    /// §4.6.1: insert a backtrace (innermost-first) starting from `start`,
    /// crediting `sample_count` onto the leaf's `metric_id` accumulator.
    /// Returns the leaf node, which becomes the new `state.treenode`.
    pub fn insert_backtrace(
        &mut self,
        start: NonNull<Node>,
        frames_innermost_first: &[Frame],
        metric_id: MetricId,
        sample_count: u64,
        ids: &PersistentIdCounter,
    ) -> NonNull<Node> {
        let mut cursor = start;
        let mut i = frames_innermost_first.len();
        while i > 0 {
            i -= 1;
            let frame = &frames_innermost_first[i];
            match Self::find_child(cursor, frame) {
                Some(child) => {
                    if frame.as_info.assoc == Assoc::OneToOne {
                        let child_ref = unsafe { child.as_ref() };
                        let mut info = child_ref.as_info();
                        if info.assoc != Assoc::OneToOne {
                            info.promote_to_one_to_one();
                            child_ref.set_as_info(info);
                        }
                    }
                    cursor = child;
                }
                None => {
                    // Create a node for this frame and every remaining
                    // (inward) frame in one pass (spec §4.6.1).
                    let mut j = i;
                    loop {
                        cursor = self.new_node(cursor, &frames_innermost_first[j], ids);
                        if j == 0 {
                            break;
                        }
                        j -= 1;
                    }
                    break;
                }
            }
        }
        unsafe { cursor.as_ref() }.add_metric(metric_id.0, sample_count);
        cursor
    }

    /// §4.6.3: snapshot the creator's CCT path from its current cursor up
    /// to (but excluding) the synthetic root, duplicating identity into
    /// fresh, independently-owned entries for the new thread. Read-only on
    /// the creator side. Returned outermost-first, matching the order
    /// `fresh_cct`'s root's `parent_id` chain expects at serialization
    /// (spec §4.8).
    pub fn snapshot_creation_context(
        from: NonNull<Node>,
        ids: &PersistentIdCounter,
    ) -> Vec<ContextChainEntry> {
        let mut path = Vec::new();
        let mut cur = Some(from);
        while let Some(n) = cur {
            let node = unsafe { n.as_ref() };
            if node.is_root() {
                break;
            }
            path.push(ContextChainEntry {
                ip: node.ip,
                sp: node.sp,
                as_info: node.as_info(),
                lip: node.lip().map(|s| s.to_vec()),
                persistent_id: ids.next(),
            });
            cur = node.parent();
        }
        path.reverse();
        path
    }

    /// §4.6.4: replace sparse on-disk persistent IDs with a dense preorder
    /// numbering starting at 1. Returns a map from each node's
    /// [`Node::disk_persistent_id`] to its dense ID; this is a pure
    /// function of the tree's current shape, so calling it twice in a row
    /// (without mutating the tree in between) yields the same numbering,
    /// satisfying idempotence (spec §8 R2).
    ///
    /// Canonical sibling order: the original keys siblings by
    /// `(structure_id, type, dyn_info, node_id)`, which are binary-
    /// structure-tree concepts this core doesn't model (spec only defines
    /// the frame identity in §3.1–§3.2). `(ip, lip, persistent_id)` is
    /// used here as the closest available deterministic substitute; see
    /// DESIGN.md.
    pub fn assign_dense_ids(&self) -> FxHashMap<u32, u32> {
        let mut map = FxHashMap::default();
        let mut next_id = 1u32;
        self.visit_preorder(self.root, &mut next_id, &mut map);
        map
    }

    fn visit_preorder(&self, node: NonNull<Node>, next_id: &mut u32, map: &mut FxHashMap<u32, u32>) {
        let n = unsafe { node.as_ref() };
        map.insert(n.disk_persistent_id(), *next_id);
        *next_id += 1;
        let mut children: Vec<NonNull<Node>> = n.children().collect();
        children.sort_by(|a, b| Self::canonical_key(*a).cmp(&Self::canonical_key(*b)));
        for child in children {
            self.visit_preorder(child, next_id, map);
        }
    }

    fn canonical_key(node: NonNull<Node>) -> (u64, Vec<u8>, u32) {
        let n = unsafe { node.as_ref() };
        (n.ip, n.lip().unwrap_or(&[]).to_vec(), n.persistent_id)
    }

    /// Preorder traversal used by the serializer: `(node, parent_dense_id)`
    /// pairs, parent-before-child (spec §4.8 "A child appears after its
    /// parent").
    pub fn preorder_with_parents(&self, dense_ids: &FxHashMap<u32, u32>) -> Vec<(NonNull<Node>, u32)> {
        let mut out = Vec::with_capacity(self.node_count as usize);
        self.collect_preorder(self.root, 0, dense_ids, &mut out);
        out
    }

    fn collect_preorder(
        &self,
        node: NonNull<Node>,
        parent_dense_id: u32,
        dense_ids: &FxHashMap<u32, u32>,
        out: &mut Vec<(NonNull<Node>, u32)>,
    ) {
        let n = unsafe { node.as_ref() };
        let my_dense_id = dense_ids[&n.disk_persistent_id()];
        out.push((node, parent_dense_id));
        let mut children: Vec<NonNull<Node>> = n.children().collect();
        children.sort_by(|a, b| Self::canonical_key(*a).cmp(&Self::canonical_key(*b)));
        for child in children {
            self.collect_preorder(child, my_dense_id, dense_ids, out);
        }
    }

    /// Prune "chaff": leaf nodes with no accumulated metric weight and no
    /// odd (retained) on-disk ID, repeating bottom-up until no more
    /// qualify (spec §8 invariant 5). Returns the number of nodes removed.
    /// Pruning only unlinks nodes from the sibling chain; their arena
    /// memory is reclaimed in bulk at teardown like everything else.
    pub fn prune_chaff(&mut self) -> u64 {
        let mut pruned = 0u64;
        let mut changed = true;
        while changed {
            changed = false;
            self.prune_children(self.root, &mut changed, &mut pruned);
        }
        self.node_count -= pruned;
        pruned
    }

    fn prune_children(&self, parent: NonNull<Node>, changed: &mut bool, pruned: &mut u64) {
        let parent_ref = unsafe { parent.as_ref() };
        for child in parent_ref.children() {
            self.prune_children(child, changed, pruned);
        }

        let mut prev: Option<NonNull<Node>> = None;
        let mut cur = parent_ref.first_child.get();
        while let Some(node) = cur {
            let node_ref = unsafe { node.as_ref() };
            let next = node_ref.next_sibling.get();
            let is_leaf = node_ref.first_child.get().is_none();
            let is_empty = node_ref.metrics().iter().all(|m| m.load(std::sync::atomic::Ordering::Relaxed) == 0);
            if is_leaf && is_empty && !node_ref.is_retained() {
                match prev {
                    Some(p) => unsafe { p.as_ref() }.next_sibling.set(next),
                    None => parent_ref.first_child.set(next),
                }
                *changed = true;
                *pruned += 1;
            } else {
                prev = Some(node);
            }
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csprof_unwind::AsInfo;

    fn frame(ip: u64) -> Frame {
        Frame::physical(ip, ip * 16)
    }

    #[test]
    fn scenario_1_linear_stack() {
        let ids = PersistentIdCounter::new();
        let mut cct = Cct::new(1, 1, &ids);
        // innermost-first: bar, foo, main
        let frames = vec![frame(0x400700), frame(0x400600), frame(0x400500)];
        let leaf = cct.insert_backtrace(cct.root(), &frames, MetricId(0), 1, &ids);
        assert_eq!(cct.node_count(), 4);
        let leaf_ref = unsafe { leaf.as_ref() };
        assert_eq!(leaf_ref.ip, 0x400700);
        assert_eq!(leaf_ref.persistent_id % 2, 0);
        assert_eq!(leaf_ref.metric_value(0), 1);
    }

    #[test]
    fn scenario_2_shared_prefix() {
        let ids = PersistentIdCounter::new();
        let mut cct = Cct::new(1, 1, &ids);
        let frames1 = vec![frame(0x400700), frame(0x400600), frame(0x400500)];
        cct.insert_backtrace(cct.root(), &frames1, MetricId(0), 1, &ids);
        let frames2 = vec![frame(0x400800), frame(0x400600), frame(0x400500)];
        cct.insert_backtrace(cct.root(), &frames2, MetricId(0), 1, &ids);

        assert_eq!(cct.node_count(), 5);
        let root_ref = unsafe { cct.root().as_ref() };
        assert_eq!(root_ref.metric_value(0), 0, "metrics are credited only to the leaf");

        let main = root_ref.children().next().unwrap();
        let foo = unsafe { main.as_ref() }.children().next().unwrap();
        let foo_children: Vec<_> = unsafe { foo.as_ref() }.children().collect();
        assert_eq!(foo_children.len(), 2);
    }

    #[test]
    fn repeated_insertion_creates_single_path() {
        let ids = PersistentIdCounter::new();
        let mut cct = Cct::new(1, 1, &ids);
        let frames = vec![frame(0x400700), frame(0x400600), frame(0x400500)];
        for _ in 0..5 {
            cct.insert_backtrace(cct.root(), &frames, MetricId(0), 1, &ids);
        }
        assert_eq!(cct.node_count(), 4);
        let main = unsafe { cct.root().as_ref() }.children().next().unwrap();
        let foo = unsafe { main.as_ref() }.children().next().unwrap();
        let bar = unsafe { foo.as_ref() }.children().next().unwrap();
        assert_eq!(unsafe { bar.as_ref() }.metric_value(0), 5);
    }

    #[test]
    fn one_to_one_promotes_existing_child() {
        let ids = PersistentIdCounter::new();
        let mut cct = Cct::new(1, 1, &ids);
        let weak = Frame {
            ip: 0x1234,
            sp: 0,
            as_info: AsInfo {
                assoc: Assoc::ManyToOne,
                len_logical: 1,
                len_physical: 2,
            },
            lip: None,
        };
        cct.insert_backtrace(cct.root(), &[weak.clone()], MetricId(0), 1, &ids);
        let strong = Frame {
            as_info: AsInfo::PHYSICAL_ONLY,
            ..weak
        };
        cct.insert_backtrace(cct.root(), &[strong], MetricId(0), 1, &ids);
        assert_eq!(cct.node_count(), 2, "same site, must not duplicate");
        let child = unsafe { cct.root().as_ref() }.children().next().unwrap();
        assert_eq!(unsafe { child.as_ref() }.as_info().assoc, Assoc::OneToOne);
    }

    #[test]
    fn dense_ids_are_idempotent_and_preorder() {
        let ids = PersistentIdCounter::new();
        let mut cct = Cct::new(1, 1, &ids);
        let frames = vec![frame(0x400700), frame(0x400600), frame(0x400500)];
        cct.insert_backtrace(cct.root(), &frames, MetricId(0), 1, &ids);
        let first = cct.assign_dense_ids();
        let second = cct.assign_dense_ids();
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
        let root_id = unsafe { cct.root().as_ref() }.disk_persistent_id();
        assert_eq!(first[&root_id], 1);
    }

    #[test]
    fn chaff_pruning_removes_only_empty_unretained_leaves() {
        let ids = PersistentIdCounter::new();
        let mut cct = Cct::new(1, 1, &ids);
        let frames = vec![frame(0x400700), frame(0x400600)];
        cct.insert_backtrace(cct.root(), &frames, MetricId(0), 1, &ids);
        // A second, never-credited leaf under the same parent.
        let foo = unsafe { cct.root().as_ref() }.children().next().unwrap();
        let ids2 = PersistentIdCounter::new();
        let empty_frame = Frame::physical(0x9999, 0);
        cct.new_node(foo, &empty_frame, &ids2);
        assert_eq!(cct.node_count(), 4);

        let pruned = cct.prune_chaff();
        assert_eq!(pruned, 1);
        assert_eq!(cct.node_count(), 3);
    }
}
