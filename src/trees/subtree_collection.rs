//! Subtree gathering for treelet rebuilds.
//!
//! A refinement target is rebuilt over a flat set of subtree roots collected
//! by repeatedly expanding the highest-cost internal node until the subtree
//! budget runs out. Nodes flagged as other refinement targets are never
//! expanded; that is the property that keeps concurrently refined treelets
//! slot-disjoint without any cross-worker coordination.

use super::node::Metanode;
use super::Tree;
use crate::collections::quick_list::QuickList;
use crate::memory::buffer::Buffer;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SubtreeHeapEntry {
    pub index: i32,
    pub cost: f32,
}

/// Max-heap over child bounds metric, backed by caller-provided scratch.
pub(crate) struct SubtreeHeap {
    entries: *mut SubtreeHeapEntry,
    count: i32,
}

impl SubtreeHeap {
    pub unsafe fn new(entries: *mut SubtreeHeapEntry) -> Self {
        Self { entries, count: 0 }
    }

    /// Pushes a node's children: internal children sift into the heap by
    /// cost, leaves go straight to the subtree list.
    pub unsafe fn push_children(&mut self, node: &super::node::Node, subtrees: &mut QuickList<i32>) {
        let children = &node.a as *const super::node::NodeChild;
        for child_slot in 0..2 {
            let child = &*children.add(child_slot);
            if child.index < 0 {
                subtrees.add_unsafely(child.index);
                continue;
            }
            let cost = Tree::bounds_metric(&child.min, &child.max);
            let mut hole = self.count;
            self.count += 1;
            while hole > 0 {
                let parent_index = (hole - 1) >> 1;
                let parent = *self.entries.add(parent_index as usize);
                if parent.cost >= cost {
                    break;
                }
                *self.entries.add(hole as usize) = parent;
                hole = parent_index;
            }
            *self.entries.add(hole as usize) = SubtreeHeapEntry {
                index: child.index,
                cost,
            };
        }
    }

    unsafe fn pop(&mut self) -> SubtreeHeapEntry {
        let top = *self.entries;
        self.count -= 1;
        let displaced = *self.entries.add(self.count as usize);

        // Sift the displaced tail entry down from the root.
        let mut hole = 0i32;
        loop {
            let child_a = (hole << 1) + 1;
            let child_b = child_a + 1;
            if child_a >= self.count {
                break;
            }
            let larger = if child_b < self.count
                && (*self.entries.add(child_b as usize)).cost
                    > (*self.entries.add(child_a as usize)).cost
            {
                child_b
            } else {
                child_a
            };
            if displaced.cost >= (*self.entries.add(larger as usize)).cost {
                break;
            }
            *self.entries.add(hole as usize) = *self.entries.add(larger as usize);
            hole = larger;
        }
        *self.entries.add(hole as usize) = displaced;
        top
    }

    /// Pops entries until one is expandable: budget remains and the node is
    /// not another refinement target. Unexpandable pops become subtrees.
    pub unsafe fn try_pop_expandable(
        &mut self,
        metanodes: &Buffer<Metanode>,
        remaining_budget: &mut i32,
        subtrees: &mut QuickList<i32>,
    ) -> Option<i32> {
        while self.count > 0 {
            let entry = self.pop();
            if *remaining_budget >= 1 && metanodes.get(entry.index).refine_flag == 0 {
                *remaining_budget -= 1;
                return Some(entry.index);
            }
            subtrees.add_unsafely(entry.index);
        }
        None
    }

    /// Drains whatever the budget left unexpanded into the subtree list.
    pub unsafe fn drain_into(&mut self, subtrees: &mut QuickList<i32>) {
        for i in 0..self.count {
            subtrees.add_unsafely((*self.entries.add(i as usize)).index);
        }
        self.count = 0;
    }
}

impl Tree {
    /// Collects up to `maximum_subtrees` subtree roots under `node_index`,
    /// expanding highest-cost nodes first. Children are always taken
    /// together; a node is either fully expanded or kept whole as a subtree.
    /// Expanded nodes' slots land in `internal_slots`, sorted ascending so
    /// the depth-first reification reuses them in a cache-friendlier order.
    pub(crate) unsafe fn collect_subtrees(
        &self,
        node_index: i32,
        maximum_subtrees: i32,
        heap_entries: *mut SubtreeHeapEntry,
        subtrees: &mut QuickList<i32>,
        internal_slots: &mut QuickList<i32>,
    ) {
        debug_assert!(
            maximum_subtrees >= 2,
            "A node's children are only collected together; the budget must cover both."
        );
        let node = self.nodes.get(node_index);
        let mut heap = SubtreeHeap::new(heap_entries);
        heap.push_children(node, subtrees);

        // The treelet root's own slot is reused implicitly and does not count
        // against the budget.
        let mut remaining_budget = maximum_subtrees - heap.count - subtrees.count;
        while let Some(expanded) =
            heap.try_pop_expandable(&self.metanodes, &mut remaining_budget, subtrees)
        {
            internal_slots.add_unsafely(expanded);
            heap.push_children(self.nodes.get(expanded), subtrees);
        }
        heap.drain_into(subtrees);

        internal_slots.as_slice_mut().sort_unstable();
    }
}
