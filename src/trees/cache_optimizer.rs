//! Node slot reordering for traversal locality.
//!
//! A depth-first-ordered node array turns tree traversal into a near-linear
//! memory scan: child A of the node in slot n lives in slot n + 1 and child B
//! starts at n + a.leaf_count. Refinement and insertion scramble that order;
//! the incremental optimizer swaps slots back toward it a little at a time.
//!
//! The incremental variant is safe to call from multiple workers. Every slot
//! an operation would touch is locked first by a compare-and-swap on its
//! metanode's refine flag (all flags are zero in this phase of the frame);
//! if any lock fails the operation releases what it took and skips. Skipped
//! slots are simply revisited on a later frame.

use super::node::{Metanode, Node};
use super::Tree;
use std::sync::atomic::{AtomicI32, Ordering};

/// Worst case lock set of one child swap: the moved child, the occupant, the
/// occupant's parent, and both swapped nodes' internal children.
const MAXIMUM_LOCKS: usize = 7;

struct LockSet {
    indices: [i32; MAXIMUM_LOCKS],
    count: usize,
    /// Lock held by the caller; treated as acquired, never released here.
    held: i32,
}

impl Tree {
    #[inline(always)]
    unsafe fn refine_flag_atomic(&self, node_index: i32) -> &AtomicI32 {
        let flag = &mut (*(self.metanodes.as_ptr() as *mut Metanode).add(node_index as usize))
            .refine_flag;
        AtomicI32::from_ptr(flag as *mut i32)
    }

    #[inline(always)]
    unsafe fn try_lock_metanode(&self, node_index: i32) -> bool {
        self.refine_flag_atomic(node_index)
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline(always)]
    unsafe fn unlock_metanode(&self, node_index: i32) {
        self.refine_flag_atomic(node_index).store(0, Ordering::Release);
    }

    /// Acquires a node's lock unless it is already covered by the set.
    unsafe fn try_lock_unique(&self, node_index: i32, locks: &mut LockSet) -> bool {
        if node_index == locks.held || locks.indices[..locks.count].contains(&node_index) {
            return true;
        }
        if !self.try_lock_metanode(node_index) {
            return false;
        }
        debug_assert!(locks.count < MAXIMUM_LOCKS);
        locks.indices[locks.count] = node_index;
        locks.count += 1;
        true
    }

    unsafe fn release_locks(&self, locks: &LockSet) {
        for i in 0..locks.count {
            self.unlock_metanode(locks.indices[i]);
        }
    }

    /// Swaps the contents of two node slots, patching both parents' child
    /// indices and every child's back reference. The caller must guarantee
    /// exclusive access to both slots, both parents, and all children.
    fn swap_nodes(&mut self, index_a: i32, index_b: i32) {
        debug_assert!(index_a != index_b);
        unsafe {
            let nodes = self.nodes.as_ptr() as *mut Node;
            let metanodes = self.metanodes.as_ptr() as *mut Metanode;
            std::ptr::swap(nodes.add(index_a as usize), nodes.add(index_b as usize));
            std::ptr::swap(metanodes.add(index_a as usize), metanodes.add(index_b as usize));

            let meta_a = &mut *metanodes.add(index_a as usize);
            let meta_b = &mut *metanodes.add(index_b as usize);
            if meta_a.parent == index_a {
                // The node now at A was a child of the node now at B.
                meta_a.parent = index_b;
            } else if meta_b.parent == index_b {
                meta_b.parent = index_a;
            }
            let (parent_a, slot_a) = (meta_a.parent, meta_a.index_in_parent);
            let (parent_b, slot_b) = (meta_b.parent, meta_b.index_in_parent);

            // Parents first: a stale parent-held child record would otherwise
            // feed the child relink loop below the old indices.
            Self::node_child_mut(&mut *nodes.add(parent_a as usize), slot_a).index = index_a;
            Self::node_child_mut(&mut *nodes.add(parent_b as usize), slot_b).index = index_b;

            for slot in 0..2i32 {
                let child_index = Self::node_child(&*nodes.add(index_a as usize), slot).index;
                self.set_child_link(child_index, index_a, slot);
            }
            for slot in 0..2i32 {
                let child_index = Self::node_child(&*nodes.add(index_b as usize), slot).index;
                self.set_child_link(child_index, index_b, slot);
            }
        }
    }

    /// Attempts to move `child_index` (a child of the locked `parent_index`)
    /// into `target_index` by swapping with the occupant. Skips silently on
    /// lock contention.
    unsafe fn try_swap_child_into_slot(
        &mut self,
        parent_index: i32,
        child_index: i32,
        target_index: i32,
    ) {
        debug_assert!(child_index >= 0 && child_index != target_index);
        debug_assert!(target_index > 0 && target_index < self.node_count);

        let mut locks = LockSet {
            indices: [-1; MAXIMUM_LOCKS],
            count: 0,
            held: parent_index,
        };
        // The child and the occupant, then the occupant's parent (stable now
        // that the occupant is locked), then everything whose back reference
        // the swap will rewrite.
        let mut acquired = self.try_lock_unique(child_index, &mut locks)
            && self.try_lock_unique(target_index, &mut locks);
        if acquired {
            let target_parent = self.metanodes.get(target_index).parent;
            acquired = self.try_lock_unique(target_parent, &mut locks);
        }
        if acquired {
            for node_index in [child_index, target_index] {
                let node = *self.nodes.get(node_index);
                for slot in 0..2 {
                    let grandchild = Self::node_child(&node, slot).index;
                    if grandchild >= 0 && !self.try_lock_unique(grandchild, &mut locks) {
                        acquired = false;
                        break;
                    }
                }
                if !acquired {
                    break;
                }
            }
        }
        if acquired {
            self.swap_nodes(child_index, target_index);
        }
        // Locks travel with the indices, not the swapped contents; every
        // acquired slot still holds a 1 regardless of the swap.
        self.release_locks(&locks);
    }

    /// Nudges the children of `node_index` toward their depth-first slots.
    /// Safe to call from multiple workers; contended slots are skipped.
    ///
    /// A full ascending sweep over every slot with no contention leaves the
    /// array exactly in depth-first order.
    pub fn incremental_cache_optimize(&mut self, node_index: i32) {
        if self.leaf_count <= 2 {
            return;
        }
        debug_assert!(node_index >= 0 && node_index < self.node_count);
        unsafe {
            if !self.try_lock_metanode(node_index) {
                return;
            }
            let node = *self.nodes.get(node_index);
            let target_a = node_index + 1;
            if node.a.index >= 0 && target_a < self.node_count && node.a.index != target_a {
                self.try_swap_child_into_slot(node_index, node.a.index, target_a);
            }
            // Child A's swap may have rewritten this node's records.
            let node = *self.nodes.get(node_index);
            let target_b = node_index + node.a.leaf_count;
            if node.b.index >= 0 && target_b < self.node_count && node.b.index != target_b {
                self.try_swap_child_into_slot(node_index, node.b.index, target_b);
            }
            self.unlock_metanode(node_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounding_box::BoundingBox;
    use crate::memory::buffer_pool::BufferPool;
    use glam::Vec3;

    fn build_scrambled_tree(pool: &mut BufferPool, leaf_count: i32) -> Tree {
        let mut tree = Tree::new(pool, leaf_count);
        for i in 0..leaf_count {
            let center = Vec3::new(
                (i * 37 % 61) as f32,
                (i * 17 % 41) as f32,
                (i * 11 % 29) as f32,
            );
            tree.add(BoundingBox::new(center, center + Vec3::ONE), pool);
        }
        tree
    }

    #[test]
    fn ascending_sweep_reaches_depth_first_order() {
        let mut pool = BufferPool::new(1 << 20);
        let mut tree = build_scrambled_tree(&mut pool, 300);
        tree.validate();
        for i in 0..tree.node_count {
            tree.incremental_cache_optimize(i);
        }
        tree.validate();
        assert_eq!(tree.measure_cache_quality(), 1.0);
        // Every flag released.
        for i in 0..tree.node_count {
            assert_eq!(tree.metanodes.get(i).refine_flag, 0);
        }
        tree.dispose(&mut pool);
    }

    #[test]
    fn single_step_places_child_a() {
        let mut pool = BufferPool::new(1 << 20);
        let mut tree = build_scrambled_tree(&mut pool, 64);
        tree.incremental_cache_optimize(0);
        let root = tree.nodes.get(0);
        if root.a.index >= 0 {
            assert_eq!(root.a.index, 1);
        }
        tree.validate();
        tree.dispose(&mut pool);
    }
}
