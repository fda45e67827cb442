//! Incremental leaf insertion.
//!
//! Insertion descends toward the child whose bounds metric grows least and
//! splits a leaf slot at the bottom with a freshly allocated node. Insertion
//! order decides tree quality; the rotating variants spend a little work per
//! add to keep pathological orders from producing degenerate trees, and the
//! per-frame refinement pass cleans up the rest over time.

use super::node::NodeChild;
use super::Tree;
use crate::bounding_box::BoundingBox;
use crate::memory::buffer_pool::BufferPool;
use glam::Vec3;

/// Local restructuring applied along the insertion path.
#[derive(Clone, Copy, PartialEq, Eq)]
enum InsertionRotation {
    None,
    TopDown,
    BottomUp,
}

#[inline(always)]
fn merged_bounds(a: &NodeChild, b: &NodeChild) -> (Vec3, Vec3) {
    (a.min.min(b.min), a.max.max(b.max))
}

#[inline(always)]
fn merged_metric(a: &NodeChild, b: &NodeChild) -> f32 {
    let (min, max) = merged_bounds(a, b);
    Tree::bounds_metric(&min, &max)
}

#[inline(always)]
fn leaf_child(bounds: &BoundingBox, leaf_index: i32) -> NodeChild {
    NodeChild {
        min: bounds.min,
        index: Tree::encode(leaf_index),
        max: bounds.max,
        leaf_count: 1,
    }
}

impl Tree {
    /// Points a child (node or leaf) back at its new parent slot.
    #[inline(always)]
    pub(crate) fn set_child_link(&mut self, child_index: i32, parent: i32, index_in_parent: i32) {
        if child_index < 0 {
            *self.leaves.get_mut(Self::encode(child_index)) =
                super::Leaf::new(parent, index_in_parent);
        } else {
            let metanode = self.metanodes.get_mut(child_index);
            metanode.parent = parent;
            metanode.index_in_parent = index_in_parent;
        }
    }

    /// Adds a leaf and returns its index. No rotations; cheapest per add, but
    /// quality is fully at the mercy of insertion order.
    pub fn add_without_refinement(&mut self, bounds: BoundingBox, pool: &mut BufferPool) -> i32 {
        self.add_internal(bounds, pool, InsertionRotation::None)
    }

    /// Adds a leaf and returns its index, applying cost-reducing rotations on
    /// the way down.
    pub fn add(&mut self, bounds: BoundingBox, pool: &mut BufferPool) -> i32 {
        self.add_internal(bounds, pool, InsertionRotation::TopDown)
    }

    /// Adds a leaf and returns its index, applying rotations from the
    /// insertion point back up. Slightly better quality than [`Tree::add`],
    /// slightly more expensive.
    pub fn add_with_bottom_up_refinement(&mut self, bounds: BoundingBox, pool: &mut BufferPool) -> i32 {
        self.add_internal(bounds, pool, InsertionRotation::BottomUp)
    }

    fn add_internal(&mut self, bounds: BoundingBox, pool: &mut BufferPool, rotation: InsertionRotation) -> i32 {
        // Grow up front; resizing mid-descent would invalidate node pointers.
        if self.leaves.len() == self.leaf_count {
            self.resize(pool, self.leaf_count + 1);
        }

        if self.leaf_count < 2 {
            // The root still has an open slot.
            let slot = self.leaf_count;
            let leaf_index = self.add_leaf(0, slot);
            unsafe {
                let root = &mut *self.nodes.as_mut_ptr();
                *Self::node_child_mut(root, slot) = leaf_child(&bounds, leaf_index);
            }
            return leaf_index;
        }

        let new_node_index = self.allocate_node();
        // The new leaf always lands in child A of the new node, so its
        // pointer can be written before the node is linked in.
        let new_leaf_index = self.add_leaf(new_node_index, 0);

        let mut node_index = 0;
        let inserted = leaf_child(&bounds, new_leaf_index);
        loop {
            if rotation == InsertionRotation::TopDown {
                self.try_rotate_node(node_index);
            }
            unsafe {
                let node = &mut *self.nodes.as_mut_ptr().add(node_index as usize);

                let (merged_min_a, merged_max_a) = merged_bounds(&inserted, &node.a);
                let (merged_min_b, merged_max_b) = merged_bounds(&inserted, &node.b);
                let increase_a = Self::bounds_metric(&merged_min_a, &merged_max_a)
                    - Self::bounds_metric(&node.a.min, &node.a.max);
                let increase_b = Self::bounds_metric(&merged_min_b, &merged_max_b)
                    - Self::bounds_metric(&node.b.min, &node.b.max);
                let use_a = if increase_a == increase_b {
                    node.a.leaf_count < node.b.leaf_count
                } else {
                    increase_a < increase_b
                };
                let (slot, merged_min, merged_max) = if use_a {
                    (0, merged_min_a, merged_max_a)
                } else {
                    (1, merged_min_b, merged_max_b)
                };

                let child = Self::node_child_mut(node, slot);
                if child.leaf_count == 1 {
                    // The chosen slot holds a single leaf; push it down into
                    // the preallocated node next to the inserted leaf.
                    let displaced = *child;
                    child.min = merged_min;
                    child.max = merged_max;
                    child.index = new_node_index;
                    child.leaf_count = 2;

                    let new_node = &mut *self.nodes.as_mut_ptr().add(new_node_index as usize);
                    new_node.a = inserted;
                    new_node.b = displaced;
                    let metanode = self.metanodes.get_mut(new_node_index);
                    metanode.parent = node_index;
                    metanode.index_in_parent = slot;
                    self.set_child_link(displaced.index, new_node_index, 1);
                    break;
                } else {
                    child.min = merged_min;
                    child.max = merged_max;
                    child.leaf_count += 1;
                    node_index = child.index;
                }
            }
        }

        if rotation == InsertionRotation::BottomUp {
            let mut ancestor = self.leaves.get(new_leaf_index).node_index();
            while ancestor >= 0 {
                self.try_rotate_node(ancestor);
                ancestor = self.metanodes.get(ancestor).parent;
            }
        }

        new_leaf_index
    }

    /// Applies whichever single rotation at this node lowers the bounds
    /// metric most, if any does.
    fn try_rotate_node(&mut self, root_index: i32) {
        unsafe {
            let nodes = self.nodes.as_mut_ptr();
            let root = &mut *nodes.add(root_index as usize);

            // A "right" rotation lifts one grandchild out of child A, pairing
            // the other with child B in a deeper node; "left" mirrors it.
            let mut right_change = 0.0f32;
            let mut right_keeps_a = false;
            if root.a.index >= 0 {
                let a = &*nodes.add(root.a.index as usize);
                let keep_aa = merged_metric(&a.a, &root.b);
                let keep_ab = merged_metric(&a.b, &root.b);
                right_keeps_a = keep_aa < keep_ab;
                right_change = keep_aa.min(keep_ab) - Self::bounds_metric(&root.a.min, &root.a.max);
            }
            let mut left_change = 0.0f32;
            let mut left_keeps_a = false;
            if root.b.index >= 0 {
                let b = &*nodes.add(root.b.index as usize);
                let keep_ba = merged_metric(&root.a, &b.a);
                let keep_bb = merged_metric(&root.a, &b.b);
                left_keeps_a = keep_ba < keep_bb;
                left_change = keep_ba.min(keep_bb) - Self::bounds_metric(&root.b.min, &root.b.max);
            }

            if left_change.min(right_change) >= 0.0 {
                return;
            }
            if left_change < right_change {
                let replaced_index = root.b.index;
                let replaced = &mut *nodes.add(replaced_index as usize);
                let (kept, shifted_up) = if left_keeps_a {
                    (replaced.a, replaced.b)
                } else {
                    (replaced.b, replaced.a)
                };
                replaced.a = root.a;
                replaced.b = kept;
                let mut merged = NodeChild {
                    min: Vec3::ZERO,
                    index: replaced_index,
                    max: Vec3::ZERO,
                    leaf_count: replaced.a.leaf_count + replaced.b.leaf_count,
                };
                BoundingBox::create_merged(
                    replaced.a.min,
                    replaced.a.max,
                    replaced.b.min,
                    replaced.b.max,
                    &mut merged.min,
                    &mut merged.max,
                );
                let (child_a_index, child_b_index) = (replaced.a.index, replaced.b.index);
                root.a = merged;
                root.b = shifted_up;
                self.set_child_link(replaced_index, root_index, 0);
                self.set_child_link(shifted_up.index, root_index, 1);
                self.set_child_link(child_a_index, replaced_index, 0);
                self.set_child_link(child_b_index, replaced_index, 1);
            } else {
                let replaced_index = root.a.index;
                let replaced = &mut *nodes.add(replaced_index as usize);
                let (kept, shifted_up) = if right_keeps_a {
                    (replaced.a, replaced.b)
                } else {
                    (replaced.b, replaced.a)
                };
                replaced.a = kept;
                replaced.b = root.b;
                let mut merged = NodeChild {
                    min: Vec3::ZERO,
                    index: replaced_index,
                    max: Vec3::ZERO,
                    leaf_count: replaced.a.leaf_count + replaced.b.leaf_count,
                };
                BoundingBox::create_merged(
                    replaced.a.min,
                    replaced.a.max,
                    replaced.b.min,
                    replaced.b.max,
                    &mut merged.min,
                    &mut merged.max,
                );
                let (child_a_index, child_b_index) = (replaced.a.index, replaced.b.index);
                root.b = merged;
                root.a = shifted_up;
                self.set_child_link(replaced_index, root_index, 1);
                self.set_child_link(shifted_up.index, root_index, 0);
                self.set_child_link(child_a_index, replaced_index, 0);
                self.set_child_link(child_b_index, replaced_index, 1);
            }
        }
    }
}
