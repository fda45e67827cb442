//! Bottom-up AABB repair.
//!
//! Three flavors: the plain whole-tree refit, the measuring refit that sums
//! how much the bounds metric moved (the tree's volatility signal), and the
//! marking refit that additionally collects refinement candidates at the
//! wavefront where subtree leaf counts drop under the threshold.

use super::node::NodeChild;
use super::Tree;
use crate::bounding_box::BoundingBox;
use crate::collections::quick_list::QuickList;
use crate::memory::buffer_pool::BufferPool;
use glam::Vec3;

impl Tree {
    /// Refits the ancestor chain of a node after its bounds changed.
    pub fn refit_for_node_bounds_change(&self, node_index: i32) {
        // The root's own bounds are implicit in its child records, so the
        // walk stops once the node's record in its parent is updated.
        unsafe {
            let mut node = &*self.nodes.get(node_index);
            let mut metanode = &*self.metanodes.get(node_index);
            while metanode.parent >= 0 {
                let parent = &mut *(self.nodes.as_ptr() as *mut super::node::Node)
                    .add(metanode.parent as usize);
                let child_in_parent = Self::node_child_mut(parent, metanode.index_in_parent);
                BoundingBox::create_merged(
                    node.a.min,
                    node.a.max,
                    node.b.min,
                    node.b.max,
                    &mut child_in_parent.min,
                    &mut child_in_parent.max,
                );
                node = parent;
                metanode = &*self.metanodes.get(metanode.parent);
            }
        }
    }

    fn refit_subtree(&self, node_index: i32, min: &mut Vec3, max: &mut Vec3) {
        unsafe {
            let node =
                &mut *(self.nodes.as_ptr() as *mut super::node::Node).add(node_index as usize);
            if node.a.index >= 0 {
                self.refit_subtree(node.a.index, &mut node.a.min, &mut node.a.max);
            }
            if node.b.index >= 0 {
                self.refit_subtree(node.b.index, &mut node.b.min, &mut node.b.max);
            }
            BoundingBox::create_merged(node.a.min, node.a.max, node.b.min, node.b.max, min, max);
        }
    }

    /// Recomputes every internal bounding box from the leaves.
    pub fn refit(&self) {
        // A tree with one internal node has nothing above the leaves to fix.
        if self.leaf_count <= 2 {
            return;
        }
        let mut root_min = Vec3::ZERO;
        let mut root_max = Vec3::ZERO;
        self.refit_subtree(0, &mut root_min, &mut root_max);
    }

    /// Refits the subtree behind a child record, returning the summed change
    /// in bounds metric across every visited node.
    pub(crate) fn refit_and_measure(&self, child: &mut NodeChild) -> f32 {
        debug_assert!(self.leaf_count >= 2);
        unsafe {
            let node =
                &mut *(self.nodes.as_ptr() as *mut super::node::Node).add(child.index as usize);
            let premetric = Self::bounds_metric(&child.min, &child.max);
            let mut change = 0.0f32;
            if node.a.index >= 0 {
                change += self.refit_and_measure(&mut node.a);
            }
            if node.b.index >= 0 {
                change += self.refit_and_measure(&mut node.b);
            }
            BoundingBox::create_merged(
                node.a.min,
                node.a.max,
                node.b.min,
                node.b.max,
                &mut child.min,
                &mut child.max,
            );
            Self::bounds_metric(&child.min, &child.max) - premetric + change
        }
    }

    /// Measuring refit that also appends refinement candidates: the first
    /// internal node along each path whose subtree leaf count is at or under
    /// `leaf_count_threshold`. Below a candidate the refit continues without
    /// marking.
    pub(crate) fn refit_and_mark(
        &self,
        child: &mut NodeChild,
        leaf_count_threshold: i32,
        refinement_candidates: &mut QuickList<i32>,
        pool: &mut BufferPool,
    ) -> f32 {
        debug_assert!(leaf_count_threshold > 1);
        unsafe {
            let node =
                &mut *(self.nodes.as_ptr() as *mut super::node::Node).add(child.index as usize);
            debug_assert!(self.metanodes.get(child.index).refine_flag == 0);
            let premetric = Self::bounds_metric(&child.min, &child.max);
            let mut change = 0.0f32;

            // The wavefront is the transition from above-threshold to
            // at-or-under-threshold leaf counts.
            if node.a.index >= 0 {
                if node.a.leaf_count <= leaf_count_threshold {
                    refinement_candidates.add(node.a.index, pool);
                    change += self.refit_and_measure(&mut node.a);
                } else {
                    change +=
                        self.refit_and_mark(&mut node.a, leaf_count_threshold, refinement_candidates, pool);
                }
            }
            if node.b.index >= 0 {
                if node.b.leaf_count <= leaf_count_threshold {
                    refinement_candidates.add(node.b.index, pool);
                    change += self.refit_and_measure(&mut node.b);
                } else {
                    change +=
                        self.refit_and_mark(&mut node.b, leaf_count_threshold, refinement_candidates, pool);
                }
            }

            BoundingBox::create_merged(
                node.a.min,
                node.a.max,
                node.b.min,
                node.b.max,
                &mut child.min,
                &mut child.max,
            );
            Self::bounds_metric(&child.min, &child.max) - premetric + change
        }
    }

    /// Whole-tree marking refit for the single-threaded pass. Returns the
    /// root cost-change ratio: summed child metric change over the post-refit
    /// root metric.
    pub(crate) fn refit_and_mark_root(
        &self,
        leaf_count_threshold: i32,
        refinement_candidates: &mut QuickList<i32>,
        pool: &mut BufferPool,
    ) -> f32 {
        debug_assert!(
            self.leaf_count > 2,
            "Refitting a tree of two or fewer leaves does nothing."
        );
        unsafe {
            let children =
                &mut (*(self.nodes.as_ptr() as *mut super::node::Node)).a as *mut NodeChild;
            let mut change = 0.0f32;
            let mut merged = BoundingBox::empty();
            for i in 0..2 {
                let child = &mut *children.add(i);
                if child.index >= 0 {
                    if child.leaf_count <= leaf_count_threshold {
                        refinement_candidates.add(child.index, pool);
                        change += self.refit_and_measure(child);
                    } else {
                        change += self.refit_and_mark(
                            child,
                            leaf_count_threshold,
                            refinement_candidates,
                            pool,
                        );
                    }
                }
                merged.merge_with(&BoundingBox::new(child.min, child.max));
            }

            // The root's own volume is excluded; refinement can't change it.
            let postmetric = Self::bounds_metric(&merged.min, &merged.max);
            if postmetric > 1e-9 {
                change / postmetric
            } else {
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refit_repairs_raw_bounds_writes() {
        let mut pool = BufferPool::new(65536);
        let mut tree = Tree::new(&mut pool, 8);
        for i in 0..8 {
            let center = Vec3::new(i as f32, 0.0, 0.0);
            tree.add(BoundingBox::new(center, center + Vec3::ONE), &mut pool);
        }
        unsafe {
            let (min_pointer, max_pointer) = tree.get_bounds_pointers(3);
            *min_pointer = Vec3::new(40.0, 40.0, 40.0);
            *max_pointer = Vec3::new(41.0, 41.0, 41.0);
        }
        tree.refit();
        tree.validate();
        tree.dispose(&mut pool);
    }

    #[test]
    fn measure_reports_growth() {
        let mut pool = BufferPool::new(65536);
        let mut tree = Tree::new(&mut pool, 8);
        for i in 0..8 {
            let center = Vec3::new(i as f32, 0.0, 0.0);
            tree.add(BoundingBox::new(center, center + Vec3::ONE), &mut pool);
        }
        unsafe {
            let (min_pointer, max_pointer) = tree.get_bounds_pointers(0);
            *min_pointer = Vec3::splat(100.0);
            *max_pointer = Vec3::splat(101.0);
        }
        let mut candidates = QuickList::<i32>::with_capacity(8, &mut pool);
        let change = tree.refit_and_mark_root(2, &mut candidates, &mut pool);
        assert!(change > 0.0);
        tree.validate();
        candidates.dispose(&mut pool);
        tree.dispose(&mut pool);
    }
}
