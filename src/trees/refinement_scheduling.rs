//! Refinement and cache-optimization scheduling.
//!
//! Tuning functions decide how much repair work a frame buys. All of them are
//! pure functions of their inputs: reruns of the same frame over the same
//! tree must select the same targets.

use super::Tree;
use crate::collections::quick_list::QuickList;
use crate::memory::buffer_pool::BufferPool;

impl Tree {
    /// Sizing for the refit-and-mark phase: treelet subtree cap, an estimate
    /// of how many candidates marking will find, and the wavefront leaf-count
    /// threshold.
    pub(crate) fn refit_and_mark_tuning(&self) -> (i32, i32, i32) {
        let maximum_subtrees = ((self.leaf_count as f64).sqrt() * 3.0) as i32;
        let estimated_candidate_count = (self.leaf_count * 2) / maximum_subtrees.max(1);
        let refinement_leaf_count_threshold = self.leaf_count.min(maximum_subtrees);
        (
            maximum_subtrees,
            estimated_candidate_count,
            refinement_leaf_count_threshold,
        )
    }

    /// Chooses how many refinement targets to take this frame and the stride
    /// with which to sample them out of the candidate set.
    ///
    /// `cost_change` is the root cost-change ratio reported by refit; a
    /// volatile tree buys more refinement. Returns
    /// `(target_count, period, offset)`.
    pub(crate) fn refine_tuning(
        &self,
        frame_index: i32,
        refinement_candidates_count: i32,
        aggressiveness_scale: f32,
        cost_change: f32,
    ) -> (i32, i32, i32) {
        if cost_change.is_nan() || cost_change.is_infinite() {
            panic!(
                "The tree cost change is {cost_change}; the tree bounds have been corrupted by \
                 infinites or NaNs."
            );
        }
        let aggressiveness = (cost_change * aggressiveness_scale).max(0.0);
        let portion = (0.03 + aggressiveness * 0.25).min(1.0);
        let target_count = ((refinement_candidates_count as f32 * portion).ceil() as i32)
            .max(1)
            .min(refinement_candidates_count)
            .min(self.node_count);
        let period = (refinement_candidates_count / target_count.max(1)).max(1);
        // Large primes walk the offset across the candidate ring from frame
        // to frame without ever resonating with the period.
        let offset = ((frame_index as i64 * 236887691 + 104395303)
            % refinement_candidates_count.max(1) as i64) as i32;
        (target_count, period, offset)
    }

    /// Chooses how many node slots the cache-optimize phase visits this
    /// frame. A nonpositive multiplier disables the phase entirely.
    pub(crate) fn cache_optimize_tuning(
        &self,
        maximum_subtrees: i32,
        cost_change: f32,
        aggressiveness_multiplier: f32,
    ) -> i32 {
        if aggressiveness_multiplier <= 0.0 {
            return 0;
        }
        let aggressiveness = (cost_change * aggressiveness_multiplier).max(0.0);
        let portion = (0.005 + aggressiveness * 0.5).min(1.0);
        let floor = maximum_subtrees.min(self.node_count);
        ((portion * self.node_count as f32).ceil() as i32)
            .max(floor)
            .min(self.node_count)
    }

    /// Single-threaded refit and refine. Collects candidates while repairing
    /// bounds, stride-samples targets, and rebuilds each in turn. The
    /// multithreaded pass in [`RefitRefineContext`](super::RefitRefineContext)
    /// supersedes this on hosts with a real dispatcher.
    pub fn refit_and_refine(
        &mut self,
        pool: &mut BufferPool,
        frame_index: i32,
        refine_aggressiveness_scale: f32,
    ) {
        // Nothing above the leaves exists to repair or rebuild.
        if self.leaf_count <= 2 {
            return;
        }
        let (maximum_subtrees, estimated_candidate_count, leaf_count_threshold) =
            self.refit_and_mark_tuning();
        let mut refinement_candidates =
            QuickList::<i32>::with_capacity(estimated_candidate_count, pool);

        let cost_change =
            self.refit_and_mark_root(leaf_count_threshold, &mut refinement_candidates, pool);

        let (target_count, period, offset) = self.refine_tuning(
            frame_index,
            refinement_candidates.count,
            refine_aggressiveness_scale,
            cost_change,
        );

        let mut refinement_targets = QuickList::<i32>::with_capacity(target_count, pool);
        let mut index = offset;
        for _ in 0..target_count - 1 {
            index += period;
            if index >= refinement_candidates.count {
                index -= refinement_candidates.count;
            }
            let node_index = refinement_candidates[index];
            debug_assert!(
                self.metanodes.get(node_index).refine_flag == 0,
                "The stride must never land on the same candidate twice."
            );
            unsafe {
                refinement_targets.add_unsafely(node_index);
            }
            self.metanodes.get_mut(node_index).refine_flag = 1;
        }
        refinement_candidates.dispose(pool);

        // The root is refined whenever the stride missed it.
        if self.metanodes.get(0).refine_flag != 1 {
            unsafe {
                refinement_targets.add_unsafely(0);
            }
            self.metanodes.get_mut(0).refine_flag = 1;
        }

        let mut subtrees = QuickList::<i32>::with_capacity(maximum_subtrees, pool);
        let mut internal_slots = QuickList::<i32>::with_capacity(maximum_subtrees, pool);
        let (mut scratch_block, mut scratch) = Self::create_refine_scratch(pool, maximum_subtrees);
        for i in 0..refinement_targets.count {
            subtrees.clear();
            internal_slots.clear();
            unsafe {
                self.binned_refine(
                    refinement_targets[i],
                    &mut subtrees,
                    maximum_subtrees,
                    &mut internal_slots,
                    &mut scratch,
                );
            }
            self.metanodes.get_mut(refinement_targets[i]).refine_flag = 0;
        }

        pool.return_buffer(&mut scratch_block);
        subtrees.dispose(pool);
        internal_slots.dispose(pool);
        refinement_targets.dispose(pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounding_box::BoundingBox;
    use glam::Vec3;

    #[test]
    fn tuning_is_pure() {
        let mut pool = BufferPool::new(1 << 20);
        let mut tree = Tree::new(&mut pool, 128);
        for i in 0..128 {
            let center = Vec3::new(i as f32, 0.0, 0.0);
            tree.add(BoundingBox::new(center, center + Vec3::ONE), &mut pool);
        }
        let first = tree.refine_tuning(9, 40, 1.0, 0.37);
        let second = tree.refine_tuning(9, 40, 1.0, 0.37);
        assert_eq!(first, second);
        assert_eq!(
            tree.cache_optimize_tuning(24, 0.37, 1.0),
            tree.cache_optimize_tuning(24, 0.37, 1.0)
        );
        assert_eq!(tree.cache_optimize_tuning(24, 0.37, 0.0), 0);
        tree.dispose(&mut pool);
    }

    #[test]
    #[should_panic(expected = "corrupted")]
    fn refine_tuning_rejects_nan_cost() {
        let mut pool = BufferPool::new(1 << 20);
        let tree = Tree::new(&mut pool, 8);
        let result = tree.refine_tuning(0, 4, 1.0, f32::NAN);
        // Unreachable; the tuning call panics first.
        let _ = result;
    }

    #[test]
    fn sequential_pass_repairs_and_improves() {
        let mut pool = BufferPool::new(1 << 20);
        let mut tree = Tree::new(&mut pool, 128);
        for i in 0..128 {
            let center = Vec3::new((i * 53 % 97) as f32, (i * 31 % 89) as f32, (i % 13) as f32);
            tree.add_without_refinement(
                BoundingBox::new(center, center + Vec3::ONE),
                &mut pool,
            );
        }
        unsafe {
            let (min_pointer, max_pointer) = tree.get_bounds_pointers(10);
            *min_pointer = Vec3::splat(400.0);
            *max_pointer = Vec3::splat(401.0);
        }
        for frame in 0..32 {
            tree.refit_and_refine(&mut pool, frame, 1.0);
            tree.validate();
        }
        tree.dispose(&mut pool);
        #[cfg(debug_assertions)]
        pool.assert_empty();
    }
}
