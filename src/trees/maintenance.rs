//! The per-frame maintenance pass: parallel refit-and-mark, binned
//! refinement of stride-sampled targets, and incremental cache optimization.
//!
//! Three dispatches run in strict sequence, separated by the dispatcher's
//! join barrier. Work within a dispatch is distributed by a single shared
//! claim counter per phase; that is the only synchronization the phases need
//! beyond the refit fan-in counters themselves.

use super::node::{Metanode, Node};
use super::Tree;
use crate::bounding_box::BoundingBox;
use crate::collections::quick_list::QuickList;
use crate::memory::buffer::Buffer;
use crate::memory::buffer_pool::BufferPool;
use crate::memory::worker_buffer_pools::WorkerBufferPools;
use crate::thread_dispatcher::ThreadDispatcher;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, Ordering};

/// Input and output state for the multithreaded refit-and-refine pass.
///
/// The context can be reused frame to frame; it holds no allocations between
/// calls. All lists are taken from the provided pools during a pass and
/// returned before [`refit_and_refine`](RefitRefineContext::refit_and_refine)
/// completes.
pub struct RefitRefineContext {
    tree: *mut Tree,

    refit_claim_index: UnsafeCell<i32>,
    refit_roots: QuickList<i32>,
    refit_cost_change: UnsafeCell<f32>,

    refinement_leaf_count_threshold: i32,
    refinement_candidates: Buffer<QuickList<i32>>,

    refine_claim_index: UnsafeCell<i32>,
    pub refinement_targets: QuickList<i32>,
    pub maximum_subtrees: i32,

    cache_optimize_claim_index: UnsafeCell<i32>,
    pub cache_optimize_starts: QuickList<i32>,
    pub per_task_cache_optimize_count: i32,

    worker_count: i32,
    worker_pools: *const WorkerBufferPools,
}

unsafe impl Send for RefitRefineContext {}
unsafe impl Sync for RefitRefineContext {}

impl Default for RefitRefineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RefitRefineContext {
    pub fn new() -> Self {
        Self {
            tree: std::ptr::null_mut(),
            refit_claim_index: UnsafeCell::new(0),
            refit_roots: QuickList::default(),
            refit_cost_change: UnsafeCell::new(0.0),
            refinement_leaf_count_threshold: 0,
            refinement_candidates: Buffer::default(),
            refine_claim_index: UnsafeCell::new(0),
            refinement_targets: QuickList::default(),
            maximum_subtrees: 0,
            cache_optimize_claim_index: UnsafeCell::new(0),
            cache_optimize_starts: QuickList::default(),
            per_task_cache_optimize_count: 0,
            worker_count: 0,
            worker_pools: std::ptr::null(),
        }
    }

    /// Root cost-change ratio measured by the most recent pass: summed
    /// bounds-metric change over the post-refit root metric. Zero for a
    /// stationary tree.
    pub fn refit_cost_change(&self) -> f32 {
        unsafe { *self.refit_cost_change.get() }
    }

    /// Runs one frame of maintenance over the tree.
    ///
    /// Leaf bounds are expected to have been updated (for example through
    /// [`Tree::get_bounds_pointers`]) before the call. A tree of two or fewer
    /// leaves is a no-op. For a fixed dispatcher, worker count, and frame
    /// index, the pass is deterministic.
    ///
    /// # Safety
    /// `tree`, `pool`, and the dispatcher's worker pools must not be touched
    /// by anything else for the duration of the call.
    pub unsafe fn refit_and_refine(
        &mut self,
        tree: &mut Tree,
        pool: &mut BufferPool,
        dispatcher: &dyn ThreadDispatcher,
        frame_index: i32,
        refine_aggressiveness_scale: f32,
        cache_optimize_aggressiveness_scale: f32,
    ) {
        // One internal node means there is no parent to measure cost against.
        if tree.leaf_count <= 2 {
            return;
        }
        self.create_refit_jobs(tree, pool, dispatcher);
        let context_pointer = self as *mut Self as *mut ();
        dispatcher.dispatch_workers(refit_and_mark_worker, self.refit_roots.count, context_pointer);

        self.select_refinement_targets(pool, frame_index, refine_aggressiveness_scale);
        dispatcher.dispatch_workers(refine_worker, self.refinement_targets.count, context_pointer);
        // Deferred so that refine execution order never leaks into flag state.
        self.clear_target_flags();

        self.create_cache_optimize_jobs(pool, frame_index, cache_optimize_aggressiveness_scale);
        if self.cache_optimize_starts.count > 0 {
            dispatcher.dispatch_workers(
                cache_optimize_worker,
                self.cache_optimize_starts.count,
                context_pointer,
            );
        }

        self.return_buffers(pool);
    }

    unsafe fn create_refit_jobs(
        &mut self,
        tree: &mut Tree,
        pool: &mut BufferPool,
        dispatcher: &dyn ThreadDispatcher,
    ) {
        self.tree = tree;
        self.worker_count = dispatcher.thread_count();
        self.worker_pools = dispatcher.worker_pools();

        let (maximum_subtrees, estimated_candidate_count, refinement_leaf_count_threshold) =
            tree.refit_and_mark_tuning();
        self.maximum_subtrees = maximum_subtrees;
        self.refinement_leaf_count_threshold = refinement_leaf_count_threshold;
        self.refit_roots = QuickList::with_capacity(maximum_subtrees, pool);
        self.refinement_candidates = pool.take(self.worker_count);
        for worker_index in 0..self.worker_count {
            let worker_pool = dispatcher.worker_pool_ptr(worker_index);
            *self.refinement_candidates.get_mut(worker_index) =
                QuickList::with_capacity(estimated_candidate_count, &mut *worker_pool);
        }

        let multithreading_leaf_count_threshold =
            (tree.leaf_count / (2 * self.worker_count)).max(refinement_leaf_count_threshold);
        let worker_pool_0 = dispatcher.worker_pool_ptr(0);
        self.collect_refit_roots(
            0,
            multithreading_leaf_count_threshold,
            refinement_leaf_count_threshold,
            pool,
            &mut *worker_pool_0,
        );

        *self.refit_claim_index.get() = 0;
        *self.refit_cost_change.get() = 0.0;
        log::trace!(
            "refit jobs: {} roots, wavefront threshold {}, refinement threshold {}",
            self.refit_roots.count,
            multithreading_leaf_count_threshold,
            refinement_leaf_count_threshold
        );
    }

    /// Descends from the root, stopping at subtrees small enough to hand a
    /// single worker. Every visited node's refine flag becomes the count of
    /// its internal children, which the refit phase consumes as a fan-in
    /// counter. Refit roots small enough to also be refinement candidates
    /// are sign-encoded, telling the worker to skip candidate marking below
    /// them.
    unsafe fn collect_refit_roots(
        &mut self,
        node_index: i32,
        multithreading_leaf_count_threshold: i32,
        refinement_leaf_count_threshold: i32,
        pool: &mut BufferPool,
        worker_pool_0: &mut BufferPool,
    ) {
        let tree = &*self.tree;
        debug_assert!(tree.leaf_count > 2);
        debug_assert!(
            tree.metanodes.get(node_index).refine_flag == 0,
            "A prior pass left a nonzero refine flag behind."
        );
        let node = tree.nodes.get(node_index);
        let metanodes = tree.metanodes.as_ptr() as *mut Metanode;
        for slot in 0..2 {
            let child = Tree::node_child(node, slot);
            if child.index < 0 {
                continue;
            }
            (*metanodes.add(node_index as usize)).refine_flag += 1;
            if child.leaf_count > multithreading_leaf_count_threshold {
                self.collect_refit_roots(
                    child.index,
                    multithreading_leaf_count_threshold,
                    refinement_leaf_count_threshold,
                    pool,
                    worker_pool_0,
                );
            } else if child.leaf_count <= refinement_leaf_count_threshold {
                // The wavefront is already at candidate granularity here.
                self.refinement_candidates
                    .get_mut(0)
                    .add(child.index, worker_pool_0);
                self.refit_roots.add(Tree::encode(child.index), pool);
            } else {
                self.refit_roots.add(child.index, pool);
            }
        }
    }

    unsafe fn execute_refit_job(
        &self,
        worker_index: i32,
        refit_index: i32,
        thread_pool: &mut BufferPool,
    ) {
        let tree = &*self.tree;
        let nodes = tree.nodes.as_ptr() as *mut Node;
        let metanodes = tree.metanodes.as_ptr() as *mut Metanode;

        let encoded = self.refit_roots[refit_index];
        let (node_index, should_mark) = if encoded < 0 {
            (Tree::encode(encoded), false)
        } else {
            (encoded, true)
        };

        let metanode = &mut *metanodes.add(node_index as usize);
        debug_assert!(metanode.parent >= 0, "The root is never a refit root.");
        let parent = &mut *nodes.add(metanode.parent as usize);
        let child_in_parent = Tree::node_child_mut(parent, metanode.index_in_parent);
        metanode.local_cost_change = if should_mark {
            let candidates = &mut *(self.refinement_candidates.as_ptr() as *mut QuickList<i32>)
                .add(worker_index as usize);
            tree.refit_and_mark(
                child_in_parent,
                self.refinement_leaf_count_threshold,
                candidates,
                thread_pool,
            )
        } else {
            tree.refit_and_measure(child_in_parent)
        };

        // Climb while this worker is the last to arrive. The atomic decrement
        // is the linearization point: reaching zero means every refit below
        // this node is complete and visible.
        let mut current_index = metanode.parent;
        loop {
            let current_metanode = &mut *metanodes.add(current_index as usize);
            let remaining = AtomicI32::from_ptr(&mut current_metanode.refine_flag as *mut i32)
                .fetch_sub(1, Ordering::AcqRel)
                - 1;
            if remaining != 0 {
                // Another worker owns the rest of this path.
                break;
            }
            let current_node = &*nodes.add(current_index as usize);
            let mut cost_change = 0.0f32;
            for slot in 0..2 {
                let child = Tree::node_child(current_node, slot);
                if child.index >= 0 {
                    let child_metanode = &mut *metanodes.add(child.index as usize);
                    cost_change += child_metanode.local_cost_change;
                    child_metanode.refine_flag = 0;
                }
            }

            if current_metanode.parent < 0 {
                // Last arrival at the root publishes the volatility ratio.
                let mut merged = BoundingBox::empty();
                merged.merge_with(&BoundingBox::new(current_node.a.min, current_node.a.max));
                merged.merge_with(&BoundingBox::new(current_node.b.min, current_node.b.max));
                let postmetric = Tree::bounds_metric(&merged.min, &merged.max);
                current_metanode.local_cost_change = cost_change;
                *self.refit_cost_change.get() = if postmetric > 1e-9 {
                    cost_change / postmetric
                } else {
                    0.0
                };
                current_metanode.refine_flag = 0;
                break;
            }

            let parent_node = &mut *nodes.add(current_metanode.parent as usize);
            let child_in_parent =
                Tree::node_child_mut(parent_node, current_metanode.index_in_parent);
            let premetric = Tree::bounds_metric(&child_in_parent.min, &child_in_parent.max);
            BoundingBox::create_merged(
                current_node.a.min,
                current_node.a.max,
                current_node.b.min,
                current_node.b.max,
                &mut child_in_parent.min,
                &mut child_in_parent.max,
            );
            let postmetric = Tree::bounds_metric(&child_in_parent.min, &child_in_parent.max);
            current_metanode.local_cost_change = cost_change + postmetric - premetric;
            current_index = current_metanode.parent;
        }
    }

    unsafe fn select_refinement_targets(
        &mut self,
        pool: &mut BufferPool,
        frame_index: i32,
        refine_aggressiveness_scale: f32,
    ) {
        let tree = &mut *self.tree;
        let mut refinement_candidates_count = 0;
        for worker_index in 0..self.worker_count {
            refinement_candidates_count += self.refinement_candidates.get(worker_index).count;
        }

        let (target_count, period, offset) = tree.refine_tuning(
            frame_index,
            refinement_candidates_count,
            refine_aggressiveness_scale,
            *self.refit_cost_change.get(),
        );
        self.refinement_targets = QuickList::with_capacity(target_count, pool);

        // The per-worker candidate lists form one concatenated ring; the
        // stride samples it without ever materializing the concatenation.
        let mut worker = 0i32;
        let mut index = offset;
        for _ in 0..target_count - 1 {
            index += period;
            while index >= self.refinement_candidates.get(worker).count {
                index -= self.refinement_candidates.get(worker).count;
                worker += 1;
                if worker >= self.worker_count {
                    worker = 0;
                }
            }
            let node_index = self.refinement_candidates.get(worker)[index];
            debug_assert!(
                tree.metanodes.get(node_index).refine_flag == 0,
                "The stride must never land on the same candidate twice."
            );
            self.refinement_targets.add_unsafely(node_index);
            tree.metanodes.get_mut(node_index).refine_flag = 1;
        }

        // The root is refined exactly when the stride did not pick it.
        if tree.metanodes.get(0).refine_flag != 1 {
            self.refinement_targets.add_unsafely(0);
            tree.metanodes.get_mut(0).refine_flag = 1;
        }

        *self.refine_claim_index.get() = 0;
        log::trace!(
            "selected {} refinement targets from {} candidates (cost change {})",
            self.refinement_targets.count,
            refinement_candidates_count,
            self.refit_cost_change()
        );
    }

    unsafe fn clear_target_flags(&mut self) {
        let tree = &mut *self.tree;
        for i in 0..self.refinement_targets.count {
            tree.metanodes.get_mut(self.refinement_targets[i]).refine_flag = 0;
        }
    }

    unsafe fn create_cache_optimize_jobs(
        &mut self,
        pool: &mut BufferPool,
        frame_index: i32,
        cache_optimize_aggressiveness_scale: f32,
    ) {
        let tree = &*self.tree;
        let multiplier =
            (0.25 * self.worker_count as f32).max(1.0) * cache_optimize_aggressiveness_scale;
        let cache_optimize_count = tree.cache_optimize_tuning(
            self.maximum_subtrees,
            *self.refit_cost_change.get(),
            multiplier,
        );
        let task_count = 2 * self.worker_count;
        self.per_task_cache_optimize_count = cache_optimize_count / task_count;
        self.cache_optimize_starts = QuickList::default();
        if self.per_task_cache_optimize_count == 0 {
            return;
        }

        self.cache_optimize_starts = QuickList::with_capacity(task_count, pool);
        for task_index in 0..task_count {
            self.cache_optimize_starts.add_unsafely(cache_optimize_task_start(
                tree.node_count,
                self.worker_count,
                frame_index,
                self.per_task_cache_optimize_count,
                task_index,
            ));
        }

        *self.cache_optimize_claim_index.get() = 0;
        log::trace!(
            "cache optimize: {} slots across {} tasks",
            cache_optimize_count,
            task_count
        );
    }

    unsafe fn return_buffers(&mut self, pool: &mut BufferPool) {
        let worker_pools = &*self.worker_pools;
        for worker_index in 0..self.worker_count {
            let worker_pool = worker_pools.get_pool_ptr(worker_index);
            self.refinement_candidates
                .get_mut(worker_index)
                .dispose(&mut *worker_pool);
        }
        pool.return_buffer(&mut self.refinement_candidates);
        self.refit_roots.dispose(pool);
        self.refinement_targets.dispose(pool);
        if self.cache_optimize_starts.span.allocated() {
            self.cache_optimize_starts.dispose(pool);
        }
        self.tree = std::ptr::null_mut();
        self.worker_pools = std::ptr::null();
    }
}

/// Start slot of one cache-optimize task. The first task's start rotates
/// with the frame index so repeated frames sweep every region; later tasks
/// are spaced `node_count / worker_count` slots apart, the first
/// `node_count % worker_count` gaps taking one extra slot, wrapping modulo
/// `node_count`.
pub fn cache_optimize_task_start(
    node_count: i32,
    worker_count: i32,
    frame_index: i32,
    per_task_count: i32,
    task_index: i32,
) -> i32 {
    let node_count = node_count as i64;
    let spacing = node_count / worker_count as i64;
    let remainder = node_count % worker_count as i64;
    let first = (frame_index as i64 * per_task_count as i64) % node_count;
    let task = task_index as i64;
    ((first + task * spacing + task.min(remainder)) % node_count) as i32
}

fn refit_and_mark_worker(worker_index: i32, dispatcher: &dyn ThreadDispatcher) {
    unsafe {
        let context = &*(dispatcher.unmanaged_context() as *const RefitRefineContext);
        if context.refit_roots.count == 0 {
            return;
        }
        let thread_pool = dispatcher.worker_pool_ptr(worker_index);
        loop {
            let refit_index = AtomicI32::from_ptr(context.refit_claim_index.get())
                .fetch_add(1, Ordering::AcqRel);
            if refit_index >= context.refit_roots.count {
                break;
            }
            context.execute_refit_job(worker_index, refit_index, &mut *thread_pool);
        }
    }
}

fn refine_worker(worker_index: i32, dispatcher: &dyn ThreadDispatcher) {
    unsafe {
        let context = &*(dispatcher.unmanaged_context() as *const RefitRefineContext);
        if context.refinement_targets.count == 0 {
            return;
        }
        let thread_pool = &mut *dispatcher.worker_pool_ptr(worker_index);
        let capacity = (context.maximum_subtrees as u32).next_power_of_two() as i32;
        let mut subtrees = QuickList::<i32>::with_capacity(capacity, thread_pool);
        let mut internal_slots = QuickList::<i32>::with_capacity(capacity, thread_pool);
        let (mut scratch_block, mut scratch) =
            Tree::create_refine_scratch(thread_pool, context.maximum_subtrees);

        let tree = &mut *context.tree;
        loop {
            let refine_index = AtomicI32::from_ptr(context.refine_claim_index.get())
                .fetch_add(1, Ordering::AcqRel);
            if refine_index >= context.refinement_targets.count {
                break;
            }
            subtrees.clear();
            internal_slots.clear();
            tree.binned_refine(
                context.refinement_targets[refine_index],
                &mut subtrees,
                context.maximum_subtrees,
                &mut internal_slots,
                &mut scratch,
            );
        }

        subtrees.dispose(thread_pool);
        internal_slots.dispose(thread_pool);
        thread_pool.return_buffer(&mut scratch_block);
    }
}

fn cache_optimize_worker(_worker_index: i32, dispatcher: &dyn ThreadDispatcher) {
    unsafe {
        let context = &*(dispatcher.unmanaged_context() as *const RefitRefineContext);
        if context.cache_optimize_starts.count == 0 {
            return;
        }
        let tree = &mut *context.tree;
        loop {
            let task_index = AtomicI32::from_ptr(context.cache_optimize_claim_index.get())
                .fetch_add(1, Ordering::AcqRel);
            if task_index >= context.cache_optimize_starts.count {
                break;
            }
            let start = context.cache_optimize_starts[task_index];
            // Clipped, not wrapped; the start rotation covers the tail end on
            // other frames.
            let end = (start + context.per_task_cache_optimize_count).min(tree.node_count);
            for node_index in start..end {
                tree.incremental_cache_optimize(node_index);
            }
        }
    }
}
