//! End-to-end scenarios for the per-frame maintenance pass.

use broadtree::bounding_box::BoundingBox;
use broadtree::memory::buffer_pool::BufferPool;
use broadtree::memory::worker_buffer_pools::WorkerBufferPools;
use broadtree::thread_dispatcher::{
    PassthroughDispatcher, SimpleThreadDispatcher, ThreadDispatcher, WorkerBodyFn,
};
use broadtree::trees::{cache_optimize_task_start, RefitRefineContext, Tree};
use glam::Vec3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::cell::{Cell, RefCell, UnsafeCell};

fn build_tree(pool: &mut BufferPool, bounds: &[BoundingBox]) -> Tree {
    let mut tree = Tree::new(pool, (bounds.len() as i32).max(1));
    for b in bounds {
        tree.add(*b, pool);
    }
    tree
}

fn random_boxes(seed: u64, count: usize) -> Vec<BoundingBox> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let center = Vec3::new(
                rng.gen_range(-100.0..100.0),
                rng.gen_range(-100.0..100.0),
                rng.gen_range(-100.0..100.0),
            );
            let half = Vec3::new(
                rng.gen_range(0.1..2.0),
                rng.gen_range(0.1..2.0),
                rng.gen_range(0.1..2.0),
            );
            BoundingBox::new(center - half, center + half)
        })
        .collect()
}

fn move_leaf(tree: &Tree, leaf_index: i32, min: Vec3, max: Vec3) {
    unsafe {
        let (min_pointer, max_pointer) = tree.get_bounds_pointers(leaf_index);
        *min_pointer = min;
        *max_pointer = max;
    }
}

fn snapshot(tree: &Tree) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    unsafe {
        let nodes = std::slice::from_raw_parts(
            tree.nodes.as_ptr() as *const u8,
            tree.node_count as usize * std::mem::size_of::<broadtree::trees::Node>(),
        )
        .to_vec();
        let metanodes = std::slice::from_raw_parts(
            tree.metanodes.as_ptr() as *const u8,
            tree.node_count as usize * std::mem::size_of::<broadtree::trees::Metanode>(),
        )
        .to_vec();
        let leaves = std::slice::from_raw_parts(
            tree.leaves.as_ptr() as *const u8,
            tree.leaf_count as usize * std::mem::size_of::<broadtree::trees::Leaf>(),
        )
        .to_vec();
        (nodes, metanodes, leaves)
    }
}

fn assert_flags_zero(tree: &Tree) {
    for i in 0..tree.node_count {
        assert_eq!(
            tree.metanodes.get(i).refine_flag,
            0,
            "Nonzero refine flag left on node {i}."
        );
    }
}

fn root_bounds(tree: &Tree) -> BoundingBox {
    let root = tree.nodes.get(0);
    let mut merged = BoundingBox::new(root.a.min, root.a.max);
    merged.merge_with(&BoundingBox::new(root.b.min, root.b.max));
    merged
}

/// Runs workers sequentially in reversed index order; used to check that the
/// pass does not depend on which worker performs which claim.
struct ReversedDispatcher {
    thread_count: i32,
    worker_pools: WorkerBufferPools,
    context: Cell<*mut ()>,
}

unsafe impl Send for ReversedDispatcher {}
unsafe impl Sync for ReversedDispatcher {}

impl ReversedDispatcher {
    fn new(thread_count: i32) -> Self {
        Self {
            thread_count,
            worker_pools: WorkerBufferPools::new_default(thread_count),
            context: Cell::new(std::ptr::null_mut()),
        }
    }
}

impl ThreadDispatcher for ReversedDispatcher {
    fn thread_count(&self) -> i32 {
        self.thread_count
    }

    fn unmanaged_context(&self) -> *mut () {
        self.context.get()
    }

    unsafe fn dispatch_workers(
        &self,
        worker_body: WorkerBodyFn,
        maximum_worker_count: i32,
        unmanaged_context: *mut (),
    ) {
        self.context.set(unmanaged_context);
        for worker_index in (0..self.thread_count.min(maximum_worker_count)).rev() {
            worker_body(worker_index, self);
        }
        self.context.set(std::ptr::null_mut());
    }

    fn worker_pools(&self) -> &WorkerBufferPools {
        &self.worker_pools
    }
}

/// Sequential dispatcher that snapshots the refinement target list (and the
/// parent links at selection time) when the refine dispatch starts. The
/// target list only lives between selection and cleanup, so observing it
/// requires standing in the middle of the pass.
struct RecordingDispatcher {
    inner: PassthroughDispatcher,
    dispatch_index: Cell<i32>,
    tree: *const Tree,
    targets: RefCell<Vec<i32>>,
    parents_at_selection: RefCell<Vec<i32>>,
    context: UnsafeCell<*mut ()>,
}

unsafe impl Send for RecordingDispatcher {}
unsafe impl Sync for RecordingDispatcher {}

impl RecordingDispatcher {
    fn new(thread_count: i32, tree: *const Tree) -> Self {
        Self {
            inner: PassthroughDispatcher::new(thread_count),
            dispatch_index: Cell::new(0),
            tree,
            targets: RefCell::new(Vec::new()),
            parents_at_selection: RefCell::new(Vec::new()),
            context: UnsafeCell::new(std::ptr::null_mut()),
        }
    }
}

impl ThreadDispatcher for RecordingDispatcher {
    fn thread_count(&self) -> i32 {
        self.inner.thread_count()
    }

    fn unmanaged_context(&self) -> *mut () {
        unsafe { *self.context.get() }
    }

    unsafe fn dispatch_workers(
        &self,
        worker_body: WorkerBodyFn,
        maximum_worker_count: i32,
        unmanaged_context: *mut (),
    ) {
        let dispatch_index = self.dispatch_index.get();
        self.dispatch_index.set(dispatch_index + 1);
        if dispatch_index == 1 {
            // Second dispatch of the pass is refine; the target list is live.
            let context = &*(unmanaged_context as *const RefitRefineContext);
            *self.targets.borrow_mut() = context.refinement_targets.as_slice().to_vec();
            let tree = &*self.tree;
            *self.parents_at_selection.borrow_mut() =
                (0..tree.node_count).map(|i| tree.metanodes.get(i).parent).collect();
        }
        *self.context.get() = unmanaged_context;
        self.inner
            .dispatch_workers(worker_body, maximum_worker_count, unmanaged_context);
        *self.context.get() = std::ptr::null_mut();
    }

    fn worker_pools(&self) -> &WorkerBufferPools {
        self.inner.worker_pools()
    }
}

#[test]
fn s1_single_moved_leaf_refits_and_refines_the_root() {
    let mut pool = BufferPool::new_default();
    let bounds: Vec<BoundingBox> = [
        Vec3::new(0.0, 0.0, 0.0),
        Vec3::new(1.0, 0.0, 0.0),
        Vec3::new(0.0, 1.0, 0.0),
        Vec3::new(0.0, 0.0, 1.0),
    ]
    .iter()
    .map(|&p| BoundingBox::new(p, p))
    .collect();
    let mut tree = build_tree(&mut pool, &bounds);

    move_leaf(&tree, 0, Vec3::splat(10.0), Vec3::splat(10.0));

    let dispatcher = RecordingDispatcher::new(1, &tree);
    let mut context = RefitRefineContext::new();
    unsafe {
        context.refit_and_refine(&mut tree, &mut pool, &dispatcher, 0, 1.0, 1.0);
    }

    let merged = root_bounds(&tree);
    assert_eq!(merged.min, Vec3::ZERO);
    assert_eq!(merged.max, Vec3::splat(10.0));
    assert!(context.refit_cost_change() > 0.0);
    // The stride produced nothing and the fallback rule appended the root.
    assert_eq!(dispatcher.targets.borrow().as_slice(), &[0]);
    tree.validate();
    assert_flags_zero(&tree);

    tree.dispose(&mut pool);
}

#[test]
fn s2_stationary_tree_measures_zero_cost_change() {
    let mut pool = BufferPool::new_default();
    let bounds = random_boxes(11, 64);
    let mut tree = build_tree(&mut pool, &bounds);

    let dispatcher = PassthroughDispatcher::new(1);
    let mut context = RefitRefineContext::new();
    unsafe {
        context.refit_and_refine(&mut tree, &mut pool, &dispatcher, 0, 1.0, 1.0);
    }
    tree.validate();
    let cost_after_first = tree.measure_cost_metric();

    // No leaf moved between passes: refit finds exactly the same unions.
    unsafe {
        context.refit_and_refine(&mut tree, &mut pool, &dispatcher, 1, 1.0, 1.0);
    }
    assert_eq!(context.refit_cost_change(), 0.0);
    tree.validate();
    assert_flags_zero(&tree);
    assert!(tree.measure_cost_metric() <= cost_after_first * 1.05);

    tree.dispose(&mut pool);
}

#[test]
fn s3_fixed_inputs_produce_byte_identical_trees() {
    let bounds = random_boxes(7, 1024);
    let run = || {
        let mut pool = BufferPool::new_default();
        let mut tree = build_tree(&mut pool, &bounds);
        // Scatter a few dozen leaves so the pass has real work.
        for leaf in (0..1024).step_by(31) {
            let offset = Vec3::new(leaf as f32, -(leaf as f32), 3.0);
            let b = &bounds[leaf as usize];
            move_leaf(&tree, leaf, b.min + offset, b.max + offset);
        }
        let dispatcher = PassthroughDispatcher::new(4);
        let mut context = RefitRefineContext::new();
        unsafe {
            context.refit_and_refine(&mut tree, &mut pool, &dispatcher, 7, 1.0, 1.0);
        }
        tree.validate();
        let result = (snapshot(&tree), context.refit_cost_change());
        tree.dispose(&mut pool);
        result
    };

    let (first, first_cost) = run();
    let (second, second_cost) = run();
    assert_eq!(first_cost, second_cost);
    assert_eq!(first.0, second.0, "node arrays diverged");
    assert_eq!(first.1, second.1, "metanode arrays diverged");
    assert_eq!(first.2, second.2, "leaf arrays diverged");
}

#[test]
fn s4_cache_optimize_starts_rotate_with_the_frame() {
    let node_count = 1023;
    let worker_count = 4;
    let per_task = 12;
    for frame in 0..8 {
        for task in 0..2 * worker_count {
            let current =
                cache_optimize_task_start(node_count, worker_count, frame, per_task, task);
            let next =
                cache_optimize_task_start(node_count, worker_count, frame + 1, per_task, task);
            assert_eq!(
                next,
                (current + per_task) % node_count,
                "task {task} did not rotate by the per-task count between frames"
            );
        }
    }
    // Task starts within one frame are spaced across the array.
    let first = cache_optimize_task_start(node_count, worker_count, 3, per_task, 0);
    let second = cache_optimize_task_start(node_count, worker_count, 3, per_task, 1);
    assert_eq!(
        (second - first).rem_euclid(node_count),
        node_count / worker_count + 1
    );

    // And the pass actually schedules cache optimization work.
    let mut pool = BufferPool::new_default();
    let bounds = random_boxes(23, 512);
    let mut tree = build_tree(&mut pool, &bounds);
    let dispatcher = PassthroughDispatcher::new(4);
    let mut context = RefitRefineContext::new();
    for frame in 0..16 {
        unsafe {
            context.refit_and_refine(&mut tree, &mut pool, &dispatcher, frame, 1.0, 1.0);
        }
        assert!(context.per_task_cache_optimize_count > 0);
        tree.validate();
    }
    tree.dispose(&mut pool);
}

#[test]
fn s5_worker_order_does_not_change_the_result() {
    let bounds = random_boxes(29, 512);
    let run = |reversed: bool| {
        let mut pool = BufferPool::new_default();
        let mut tree = build_tree(&mut pool, &bounds);
        for leaf in (0..512).step_by(17) {
            let b = &bounds[leaf as usize];
            let offset = Vec3::new(0.0, 25.0 + leaf as f32, 0.0);
            move_leaf(&tree, leaf, b.min + offset, b.max + offset);
        }
        let mut context = RefitRefineContext::new();
        // The cache phase is disabled so slot layout cannot depend on task
        // execution order; refit and refine are order-independent on their own.
        unsafe {
            if reversed {
                let dispatcher = ReversedDispatcher::new(4);
                context.refit_and_refine(&mut tree, &mut pool, &dispatcher, 3, 1.0, 0.0);
            } else {
                let dispatcher = PassthroughDispatcher::new(4);
                context.refit_and_refine(&mut tree, &mut pool, &dispatcher, 3, 1.0, 0.0);
            }
        }
        tree.validate();
        let result = snapshot(&tree);
        tree.dispose(&mut pool);
        result
    };

    let forward = run(false);
    let reversed = run(true);
    assert_eq!(forward.0, reversed.0, "node arrays diverged");
    assert_eq!(forward.1, reversed.1, "metanode arrays diverged");
    assert_eq!(forward.2, reversed.2, "leaf arrays diverged");
}

#[test]
fn s6_trees_of_two_or_fewer_leaves_are_untouched() {
    for leaf_count in 0..=2usize {
        let mut pool = BufferPool::new_default();
        let bounds = random_boxes(41, leaf_count);
        let mut tree = build_tree(&mut pool, &bounds);
        let before = snapshot(&tree);

        let dispatcher = PassthroughDispatcher::new(2);
        let mut context = RefitRefineContext::new();
        unsafe {
            context.refit_and_refine(&mut tree, &mut pool, &dispatcher, 0, 1.0, 1.0);
        }

        let after = snapshot(&tree);
        assert_eq!(before, after, "a {leaf_count}-leaf tree must not be mutated");
        tree.validate();
        tree.dispose(&mut pool);
    }
}

#[test]
fn three_leaf_tree_runs_the_whole_pass() {
    let mut pool = BufferPool::new_default();
    let bounds = random_boxes(43, 3);
    let mut tree = build_tree(&mut pool, &bounds);

    let dispatcher = PassthroughDispatcher::new(2);
    let mut context = RefitRefineContext::new();
    unsafe {
        context.refit_and_refine(&mut tree, &mut pool, &dispatcher, 0, 1.0, 1.0);
    }
    tree.validate();
    assert_flags_zero(&tree);
    tree.dispose(&mut pool);
}

#[test]
fn refinement_targets_are_distinct_and_unnested() {
    let mut pool = BufferPool::new_default();
    let bounds = random_boxes(53, 2048);
    let mut tree = build_tree(&mut pool, &bounds);
    for leaf in (0..2048).step_by(7) {
        let b = &bounds[leaf as usize];
        let offset = Vec3::new((leaf % 50) as f32, 0.0, -(leaf as f32) * 0.1);
        move_leaf(&tree, leaf, b.min + offset, b.max + offset);
    }

    let dispatcher = RecordingDispatcher::new(4, &tree);
    let mut context = RefitRefineContext::new();
    unsafe {
        context.refit_and_refine(&mut tree, &mut pool, &dispatcher, 5, 4.0, 1.0);
    }

    let targets = dispatcher.targets.borrow();
    let parents = dispatcher.parents_at_selection.borrow();
    assert!(!targets.is_empty());
    let mut sorted = targets.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), targets.len(), "duplicate refinement target");

    // The root fallback aside, no target sits in another target's subtree.
    for &target in targets.iter() {
        if target == 0 {
            continue;
        }
        let mut ancestor = parents[target as usize];
        while ancestor > 0 {
            assert!(
                !targets.contains(&ancestor),
                "target {target} is nested under target {ancestor}"
            );
            ancestor = parents[ancestor as usize];
        }
    }
    tree.validate();
    tree.dispose(&mut pool);
}

#[test]
fn threaded_dispatcher_preserves_invariants() {
    let mut pool = BufferPool::new_default();
    let bounds = random_boxes(61, 1024);
    let mut tree = build_tree(&mut pool, &bounds);
    let dispatcher = SimpleThreadDispatcher::new(4);
    let mut context = RefitRefineContext::new();
    for frame in 0..8 {
        for leaf in (frame..1024).step_by(13) {
            let b = &bounds[leaf as usize];
            let offset = Vec3::new((frame * 3) as f32, frame as f32, 0.5);
            move_leaf(&tree, leaf as i32, b.min + offset, b.max + offset);
        }
        unsafe {
            context.refit_and_refine(&mut tree, &mut pool, &dispatcher, frame as i32, 1.0, 1.0);
        }
        tree.validate();
        assert_flags_zero(&tree);
    }
    tree.dispose(&mut pool);
}

#[test]
fn repeated_passes_repair_a_degenerate_tree() {
    let mut pool = BufferPool::new_default();
    // Sorted input without insertion rotations: the worst realistic start.
    let bounds: Vec<BoundingBox> = (0..512)
        .map(|i| {
            let center = Vec3::new(i as f32 * 2.0, 0.0, 0.0);
            BoundingBox::new(center, center + Vec3::ONE)
        })
        .collect();
    let mut tree = Tree::new(&mut pool, 512);
    for b in &bounds {
        tree.add_without_refinement(*b, &mut pool);
    }
    let cost_before = tree.measure_cost_metric();

    let dispatcher = PassthroughDispatcher::new(2);
    let mut context = RefitRefineContext::new();
    for frame in 0..64 {
        unsafe {
            context.refit_and_refine(&mut tree, &mut pool, &dispatcher, frame, 2.0, 1.0);
        }
        tree.validate();
    }
    let cost_after = tree.measure_cost_metric();
    assert!(
        cost_after < cost_before * 0.5,
        "refinement failed to repair a degenerate tree: {cost_before} -> {cost_after}"
    );
    tree.dispose(&mut pool);
}

#[test]
fn flag_scrub_recovers_dirty_metanodes() {
    let mut pool = BufferPool::new_default();
    let bounds = random_boxes(71, 64);
    let mut tree = build_tree(&mut pool, &bounds);
    // Simulate an aborted pass leaving fan-in counters behind.
    for i in (0..tree.node_count).step_by(3) {
        tree.metanodes.get_mut(i as i32).refine_flag = 2;
    }
    tree.clear_refine_flags();
    tree.validate();

    let dispatcher = PassthroughDispatcher::new(2);
    let mut context = RefitRefineContext::new();
    unsafe {
        context.refit_and_refine(&mut tree, &mut pool, &dispatcher, 0, 1.0, 1.0);
    }
    tree.validate();
    tree.dispose(&mut pool);
}
