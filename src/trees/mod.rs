//! Dynamic binary AABB tree and its per-frame maintenance.

mod binned_refine;
mod cache_optimizer;
mod diagnostics;
mod insertion;
mod leaf;
mod maintenance;
mod node;
mod refinement_scheduling;
mod refit;
mod subtree_collection;

pub use leaf::Leaf;
pub use maintenance::{cache_optimize_task_start, RefitRefineContext};
pub use node::{Metanode, Node, NodeChild};

use crate::memory::buffer::Buffer;
use crate::memory::buffer_pool::BufferPool;
use glam::Vec3;

/// A binary bounding volume hierarchy over externally owned leaves.
///
/// Nodes and their metadata live in parallel arrays indexed by node id;
/// "pointers" between nodes are plain integers, patched whenever a slot
/// moves. The root occupies slot 0 whenever any node exists.
pub struct Tree {
    pub nodes: Buffer<Node>,
    pub metanodes: Buffer<Metanode>,
    pub leaves: Buffer<Leaf>,
    pub node_count: i32,
    pub leaf_count: i32,
}

impl Tree {
    /// Maps a leaf id into the negative child-index encoding, and back.
    /// `encode(encode(i)) == i`, and zero is representable on both sides.
    #[inline(always)]
    pub fn encode(index: i32) -> i32 {
        -1 - index
    }

    /// Surface area of a box, the cost metric guiding every heuristic in the
    /// tree. Degenerate boxes (any negative extent, including the empty-box
    /// sentinel) measure zero.
    #[inline(always)]
    pub fn bounds_metric(min: &Vec3, max: &Vec3) -> f32 {
        let extent = *max - *min;
        if extent.min_element() < 0.0 {
            return 0.0;
        }
        2.0 * (extent.x * extent.y + extent.y * extent.z + extent.x * extent.z)
    }

    /// Constructs a tree with room for `initial_leaf_capacity` leaves.
    pub fn new(pool: &mut BufferPool, initial_leaf_capacity: i32) -> Self {
        assert!(initial_leaf_capacity > 0, "Initial leaf capacity must be positive.");
        let mut tree = Self {
            nodes: Buffer::default(),
            metanodes: Buffer::default(),
            leaves: Buffer::default(),
            node_count: 0,
            leaf_count: 0,
        };
        tree.resize(pool, initial_leaf_capacity);
        tree
    }

    #[inline(always)]
    fn initialize_root(&mut self) {
        // The root exists even when empty; it simplifies bookkeeping.
        self.node_count = 1;
        let root = self.metanodes.get_mut(0);
        root.parent = -1;
        root.index_in_parent = -1;
        root.refine_flag = 0;
        root.local_cost_change = 0.0;
    }

    /// Grows the backing buffers to hold at least `target_leaf_slot_count`
    /// leaves. Never shrinks below resident content.
    pub fn resize(&mut self, pool: &mut BufferPool, target_leaf_slot_count: i32) {
        let leaf_capacity =
            BufferPool::get_capacity_for_count::<Leaf>(self.leaf_count.max(target_leaf_slot_count));
        let node_capacity =
            BufferPool::get_capacity_for_count::<Node>(self.node_count.max(leaf_capacity - 1));
        let was_allocated = self.leaves.allocated();

        if leaf_capacity != self.leaves.len() {
            pool.resize_to_at_least(&mut self.leaves, leaf_capacity, self.leaf_count);
        }
        if node_capacity != self.nodes.len() {
            pool.resize_to_at_least(&mut self.nodes, node_capacity, self.node_count);
        }
        if node_capacity != self.metanodes.len() {
            pool.resize_to_at_least(&mut self.metanodes, node_capacity, self.node_count);
            // Refine flags must read zero everywhere, including slots no node
            // occupies yet.
            let clear_start = self.node_count;
            let clear_count = self.metanodes.len() - clear_start;
            if clear_count > 0 {
                self.metanodes.clear(clear_start, clear_count);
            }
        }
        if !was_allocated {
            self.initialize_root();
        }
    }

    /// Empties the tree without releasing its backing memory.
    pub fn clear(&mut self) {
        self.leaf_count = 0;
        self.initialize_root();
    }

    /// Returns the tree's backing memory to the pool.
    pub fn dispose(&mut self, pool: &mut BufferPool) {
        debug_assert!(
            self.nodes.allocated() == self.leaves.allocated()
                && self.nodes.allocated() == self.metanodes.allocated(),
            "Node, metanode, and leaf buffers share a lifetime."
        );
        if self.nodes.allocated() {
            pool.return_buffer(&mut self.nodes);
            pool.return_buffer(&mut self.metanodes);
            pool.return_buffer(&mut self.leaves);
        }
    }

    #[inline(always)]
    pub(crate) fn allocate_node(&mut self) -> i32 {
        debug_assert!(
            self.nodes.len() > self.node_count && self.metanodes.len() > self.node_count,
            "Node allocation must not overrun the backing buffers."
        );
        let index = self.node_count;
        self.node_count += 1;
        index
    }

    #[inline(always)]
    pub(crate) fn add_leaf(&mut self, node_index: i32, child_index: i32) -> i32 {
        debug_assert!(
            self.leaf_count < self.leaves.len(),
            "Leaf allocation must not overrun the backing buffer."
        );
        let index = self.leaf_count;
        *self.leaves.get_mut(index) = Leaf::new(node_index, child_index);
        self.leaf_count += 1;
        index
    }

    /// Gets a reference to the child slot at `index` (0 = A, 1 = B).
    #[inline(always)]
    pub unsafe fn node_child(node: &Node, index: i32) -> &NodeChild {
        debug_assert!(index == 0 || index == 1);
        &*(&node.a as *const NodeChild).add(index as usize)
    }

    /// Gets a mutable reference to the child slot at `index` (0 = A, 1 = B).
    #[inline(always)]
    pub unsafe fn node_child_mut(node: &mut Node, index: i32) -> &mut NodeChild {
        debug_assert!(index == 0 || index == 1);
        &mut *(&mut node.a as *mut NodeChild).add(index as usize)
    }

    /// Pointers to the min and max bounds a leaf occupies inside the tree,
    /// for in-place updates by the broadphase.
    ///
    /// # Safety
    /// The pointers alias tree memory; they are invalidated by any structural
    /// change and must not be used concurrently with one.
    #[inline(always)]
    pub unsafe fn get_bounds_pointers(&self, leaf_index: i32) -> (*mut Vec3, *mut Vec3) {
        let leaf = *self.leaves.get(leaf_index);
        let child = (self.nodes.get(leaf.node_index()) as *const Node as *const NodeChild)
            .add(leaf.child_index() as usize) as *mut NodeChild;
        (&mut (*child).min as *mut Vec3, &mut (*child).max as *mut Vec3)
    }

    /// Writes new bounds for a leaf and immediately refits its ancestor
    /// chain. For batched updates, write through
    /// [`get_bounds_pointers`](Tree::get_bounds_pointers) and let the frame's
    /// maintenance pass repair the tree instead.
    #[inline(always)]
    pub fn update_bounds(&self, leaf_index: i32, min: Vec3, max: Vec3) {
        unsafe {
            let (min_pointer, max_pointer) = self.get_bounds_pointers(leaf_index);
            *min_pointer = min;
            *max_pointer = max;
            self.refit_for_node_bounds_change(self.leaves.get(leaf_index).node_index());
        }
    }

    /// Zeroes the refine flag of every node.
    ///
    /// The maintenance pass leaves all flags zero on successful completion;
    /// this scrub is the recovery path if a pass was aborted partway.
    pub fn clear_refine_flags(&mut self) {
        for i in 0..self.node_count {
            self.metanodes.get_mut(i).refine_flag = 0;
        }
    }
}
