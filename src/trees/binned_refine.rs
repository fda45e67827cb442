//! In-place treelet rebuild with a binned surface area heuristic.
//!
//! A refinement target's subtree is collapsed into a flat set of subtree
//! roots, a fresh treelet is built over them top-down with a sweeping binned
//! SAH split, and the staged result is written back into the exact node slots
//! the old treelet occupied. Leaf membership never changes; only the internal
//! structure above the collected subtrees does.

use super::subtree_collection::SubtreeHeapEntry;
use super::node::Node;
use super::Tree;
use crate::bounding_box::BoundingBox;
use crate::collections::quick_list::QuickList;
use crate::memory::buffer::Buffer;
use crate::memory::buffer_pool::BufferPool;
use glam::Vec3;
use std::mem;

/// Upper bound on bins per axis. More bins than subtrees never helps; the
/// actual count adapts to the range being split.
const MAXIMUM_BIN_COUNT: i32 = 64;

const CENTROID_EPSILON: f32 = 1e-12;

/// Binning state for one axis.
struct BinAxis {
    bin_bounds: *mut BoundingBox,
    bin_leaf_counts: *mut i32,
    bin_subtree_counts: *mut i32,
    /// Bin id per subtree position in the range currently being split.
    subtree_bin_indices: *mut i32,
    /// Prefix sweep: merged bounds and leaf counts of bins `0..=i`.
    sweep_bounds: *mut BoundingBox,
    sweep_leaf_counts: *mut i32,
}

/// Scratch for one worker's refinements, suballocated from a single pooled
/// block so take/return is one pool operation per worker per pass.
pub(crate) struct RefineScratch {
    subtree_bounds: *mut BoundingBox,
    subtree_leaf_counts: *mut i32,
    subtree_centroids: *mut Vec3,
    index_map: *mut i32,
    temp_index_map: *mut i32,
    pub heap_entries: *mut SubtreeHeapEntry,
    staging_nodes: *mut Node,
    axes: [BinAxis; 3],
    bin_start_indices: *mut i32,
    bin_fill_counts: *mut i32,
}

#[inline(always)]
fn aligned_bytes<T>(count: i32) -> i32 {
    ((count as usize * mem::size_of::<T>() + 15) & !15) as i32
}

unsafe fn suballocate<T>(memory: *mut u8, allocated: &mut i32, count: i32) -> *mut T {
    let pointer = memory.add(*allocated as usize) as *mut T;
    *allocated += aligned_bytes::<T>(count);
    pointer
}

impl Tree {
    /// Allocates refinement scratch for treelets of up to
    /// `maximum_subtrees` subtrees. The returned buffer owns the memory and
    /// must be returned to the same pool when refinement is done.
    pub(crate) fn create_refine_scratch(
        pool: &mut BufferPool,
        maximum_subtrees: i32,
    ) -> (Buffer<u8>, RefineScratch) {
        let staging_count = maximum_subtrees - 1;
        let per_axis = aligned_bytes::<BoundingBox>(MAXIMUM_BIN_COUNT) * 2
            + aligned_bytes::<i32>(MAXIMUM_BIN_COUNT) * 3
            + aligned_bytes::<i32>(maximum_subtrees);
        let bytes_required = aligned_bytes::<BoundingBox>(maximum_subtrees)
            + aligned_bytes::<i32>(maximum_subtrees) * 3
            + aligned_bytes::<Vec3>(maximum_subtrees)
            + aligned_bytes::<SubtreeHeapEntry>(maximum_subtrees)
            + aligned_bytes::<Node>(staging_count)
            + per_axis * 3
            + aligned_bytes::<i32>(MAXIMUM_BIN_COUNT) * 2;

        let buffer: Buffer<u8> = pool.take_at_least(bytes_required);
        let memory = buffer.as_ptr() as *mut u8;
        let mut allocated = 0i32;
        unsafe {
            let scratch = RefineScratch {
                subtree_bounds: suballocate(memory, &mut allocated, maximum_subtrees),
                subtree_leaf_counts: suballocate(memory, &mut allocated, maximum_subtrees),
                subtree_centroids: suballocate(memory, &mut allocated, maximum_subtrees),
                index_map: suballocate(memory, &mut allocated, maximum_subtrees),
                temp_index_map: suballocate(memory, &mut allocated, maximum_subtrees),
                heap_entries: suballocate(memory, &mut allocated, maximum_subtrees),
                staging_nodes: suballocate(memory, &mut allocated, staging_count),
                axes: [0, 1, 2].map(|_| BinAxis {
                    bin_bounds: suballocate(memory, &mut allocated, MAXIMUM_BIN_COUNT),
                    bin_leaf_counts: suballocate(memory, &mut allocated, MAXIMUM_BIN_COUNT),
                    bin_subtree_counts: suballocate(memory, &mut allocated, MAXIMUM_BIN_COUNT),
                    subtree_bin_indices: suballocate(memory, &mut allocated, maximum_subtrees),
                    sweep_bounds: suballocate(memory, &mut allocated, MAXIMUM_BIN_COUNT),
                    sweep_leaf_counts: suballocate(memory, &mut allocated, MAXIMUM_BIN_COUNT),
                }),
                bin_start_indices: suballocate(memory, &mut allocated, MAXIMUM_BIN_COUNT),
                bin_fill_counts: suballocate(memory, &mut allocated, MAXIMUM_BIN_COUNT),
            };
            debug_assert!(
                allocated <= buffer.len(),
                "Scratch suballocations must fit the block."
            );
            (buffer, scratch)
        }
    }

    /// Splits `index_map[start..start + count]` into two ranges, choosing the
    /// axis and bin boundary with the lowest leaf-weighted surface area.
    /// Writes the split position and both sides' bounds and leaf counts.
    unsafe fn find_best_partition(
        scratch: &mut RefineScratch,
        start: i32,
        count: i32,
        split_index: &mut i32,
        a_bounds: &mut BoundingBox,
        b_bounds: &mut BoundingBox,
        leaf_count_a: &mut i32,
        leaf_count_b: &mut i32,
    ) {
        let local_index_map = scratch.index_map.add(start as usize);

        let mut centroid_min = *scratch.subtree_centroids.add(*local_index_map as usize);
        let mut centroid_max = centroid_min;
        for i in 1..count {
            let centroid = *scratch
                .subtree_centroids
                .add(*local_index_map.add(i as usize) as usize);
            centroid_min = centroid_min.min(centroid);
            centroid_max = centroid_max.max(centroid);
        }
        let span = centroid_max - centroid_min;

        if span.max_element() < CENTROID_EPSILON {
            // Every centroid is effectively coincident; bins can't separate
            // anything, so split the range down the middle.
            let middle = count / 2;
            *a_bounds = BoundingBox::empty();
            *b_bounds = BoundingBox::empty();
            *leaf_count_a = 0;
            *leaf_count_b = 0;
            for i in 0..count {
                let subtree = *local_index_map.add(i as usize);
                if i < middle {
                    a_bounds.merge_with(&*scratch.subtree_bounds.add(subtree as usize));
                    *leaf_count_a += *scratch.subtree_leaf_counts.add(subtree as usize);
                } else {
                    b_bounds.merge_with(&*scratch.subtree_bounds.add(subtree as usize));
                    *leaf_count_b += *scratch.subtree_leaf_counts.add(subtree as usize);
                }
            }
            *split_index = start + middle;
            return;
        }

        let bin_count = MAXIMUM_BIN_COUNT.min((count as f32 * 0.25).max(2.0) as i32);
        let inverse_bin_size = Vec3::new(
            if span.x > CENTROID_EPSILON { bin_count as f32 / span.x } else { 0.0 },
            if span.y > CENTROID_EPSILON { bin_count as f32 / span.y } else { 0.0 },
            if span.z > CENTROID_EPSILON { bin_count as f32 / span.z } else { 0.0 },
        );
        let maximum_bin_index = Vec3::splat((bin_count - 1) as f32);

        for axis in &scratch.axes {
            for bin in 0..bin_count as usize {
                *axis.bin_bounds.add(bin) = BoundingBox::empty();
                *axis.bin_leaf_counts.add(bin) = 0;
                *axis.bin_subtree_counts.add(bin) = 0;
            }
        }

        // Deposit every subtree into one bin per axis.
        for i in 0..count {
            let subtree = *local_index_map.add(i as usize);
            let centroid = *scratch.subtree_centroids.add(subtree as usize);
            let bin_indices =
                ((centroid - centroid_min) * inverse_bin_size).min(maximum_bin_index);
            let bounds = &*scratch.subtree_bounds.add(subtree as usize);
            let leaf_count = *scratch.subtree_leaf_counts.add(subtree as usize);
            for (axis_index, axis) in scratch.axes.iter().enumerate() {
                let bin = bin_indices[axis_index] as i32;
                *axis.subtree_bin_indices.add(i as usize) = bin;
                (*axis.bin_bounds.add(bin as usize)).merge_with(bounds);
                *axis.bin_leaf_counts.add(bin as usize) += leaf_count;
                *axis.bin_subtree_counts.add(bin as usize) += 1;
            }
        }

        // Prefix sweep so that sweep[i] covers bins 0..=i.
        for axis in &scratch.axes {
            *axis.sweep_bounds = *axis.bin_bounds;
            *axis.sweep_leaf_counts = *axis.bin_leaf_counts;
            for bin in 1..(bin_count - 1) as usize {
                let mut merged = *axis.sweep_bounds.add(bin - 1);
                merged.merge_with(&*axis.bin_bounds.add(bin));
                *axis.sweep_bounds.add(bin) = merged;
                *axis.sweep_leaf_counts.add(bin) =
                    *axis.sweep_leaf_counts.add(bin - 1) + *axis.bin_leaf_counts.add(bin);
            }
        }

        // Suffix sweep per axis, keeping the cheapest (axis, boundary) seen.
        let mut best_cost = f32::MAX;
        let mut best_axis = 0usize;
        let mut best_bin_split = 1i32;
        for (axis_index, axis) in scratch.axes.iter().enumerate() {
            let mut b_merged = BoundingBox::empty();
            let mut b_leaves = 0i32;
            for boundary in (1..bin_count).rev() {
                b_merged.merge_with(&*axis.bin_bounds.add(boundary as usize));
                b_leaves += *axis.bin_leaf_counts.add(boundary as usize);
                let a_leaves = *axis.sweep_leaf_counts.add((boundary - 1) as usize);
                if a_leaves == 0 || b_leaves == 0 {
                    continue;
                }
                let a_merged = &*axis.sweep_bounds.add((boundary - 1) as usize);
                let cost = a_leaves as f32 * Self::bounds_metric(&a_merged.min, &a_merged.max)
                    + b_leaves as f32 * Self::bounds_metric(&b_merged.min, &b_merged.max);
                if cost < best_cost {
                    best_cost = cost;
                    best_axis = axis_index;
                    best_bin_split = boundary;
                    *a_bounds = *a_merged;
                    *b_bounds = b_merged;
                    *leaf_count_a = a_leaves;
                    *leaf_count_b = b_leaves;
                }
            }
        }
        debug_assert!(
            best_cost < f32::MAX,
            "A non-degenerate centroid span always admits a split with both sides populated."
        );

        // Counting-sort the range by the winning axis's bin ids.
        let winner = &scratch.axes[best_axis];
        *scratch.bin_start_indices = 0;
        *scratch.bin_fill_counts = 0;
        for bin in 1..bin_count as usize {
            *scratch.bin_start_indices.add(bin) = *scratch.bin_start_indices.add(bin - 1)
                + *winner.bin_subtree_counts.add(bin - 1);
            *scratch.bin_fill_counts.add(bin) = 0;
        }
        for i in 0..count {
            let bin = *winner.subtree_bin_indices.add(i as usize) as usize;
            let fill = &mut *scratch.bin_fill_counts.add(bin);
            *scratch
                .temp_index_map
                .add((*scratch.bin_start_indices.add(bin) + *fill) as usize) =
                *local_index_map.add(i as usize);
            *fill += 1;
        }
        std::ptr::copy_nonoverlapping(scratch.temp_index_map, local_index_map, count as usize);

        *split_index = start + *scratch.bin_start_indices.add(best_bin_split as usize);
    }

    /// Builds a staging node over `index_map[start..start + count]` and
    /// returns its staging index. Ranges of one or two subtrees terminate the
    /// recursion as direct children.
    unsafe fn build_staging_node(
        scratch: &mut RefineScratch,
        start: i32,
        count: i32,
        staging_node_count: &mut i32,
    ) -> i32 {
        let staging_index = *staging_node_count;
        *staging_node_count += 1;

        if count <= 2 {
            let staging_node = &mut *scratch.staging_nodes.add(staging_index as usize);
            let children = &mut staging_node.a as *mut super::node::NodeChild;
            for i in 0..count {
                let subtree = *scratch.index_map.add((start + i) as usize);
                let bounds = &*scratch.subtree_bounds.add(subtree as usize);
                let child = &mut *children.add(i as usize);
                child.min = bounds.min;
                child.max = bounds.max;
                child.leaf_count = *scratch.subtree_leaf_counts.add(subtree as usize);
                child.index = Self::encode(subtree);
            }
            return staging_index;
        }

        let mut split_index = 0i32;
        let mut a_bounds = BoundingBox::default();
        let mut b_bounds = BoundingBox::default();
        let mut leaf_count_a = 0i32;
        let mut leaf_count_b = 0i32;
        Self::find_best_partition(
            scratch,
            start,
            count,
            &mut split_index,
            &mut a_bounds,
            &mut b_bounds,
            &mut leaf_count_a,
            &mut leaf_count_b,
        );
        let count_a = split_index - start;
        let count_b = start + count - split_index;
        debug_assert!(count_a > 0 && count_b > 0);

        {
            let staging_node = &mut *scratch.staging_nodes.add(staging_index as usize);
            staging_node.a.min = a_bounds.min;
            staging_node.a.max = a_bounds.max;
            staging_node.a.leaf_count = leaf_count_a;
            staging_node.b.min = b_bounds.min;
            staging_node.b.max = b_bounds.max;
            staging_node.b.leaf_count = leaf_count_b;
        }

        let index_a = if count_a > 1 {
            Self::build_staging_node(scratch, start, count_a, staging_node_count)
        } else {
            Self::encode(*scratch.index_map.add(start as usize))
        };
        let index_b = if count_b > 1 {
            Self::build_staging_node(scratch, split_index, count_b, staging_node_count)
        } else {
            Self::encode(*scratch.index_map.add(split_index as usize))
        };
        let staging_node = &mut *scratch.staging_nodes.add(staging_index as usize);
        staging_node.a.index = index_a;
        staging_node.b.index = index_b;
        staging_index
    }

    /// Writes a staged child into the real tree, recycling slots from the
    /// collected internal node list in ascending order.
    unsafe fn reify_staging_node(
        &mut self,
        parent: i32,
        index_in_parent: i32,
        scratch: &RefineScratch,
        staging_index: i32,
        subtrees: &QuickList<i32>,
        internal_slots: &QuickList<i32>,
        next_slot: &mut i32,
    ) -> i32 {
        debug_assert!(
            *next_slot < internal_slots.count,
            "A binary treelet can't need more internal slots than it released."
        );
        let real_index = internal_slots[*next_slot];
        *next_slot += 1;

        *(self.nodes.as_ptr() as *mut Node).add(real_index as usize) =
            *scratch.staging_nodes.add(staging_index as usize);
        let metanode = self.metanodes.get_mut(real_index);
        metanode.parent = parent;
        metanode.index_in_parent = index_in_parent;
        metanode.refine_flag = 0;

        self.reify_children(real_index, scratch, subtrees, internal_slots, next_slot);
        real_index
    }

    unsafe fn reify_children(
        &mut self,
        real_index: i32,
        scratch: &RefineScratch,
        subtrees: &QuickList<i32>,
        internal_slots: &QuickList<i32>,
        next_slot: &mut i32,
    ) {
        let node = &mut *(self.nodes.as_ptr() as *mut Node).add(real_index as usize);
        let children = &mut node.a as *mut super::node::NodeChild;
        for slot in 0..2i32 {
            let child = &mut *children.add(slot as usize);
            if child.index >= 0 {
                child.index = self.reify_staging_node(
                    real_index,
                    slot,
                    scratch,
                    child.index,
                    subtrees,
                    internal_slots,
                    next_slot,
                );
            } else {
                // The staged child references a collected subtree by its
                // position; resolve it and point it at its new parent.
                let reference = subtrees[Self::encode(child.index)];
                child.index = reference;
                self.set_child_link(reference, real_index, slot);
            }
        }
    }

    /// Rebuilds the treelet rooted at `node_index` over at most
    /// `maximum_subtrees` collected subtrees. The scratch lists must be empty
    /// and sized for `maximum_subtrees`.
    pub(crate) unsafe fn binned_refine(
        &mut self,
        node_index: i32,
        subtrees: &mut QuickList<i32>,
        maximum_subtrees: i32,
        internal_slots: &mut QuickList<i32>,
        scratch: &mut RefineScratch,
    ) {
        debug_assert!(subtrees.count == 0 && internal_slots.count == 0);
        self.collect_subtrees(
            node_index,
            maximum_subtrees,
            scratch.heap_entries,
            subtrees,
            internal_slots,
        );
        debug_assert!(
            internal_slots.count == subtrees.count - 2,
            "A binary treelet over n subtrees reuses exactly n - 2 internal slots plus its root."
        );
        debug_assert!(subtrees.count <= maximum_subtrees);

        // Gather each collected subtree's bounds, centroid, and leaf count
        // from the child record that owns it.
        for i in 0..subtrees.count {
            *scratch.index_map.add(i as usize) = i;
            let reference = subtrees[i];
            let owning_child = if reference >= 0 {
                let metanode = self.metanodes.get(reference);
                Self::node_child(self.nodes.get(metanode.parent), metanode.index_in_parent)
            } else {
                let leaf = self.leaves.get(Self::encode(reference));
                Self::node_child(self.nodes.get(leaf.node_index()), leaf.child_index())
            };
            *scratch.subtree_bounds.add(i as usize) =
                BoundingBox::new(owning_child.min, owning_child.max);
            *scratch.subtree_centroids.add(i as usize) = owning_child.min + owning_child.max;
            *scratch.subtree_leaf_counts.add(i as usize) = if reference >= 0 {
                owning_child.leaf_count
            } else {
                1
            };
        }

        let mut staging_node_count = 0i32;
        Self::build_staging_node(scratch, 0, subtrees.count, &mut staging_node_count);

        // The treelet root keeps its own slot (and its refinement mark); only
        // its children change.
        let staging_root = &*scratch.staging_nodes;
        let root_node = &mut *(self.nodes.as_ptr() as *mut Node).add(node_index as usize);
        root_node.a = staging_root.a;
        root_node.b = staging_root.b;
        let mut next_slot = 0i32;
        self.reify_children(node_index, scratch, subtrees, internal_slots, &mut next_slot);
    }
}
