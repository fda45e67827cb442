//! Structural validation and quality measurements.
//!
//! Nothing here runs during a frame; these exist for tests and for tracking
//! down corruption when an invariant check fires.

use super::node::Node;
use super::Tree;
use glam::Vec3;

impl Tree {
    /// SAH cost of the tree: summed child-record surface area over root
    /// surface area. Lower is better; refinement drives this down.
    pub fn measure_cost_metric(&self) -> f32 {
        let root = self.nodes.get(0);
        let mut merged_min = Vec3::splat(f32::MAX);
        let mut merged_max = Vec3::splat(f32::MIN);
        let child_count = self.leaf_count.min(2);
        for i in 0..child_count {
            let child = unsafe { Self::node_child(root, i) };
            merged_min = merged_min.min(child.min);
            merged_max = merged_max.max(child.max);
        }
        let root_metric = Self::bounds_metric(&merged_min, &merged_max);
        if self.leaf_count <= 2 || root_metric <= 0.0 {
            return 0.0;
        }
        let mut total = 0.0f32;
        for i in 0..self.node_count {
            let node = self.nodes.get(i);
            for slot in 0..2 {
                let child = unsafe { Self::node_child(node, slot) };
                total += Self::bounds_metric(&child.min, &child.max);
            }
        }
        total / root_metric
    }

    fn validate_node(
        &self,
        node_index: i32,
        expected_parent: i32,
        expected_index_in_parent: i32,
        expected_min: &Vec3,
        expected_max: &Vec3,
    ) -> i32 {
        let metanode = self.metanodes.get(node_index);
        assert_eq!(
            metanode.parent, expected_parent,
            "Bad parent index on node {node_index}."
        );
        assert_eq!(
            metanode.index_in_parent, expected_index_in_parent,
            "Bad index in parent on node {node_index}."
        );
        assert_eq!(
            metanode.refine_flag, 0,
            "Nonzero refine flag on node {node_index}."
        );

        let mut found_leaf_count = 0i32;
        let mut merged_min = Vec3::splat(f32::MAX);
        let mut merged_max = Vec3::splat(f32::MIN);
        let child_count = self.leaf_count.min(2);
        for i in 0..child_count {
            let child = unsafe { Self::node_child(self.nodes.get(node_index), i) };
            merged_min = merged_min.min(child.min);
            merged_max = merged_max.max(child.max);
            if child.index >= 0 {
                assert!(
                    child.index < self.node_count,
                    "Node {node_index} child {i} points past the node set."
                );
                let child_leaf_count =
                    self.validate_node(child.index, node_index, i, &child.min, &child.max);
                assert_eq!(
                    child_leaf_count, child.leaf_count,
                    "Bad leaf count under node {node_index} child {i}."
                );
                found_leaf_count += child_leaf_count;
            } else {
                assert_eq!(
                    child.leaf_count, 1,
                    "Node {node_index} child {i} is a leaf with leaf_count {}.",
                    child.leaf_count
                );
                found_leaf_count += 1;
                let leaf_index = Self::encode(child.index);
                assert!(
                    leaf_index >= 0 && leaf_index < self.leaf_count,
                    "Node-held leaf index out of range."
                );
                let leaf = self.leaves.get(leaf_index);
                assert!(
                    leaf.node_index() == node_index && leaf.child_index() == i,
                    "Leaf {leaf_index} and node {node_index} disagree about ownership."
                );
            }
        }

        let metric = Self::bounds_metric(&merged_min, &merged_max);
        assert!(
            found_leaf_count == 0 || (!metric.is_nan() && !metric.is_infinite()),
            "Node {node_index} bounds are corrupt: {merged_min:?}, {merged_max:?}."
        );
        if expected_parent >= 0 {
            assert!(
                merged_min == *expected_min && merged_max == *expected_max,
                "Node {node_index} bounds {merged_min:?}, {merged_max:?} do not match the \
                 parent's record ({expected_min:?}, {expected_max:?})."
            );
        }
        found_leaf_count
    }

    /// Walks the whole tree, panicking on any structural inconsistency:
    /// parent/child asymmetry, leaf pointer disagreement, inexact bounds,
    /// wrong leaf counts, or a leftover refine flag.
    pub fn validate(&self) {
        assert!(
            self.node_count >= 0 && self.node_count <= self.nodes.len(),
            "Node count {} does not fit the backing buffer ({}).",
            self.node_count,
            self.nodes.len()
        );
        if self.leaf_count > 0 {
            let root = self.metanodes.get(0);
            assert!(
                root.parent == -1 && root.index_in_parent == -1,
                "Invalid parent pointers on the root."
            );
        }
        assert!(
            (self.node_count == 1 && self.leaf_count < 2)
                || (self.node_count == self.leaf_count - 1 && self.leaf_count >= 2),
            "Node count {} is inconsistent with leaf count {}.",
            self.node_count,
            self.leaf_count
        );

        let stand_in = Vec3::ZERO;
        let found_leaf_count = self.validate_node(0, -1, -1, &stand_in, &stand_in);
        assert_eq!(
            found_leaf_count, self.leaf_count,
            "Reachable leaves do not match the leaf count."
        );

        for i in 0..self.leaf_count {
            let leaf = self.leaves.get(i);
            assert!(
                leaf.node_index() >= 0 && leaf.node_index() < self.node_count,
                "Leaf {i} points outside the node set."
            );
            let child = unsafe {
                Self::node_child(self.nodes.get(leaf.node_index()), leaf.child_index())
            };
            assert_eq!(
                Self::encode(child.index),
                i,
                "Leaf {i} and its owning node disagree."
            );
        }
    }

    fn maximum_depth(&self, node: &Node, depth: i32) -> i32 {
        let mut maximum = depth;
        let child_count = self.leaf_count.min(2);
        for i in 0..child_count {
            let child = unsafe { Self::node_child(node, i) };
            if child.index >= 0 {
                maximum = maximum.max(self.maximum_depth(self.nodes.get(child.index), depth + 1));
            }
        }
        maximum
    }

    /// Longest root-to-node path in the tree.
    pub fn compute_maximum_depth(&self) -> i32 {
        self.maximum_depth(self.nodes.get(0), 0)
    }

    fn cache_quality(
        &self,
        node_index: i32,
        found_nodes: &mut i32,
        score: &mut f32,
        scorable: &mut i32,
    ) {
        let mut well_placed = 0;
        let mut internal_children = 0;
        let mut expected_child_index = node_index + 1;
        let child_count = self.leaf_count.min(2);
        for i in 0..child_count {
            let child = unsafe { Self::node_child(self.nodes.get(node_index), i) };
            if child.index >= 0 {
                internal_children += 1;
                if child.index == expected_child_index {
                    well_placed += 1;
                }
                let mut child_found = 0;
                self.cache_quality(child.index, &mut child_found, score, scorable);
                *found_nodes += child_found;
                expected_child_index += child_found;
            }
        }
        *found_nodes += 1;
        if internal_children > 0 {
            *score += well_placed as f32 / internal_children as f32;
            *scorable += 1;
        }
    }

    /// Fraction of internal children sitting in their depth-first slots,
    /// from 0 to 1. A perfectly cache-optimized tree measures 1.0.
    pub fn measure_cache_quality(&self) -> f32 {
        self.measure_cache_quality_at(0)
    }

    /// Cache quality of the subtree rooted at `node_index`.
    pub fn measure_cache_quality_at(&self, node_index: i32) -> f32 {
        assert!(
            node_index >= 0 && node_index < self.node_count,
            "Measurement target must be inside the node set."
        );
        let mut found_nodes = 0;
        let mut score = 0.0f32;
        let mut scorable = 0;
        self.cache_quality(node_index, &mut found_nodes, &mut score, &mut scorable);
        if scorable > 0 {
            score / scorable as f32
        } else {
            1.0
        }
    }
}
