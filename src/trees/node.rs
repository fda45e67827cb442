use glam::Vec3;

/// One child slot of a tree node: bounds, target index, and subtree leaf count.
///
/// A negative `index` encodes a leaf; decode it with
/// [`Tree::encode`](super::Tree::encode), which is its own inverse. The two
/// children of a node are stored contiguously, so a pointer to child A plus
/// one yields child B.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeChild {
    pub min: Vec3,
    pub index: i32,
    pub max: Vec3,
    /// Number of leaves in the subtree this child covers.
    pub leaf_count: i32,
}

/// 2-wide tree node.
///
/// The root's own bounding box is not stored anywhere; queries against the
/// broadphase are almost always inside it, and a caller that wants it can
/// merge the root's child bounds.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Node {
    pub a: NodeChild,
    pub b: NodeChild,
}

/// Bookkeeping for a node that queries never touch. Kept in a parallel array
/// so traversal-hot nodes stay dense in cache.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Metanode {
    /// Index of the node holding this node as a child; -1 at the root.
    pub parent: i32,
    /// Which child slot of the parent holds this node (0 = A, 1 = B).
    pub index_in_parent: i32,
    /// Zero outside the maintenance pass. During the pass it lives three
    /// consecutive lives: pending-internal-child count during wavefront
    /// collection, atomically decremented fan-in counter during refit, and
    /// is-refinement-target mark between selection and the post-refine clear.
    pub refine_flag: i32,
    /// Change in bounds metric measured below this node by the latest refit.
    /// Only meaningful while refinement scheduling is reading it.
    pub local_cost_change: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn layout() {
        assert_eq!(mem::size_of::<NodeChild>(), 32);
        assert_eq!(mem::size_of::<Node>(), 64);
        assert_eq!(mem::size_of::<Metanode>(), 16);
        assert_eq!(mem::align_of::<Node>(), 4);
    }

    #[test]
    fn children_are_adjacent() {
        let node = Node {
            a: NodeChild {
                index: 1,
                ..Default::default()
            },
            b: NodeChild {
                index: 2,
                ..Default::default()
            },
        };
        unsafe {
            let children = &node.a as *const NodeChild;
            assert_eq!((*children.add(0)).index, 1);
            assert_eq!((*children.add(1)).index, 2);
        }
    }
}
