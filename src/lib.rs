//! Dynamic bounding-volume-hierarchy maintenance for a real-time physics
//! broadphase.
//!
//! The tree is a strict binary hierarchy of AABBs over externally owned
//! leaves. Object motion dirties leaf bounds every frame; the maintenance
//! pass repairs internal bounds bottom-up in parallel, rebuilds a rotating
//! sample of degraded subtrees with a binned surface area heuristic, and
//! incrementally swaps node slots back toward depth-first order so traversal
//! stays cache friendly.
//!
//! ```
//! use broadtree::bounding_box::BoundingBox;
//! use broadtree::memory::buffer_pool::BufferPool;
//! use broadtree::thread_dispatcher::PassthroughDispatcher;
//! use broadtree::trees::{RefitRefineContext, Tree};
//! use glam::Vec3;
//!
//! let mut pool = BufferPool::new_default();
//! let mut tree = Tree::new(&mut pool, 64);
//! for i in 0..64 {
//!     let center = Vec3::new(i as f32, 0.0, 0.0);
//!     tree.add(BoundingBox::new(center, center + Vec3::ONE), &mut pool);
//! }
//!
//! let dispatcher = PassthroughDispatcher::new(4);
//! let mut context = RefitRefineContext::new();
//! unsafe {
//!     context.refit_and_refine(&mut tree, &mut pool, &dispatcher, 0, 1.0, 1.0);
//! }
//!
//! tree.validate();
//! tree.dispose(&mut pool);
//! ```

pub mod bounding_box;
pub mod collections;
pub mod memory;
pub mod thread_dispatcher;
pub mod trees;
