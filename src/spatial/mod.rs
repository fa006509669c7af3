// src/spatial/mod.rs
//! Spatial partitioning used for frustum culling.

pub mod bounds;
pub mod octree;

pub use bounds::{Aabb, Frustum, Intersection, Plane};
pub use octree::{BoundableId, Octree, OctreeStats, SplitParameters, DEFAULT_OVERLAP_CONSTANT};
