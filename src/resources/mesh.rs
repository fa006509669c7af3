// src/resources/mesh.rs
//! Indexed triangle meshes split into material subsets.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

use crate::error::Result;
use crate::spatial::Aabb;

use super::{LoadArgs, NoCache, PriorityCell, Resource, ResourceFactory, ResourceKind, ResourceManager, ResourcePriority, TypedResource};

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            uv: uv.to_array(),
        }
    }
}

/// Contiguous index range drawn with one material.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MeshSubset {
    pub start_index: u32,
    pub index_count: u32,
}

#[derive(Debug)]
pub struct Mesh {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    subsets: Vec<MeshSubset>,
    bounds: Aabb,
    priority: PriorityCell,
}

impl Mesh {
    #[inline]
    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    #[inline]
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    #[inline]
    pub fn subsets(&self) -> &[MeshSubset] {
        &self.subsets
    }

    /// Object-space bounds of all vertices.
    #[inline]
    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn subset_indices(&self, subset: usize) -> &[u32] {
        match self.subsets.get(subset) {
            Some(s) => &self.indices[s.start_index as usize..(s.start_index + s.index_count) as usize],
            None => &[],
        }
    }
}

impl Resource for Mesh {
    fn size(&self) -> usize {
        self.vertices.len() * std::mem::size_of::<Vertex>() + self.indices.len() * std::mem::size_of::<u32>()
    }

    fn priority(&self) -> ResourcePriority {
        self.priority.get()
    }

    fn set_priority(&self, priority: ResourcePriority) {
        self.priority.set(priority)
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Mesh
    }
}

impl TypedResource for Mesh {
    const KIND: ResourceKind = ResourceKind::Mesh;
}

/// Explicit vertex data: not reproducible from a key, never deduplicated.
#[derive(Clone, Debug, Default)]
pub struct MeshFromVertices {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub subsets: Vec<MeshSubset>,
}

impl MeshFromVertices {
    /// One subset covering every index.
    pub fn single(vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        let subsets = vec![MeshSubset {
            start_index: 0,
            index_count: indices.len() as u32,
        }];
        Self {
            vertices,
            indices,
            subsets,
        }
    }

    /// Axis-aligned cube with per-face normals.
    pub fn cube(half_extent: f32) -> Self {
        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        let faces = [
            (Vec3::X, Vec3::Y),
            (Vec3::NEG_X, Vec3::Y),
            (Vec3::Y, Vec3::NEG_Z),
            (Vec3::NEG_Y, Vec3::Z),
            (Vec3::Z, Vec3::Y),
            (Vec3::NEG_Z, Vec3::Y),
        ];
        for (normal, up) in faces {
            let right = up.cross(normal);
            let base = vertices.len() as u32;
            for (u, v) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
                let offset = normal + right * (u * 2.0 - 1.0) + up * (v * 2.0 - 1.0);
                vertices.push(Vertex::new(offset * half_extent, normal, Vec2::new(u, 1.0 - v)));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self::single(vertices, indices)
    }
}

impl LoadArgs for MeshFromVertices {
    type Resource = Mesh;
    type Cache = NoCache;
    const TAG: &'static str = "MeshFromVertices";
}

fn build_mesh(args: &MeshFromVertices) -> Result<Mesh> {
    let vertex_count = args.vertices.len() as u32;
    crate::ensure!(args.indices.len() % 3 == 0, "index count {} is not a multiple of 3", args.indices.len());
    if let Some(bad) = args.indices.iter().find(|&&i| i >= vertex_count) {
        crate::bail!("index {} out of range for {} vertices", bad, vertex_count);
    }
    for subset in &args.subsets {
        let end = subset.start_index as usize + subset.index_count as usize;
        crate::ensure!(end <= args.indices.len(), "subset {:?} exceeds {} indices", subset, args.indices.len());
    }
    let bounds = Aabb::from_points(args.vertices.iter().map(|v| Vec3::from(v.position))).unwrap_or(Aabb::ZERO);
    Ok(Mesh {
        vertices: args.vertices.clone(),
        indices: args.indices.clone(),
        subsets: args.subsets.clone(),
        bounds,
        priority: PriorityCell::default(),
    })
}

pub(super) fn register_loaders(factory: &mut ResourceFactory) {
    factory.register(|_: &ResourceManager, args: &MeshFromVertices| build_mesh(args));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_geometry() {
        let manager = ResourceManager::with_defaults(std::env::temp_dir());
        let cube = manager.load(&MeshFromVertices::cube(0.5)).unwrap().unwrap();
        assert_eq!(cube.vertices().len(), 24);
        assert_eq!(cube.indices().len(), 36);
        assert_eq!(cube.subset_indices(0).len(), 36);
        assert!(cube.subset_indices(1).is_empty());
        assert_eq!(cube.bounds(), Aabb::new(Vec3::ZERO, Vec3::splat(0.5)));
        assert_eq!(cube.size(), 24 * 32 + 36 * 4);
    }

    #[test]
    fn test_invalid_indices_fail() {
        let mut args = MeshFromVertices::cube(1.0);
        args.indices[4] = 99;
        assert!(build_mesh(&args).is_err());

        let mut args = MeshFromVertices::cube(1.0);
        args.subsets[0].index_count = 40;
        assert!(build_mesh(&args).is_err());
    }
}
