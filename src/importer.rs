// src/importer.rs
//! glTF import.
//!
//! A file becomes one [`Mesh`] with a subset per triangle primitive and one
//! material per subset. Node transforms of the default scene are baked into the
//! vertices, so the model is placed by a single transform when spawned.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::{Mat3, Mat4, Vec2, Vec3};

use crate::context::{Context, OptionContext};
use crate::error::{Error, Result};
use crate::resources::{
    Material, MaterialFromProperties, MaterialProperties, Mesh, MeshFromVertices, MeshSubset, PropertyValue,
    ResourceManager, Vertex,
};
use crate::scene::{MeshRendererComponent, NodeId, Scene, TransformComponent, VolumeComponent};

/// Geometry and materials of one imported file.
#[derive(Clone, Debug)]
pub struct ImportedModel {
    pub name: String,
    pub mesh: Arc<Mesh>,
    /// One per mesh subset.
    pub materials: Vec<Arc<Material>>,
}

/// Loads a `.gltf`/`.glb` file (relative paths resolve against the manager's
/// base directory). Textures referenced by URI resolve next to the file.
pub fn import_gltf(manager: &ResourceManager, path: impl AsRef<Path>) -> Result<ImportedModel> {
    let path = manager.resolve(path.as_ref());
    if !path.is_file() {
        return Err(Error::FileNotFound(path));
    }
    let (document, buffers, _images) =
        gltf::import(&path).with_context(|| format!("importing {}", path.display()))?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut builder = ModelBuilder::default();
    let scene = document.default_scene().or_else(|| document.scenes().next());
    match scene {
        Some(scene) => {
            for node in scene.nodes() {
                builder.visit(&node, Mat4::IDENTITY, &buffers);
            }
        }
        // No scene graph: every mesh at the origin.
        None => {
            for mesh in document.meshes() {
                builder.add_mesh(&mesh, Mat4::IDENTITY, &buffers);
            }
        }
    }
    crate::ensure!(!builder.subsets.is_empty(), "{} contains no triangle geometry", path.display());

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".into());
    let mesh = manager
        .load(&MeshFromVertices {
            vertices: builder.vertices,
            indices: builder.indices,
            subsets: builder.subsets,
        })
        .with_context(|| format!("building mesh for {name}"))?
        .context("no mesh loader registered")?;

    let mut materials = Vec::with_capacity(builder.materials.len());
    for (index, properties) in builder.materials.into_iter().enumerate() {
        let args = MaterialFromProperties::new(format!("{name}#{index}"), properties, base_dir.clone());
        let material = manager
            .load(&args)
            .with_context(|| format!("material {} of {}", index, path.display()))?
            .context("no material loader registered")?;
        materials.push(material);
    }

    log::info!(
        "imported {}: {} vertices, {} subsets",
        path.display(),
        mesh.vertices().len(),
        mesh.subsets().len()
    );
    Ok(ImportedModel { name, mesh, materials })
}

/// Creates a node under `parent` carrying transform, volume and mesh renderer
/// components for `model`.
pub fn spawn_model(scene: &mut Scene, parent: NodeId, model: &ImportedModel) -> Result<NodeId> {
    let node = scene.create_node(model.name.clone(), parent)?;
    scene.add_component(node, TransformComponent::identity())?;
    scene.add_component(node, VolumeComponent::new(model.mesh.bounds()))?;
    scene.add_component(
        node,
        MeshRendererComponent::new(Arc::clone(&model.mesh), model.materials.clone()),
    )?;
    Ok(node)
}

#[derive(Default)]
struct ModelBuilder {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    subsets: Vec<MeshSubset>,
    materials: Vec<MaterialProperties>,
}

impl ModelBuilder {
    fn visit(&mut self, node: &gltf::Node<'_>, parent: Mat4, buffers: &[gltf::buffer::Data]) {
        let world = parent * Mat4::from_cols_array_2d(&node.transform().matrix());
        if let Some(mesh) = node.mesh() {
            self.add_mesh(&mesh, world, buffers);
        }
        for child in node.children() {
            self.visit(&child, world, buffers);
        }
    }

    fn add_mesh(&mut self, mesh: &gltf::Mesh<'_>, world: Mat4, buffers: &[gltf::buffer::Data]) {
        for primitive in mesh.primitives() {
            if primitive.mode() != gltf::mesh::Mode::Triangles {
                log::debug!(
                    "skipping {:?} primitive {} of mesh {:?}",
                    primitive.mode(),
                    primitive.index(),
                    mesh.name()
                );
                continue;
            }
            self.add_primitive(&primitive, world, buffers);
        }
    }

    fn add_primitive(&mut self, primitive: &gltf::Primitive<'_>, world: Mat4, buffers: &[gltf::buffer::Data]) {
        let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| &data.0[..]));
        let Some(positions) = reader.read_positions() else {
            log::debug!("primitive {} has no positions", primitive.index());
            return;
        };
        let positions: Vec<Vec3> = positions.map(|p| world.transform_point3(Vec3::from(p))).collect();
        let local: Vec<u32> = match reader.read_indices() {
            Some(indices) => indices.into_u32().collect(),
            None => (0..positions.len() as u32).collect(),
        };
        if local.len() < 3 || local.iter().any(|&i| i as usize >= positions.len()) {
            log::warn!("primitive {} has invalid indices, skipped", primitive.index());
            return;
        }
        let local = &local[..local.len() - local.len() % 3];

        let normal_matrix = Mat3::from_mat4(world).inverse().transpose();
        let normals: Vec<Vec3> = match reader.read_normals() {
            Some(normals) => normals.map(|n| (normal_matrix * Vec3::from(n)).normalize_or_zero()).collect(),
            None => flat_normals(&positions, local),
        };
        let uvs: Vec<Vec2> = reader
            .read_tex_coords(0)
            .map(|uvs| uvs.into_f32().map(Vec2::from).collect())
            .unwrap_or_default();

        let base = self.vertices.len() as u32;
        for (i, position) in positions.iter().enumerate() {
            let normal = normals.get(i).copied().unwrap_or(Vec3::Y);
            let uv = uvs.get(i).copied().unwrap_or(Vec2::ZERO);
            self.vertices.push(Vertex::new(*position, normal, uv));
        }
        self.subsets.push(MeshSubset {
            start_index: self.indices.len() as u32,
            index_count: local.len() as u32,
        });
        self.indices.extend(local.iter().map(|&i| base + i));
        self.materials.push(material_properties(&primitive.material()));
    }
}

/// Area-weighted vertex normals for primitives that ship without any.
fn flat_normals(positions: &[Vec3], indices: &[u32]) -> Vec<Vec3> {
    let mut normals = vec![Vec3::ZERO; positions.len()];
    for triangle in indices.chunks_exact(3) {
        let [a, b, c] = [triangle[0], triangle[1], triangle[2]].map(|i| i as usize);
        let face = (positions[b] - positions[a]).cross(positions[c] - positions[a]);
        for i in [a, b, c] {
            normals[i] += face;
        }
    }
    normals.into_iter().map(|n| n.try_normalize().unwrap_or(Vec3::Y)).collect()
}

/// Maps a glTF material onto the importer property names the material binder reads.
fn material_properties(material: &gltf::Material<'_>) -> MaterialProperties {
    let pbr = material.pbr_metallic_roughness();
    let [r, g, b, a] = pbr.base_color_factor();
    let mut properties = MaterialProperties::new();
    properties
        .set("base_color", PropertyValue::Vector(vec![r, g, b]))
        .set("opacity", PropertyValue::Scalar(a))
        .set("emissive", PropertyValue::Vector(material.emissive_factor().to_vec()));

    if let Some(info) = pbr.base_color_texture() {
        let texture = info.texture();
        match texture.source().source() {
            gltf::image::Source::Uri { uri, .. } if !uri.starts_with("data:") => {
                properties.set("albedo_texture", PropertyValue::Textures(vec![PathBuf::from(uri)]));
            }
            _ => log::debug!(
                "material {:?}: embedded albedo image {} is not supported, using base colour",
                material.name(),
                texture.source().index()
            ),
        }
        let mapping = match texture.sampler().wrap_s() {
            gltf::texture::WrappingMode::ClampToEdge => "clamp",
            gltf::texture::WrappingMode::MirroredRepeat => "mirror",
            gltf::texture::WrappingMode::Repeat => "wrap",
        };
        properties.set("texture_mapping", PropertyValue::Text(mapping.into()));
    }
    properties
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::Aabb;
    use glam::Vec4;

    const TRIANGLE_GLTF: &str = r#"{
        "asset": { "version": "2.0" },
        "scene": 0,
        "scenes": [{ "nodes": [0] }],
        "nodes": [{ "mesh": 0, "translation": [0.0, 0.0, 2.0] }],
        "meshes": [{ "name": "tri", "primitives": [{ "attributes": { "POSITION": 0 }, "indices": 1, "material": 0 }] }],
        "materials": [{
            "name": "red",
            "pbrMetallicRoughness": { "baseColorFactor": [1.0, 0.0, 0.0, 1.0] },
            "emissiveFactor": [0.5, 0.0, 0.0]
        }],
        "buffers": [{ "uri": "tri.bin", "byteLength": 44 }],
        "bufferViews": [
            { "buffer": 0, "byteOffset": 0, "byteLength": 36, "target": 34962 },
            { "buffer": 0, "byteOffset": 36, "byteLength": 6, "target": 34963 }
        ],
        "accessors": [
            { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3", "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0] },
            { "bufferView": 1, "componentType": 5123, "count": 3, "type": "SCALAR" }
        ]
    }"#;

    fn write_triangle(dir: &Path) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let mut bin = Vec::with_capacity(44);
        for p in [[0.0f32, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]] {
            for c in p {
                bin.extend_from_slice(&c.to_le_bytes());
            }
        }
        for i in [0u16, 1, 2] {
            bin.extend_from_slice(&i.to_le_bytes());
        }
        bin.resize(44, 0);
        std::fs::write(dir.join("tri.bin"), bin).unwrap();
        let path = dir.join("tri.gltf");
        std::fs::write(&path, TRIANGLE_GLTF).unwrap();
        path
    }

    #[test]
    fn test_imports_triangle_with_material() {
        let dir = std::env::temp_dir().join(format!("prism_import_{}", std::process::id()));
        write_triangle(&dir);
        let manager = ResourceManager::with_defaults(&dir);

        let model = import_gltf(&manager, "tri.gltf").unwrap();
        assert_eq!(model.name, "tri");
        assert_eq!(model.mesh.vertices().len(), 3);
        assert_eq!(model.mesh.subsets().len(), 1);
        assert_eq!(model.materials.len(), 1);
        // Node translation is baked in.
        assert_eq!(
            model.mesh.bounds(),
            Aabb::from_min_max(Vec3::new(0.0, 0.0, 2.0), Vec3::new(1.0, 1.0, 2.0))
        );
        // Missing normals are derived from the winding.
        assert_eq!(Vec3::from(model.mesh.vertices()[0].normal), Vec3::Z);

        let material = &model.materials[0];
        assert_eq!(material.base_color(), Vec4::new(1.0, 0.0, 0.0, 1.0));
        assert_eq!(material.emissive(), Vec3::new(0.5, 0.0, 0.0));

        let mut scene = Scene::default();
        let root = scene.root();
        let node = spawn_model(&mut scene, root, &model).unwrap();
        assert_eq!(scene.node(node).unwrap().name(), "tri");
        assert!(scene.component::<MeshRendererComponent>(node).is_some());
        assert_eq!(scene.component::<VolumeComponent>(node).unwrap().local, model.mesh.bounds());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let manager = ResourceManager::with_defaults(std::env::temp_dir());
        let err = import_gltf(&manager, "does/not/exist.gltf").unwrap_err();
        assert!(err.is_io());
    }

    #[test]
    fn test_flat_normals_follow_winding() {
        let positions = [Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::new(5.0, 5.0, 5.0)];
        let normals = flat_normals(&positions, &[0, 2, 1]);
        assert_eq!(normals[0], Vec3::NEG_Z);
        // Unreferenced vertices get a default.
        assert_eq!(normals[3], Vec3::Y);
    }
}
