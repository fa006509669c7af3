// src/resources/material.rs
//! Materials and the property-lookup binding step used by importers.
//!
//! Importers describe a material as a flat lookup of `name -> value | texture list`.
//! [`bind_material`] maps the renderer's named inputs onto that lookup, loading
//! textures and samplers through the [`ResourceManager`] so they are shared.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::{Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::context::{Context, OptionContext};
use crate::error::{Error, Result};

use super::cache::hash_path;
use super::texture::{Sampler, SamplerFromDescription, Texture2D, TextureFromFile, TextureMapping};
use super::{
    CachedArgs, LoadArgs, NoCache, PriorityCell, Resource, ResourceFactory, ResourceKind, ResourceManager,
    ResourcePriority, TypedResource, UseCache,
};

/// One importer property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Scalar(f32),
    Vector(Vec<f32>),
    Textures(Vec<PathBuf>),
    Text(String),
}

/// Flat `property[name] -> value` lookup.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaterialProperties(BTreeMap<String, PropertyValue>);

impl MaterialProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: PropertyValue) -> &mut Self {
        self.0.insert(name.into(), value);
        self
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.0.get(name)
    }

    /// First of `names` holding a numeric vector, padded with `fill`.
    fn vector<const N: usize>(&self, names: &[&str], fill: f32) -> Option<[f32; N]> {
        names.iter().find_map(|name| match self.get(name)? {
            PropertyValue::Vector(v) => {
                let mut out = [fill; N];
                for (dst, src) in out.iter_mut().zip(v) {
                    *dst = *src;
                }
                Some(out)
            }
            PropertyValue::Scalar(s) => Some([*s; N]),
            _ => None,
        })
    }

    fn scalar(&self, names: &[&str]) -> Option<f32> {
        names.iter().find_map(|name| match self.get(name)? {
            PropertyValue::Scalar(s) => Some(*s),
            _ => None,
        })
    }

    fn first_texture(&self, names: &[&str]) -> Option<&Path> {
        names.iter().find_map(|name| match self.get(name)? {
            PropertyValue::Textures(list) => list.first().map(PathBuf::as_path),
            PropertyValue::Text(path) => Some(Path::new(path.as_str())),
            _ => None,
        })
    }

    fn mapping(&self) -> TextureMapping {
        match self.get("texture_mapping") {
            Some(PropertyValue::Text(text)) => match text.as_str() {
                "clamp" => TextureMapping::Clamp,
                "mirror" => TextureMapping::Mirror,
                _ => TextureMapping::Wrap,
            },
            _ => TextureMapping::Wrap,
        }
    }
}

// Renderer inputs and the importer property names that can feed them.
const BASE_COLOR: &[&str] = &["base_color", "diffuse_color", "DiffuseColor"];
const OPACITY: &[&str] = &["opacity", "Opacity"];
const EMISSIVE: &[&str] = &["emissive", "emissive_color", "EmissiveColor"];
const ALBEDO_TEXTURE: &[&str] = &["albedo_texture", "diffuse_texture", "DiffuseColor"];

#[derive(Debug)]
pub struct Material {
    name: String,
    base_color: Vec4,
    emissive: Vec3,
    albedo: Option<Arc<Texture2D>>,
    sampler: Arc<Sampler>,
    priority: PriorityCell,
}

impl Material {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn base_color(&self) -> Vec4 {
        self.base_color
    }

    #[inline]
    pub fn emissive(&self) -> Vec3 {
        self.emissive
    }

    #[inline]
    pub fn albedo(&self) -> Option<&Arc<Texture2D>> {
        self.albedo.as_ref()
    }

    #[inline]
    pub fn sampler(&self) -> &Arc<Sampler> {
        &self.sampler
    }

    /// Base colour modulated by the albedo texture at `uv`.
    pub fn albedo_at(&self, u: f32, v: f32) -> Vec4 {
        match &self.albedo {
            Some(texture) => self.base_color * Vec4::from(texture.sample_nearest(u, v, self.sampler.mapping())),
            None => self.base_color,
        }
    }
}

impl Resource for Material {
    fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.name.len()
    }

    fn priority(&self) -> ResourcePriority {
        self.priority.get()
    }

    fn set_priority(&self, priority: ResourcePriority) {
        self.priority.set(priority)
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Material
    }
}

impl TypedResource for Material {
    const KIND: ResourceKind = ResourceKind::Material;
}

/// Maps named renderer inputs onto importer properties, loading referenced
/// textures (relative to `base_dir`) and the sampler through `manager`.
pub fn bind_material(
    manager: &ResourceManager,
    name: &str,
    properties: &MaterialProperties,
    base_dir: &Path,
) -> Result<Material> {
    let [r, g, b] = properties.vector::<3>(BASE_COLOR, 1.0).unwrap_or([1.0; 3]);
    let alpha = properties.scalar(OPACITY).unwrap_or(1.0);
    let emissive = properties.vector::<3>(EMISSIVE, 0.0).unwrap_or([0.0; 3]);

    let albedo = match properties.first_texture(ALBEDO_TEXTURE) {
        Some(path) => {
            let path = base_dir.join(path);
            let texture = manager
                .load(&TextureFromFile::new(&path))
                .with_context(|| format!("material '{name}' albedo"))?
                .with_context(|| format!("no texture loader for {}", path.display()))?;
            Some(texture)
        }
        None => None,
    };

    let sampler = manager
        .load(&SamplerFromDescription::new(properties.mapping(), 1))?
        .context("no sampler loader registered")?;

    Ok(Material {
        name: name.to_string(),
        base_color: Vec4::new(r, g, b, alpha),
        emissive: Vec3::from(emissive),
        albedo,
        sampler,
        priority: PriorityCell::default(),
    })
}

// ---------- Load arguments ----------

/// JSON material description on disk. Cached by path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaterialFromFile {
    pub path: PathBuf,
}

impl MaterialFromFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl LoadArgs for MaterialFromFile {
    type Resource = Material;
    type Cache = UseCache;
    const TAG: &'static str = "MaterialFromFile";
}

impl CachedArgs for MaterialFromFile {
    fn cache_key(&self) -> u64 {
        hash_path(&self.path)
    }
}

#[derive(Deserialize)]
struct MaterialFile {
    #[serde(default)]
    name: Option<String>,
    properties: MaterialProperties,
}

/// Importer output; textures resolve relative to `base_dir`.
#[derive(Clone, Debug, Default)]
pub struct MaterialFromProperties {
    pub name: String,
    pub properties: MaterialProperties,
    pub base_dir: PathBuf,
}

impl MaterialFromProperties {
    pub fn new(name: impl Into<String>, properties: MaterialProperties, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            properties,
            base_dir: base_dir.into(),
        }
    }
}

impl LoadArgs for MaterialFromProperties {
    type Resource = Material;
    type Cache = NoCache;
    const TAG: &'static str = "MaterialFromProperties";
}

/// Editable copy of an existing material.
#[derive(Clone, Debug)]
pub struct MaterialInstance {
    pub base: Arc<Material>,
    pub base_color: Option<Vec4>,
}

impl MaterialInstance {
    pub fn new(base: Arc<Material>) -> Self {
        Self { base, base_color: None }
    }

    pub fn with_base_color(mut self, color: Vec4) -> Self {
        self.base_color = Some(color);
        self
    }
}

impl LoadArgs for MaterialInstance {
    type Resource = Material;
    type Cache = NoCache;
    const TAG: &'static str = "MaterialInstance";
}

pub(super) fn register_loaders(factory: &mut ResourceFactory) {
    factory.register(|manager: &ResourceManager, args: &MaterialFromFile| {
        let path = manager.resolve(&args.path);
        if !path.is_file() {
            return Err(Error::FileNotFound(path));
        }
        let text = std::fs::read_to_string(&path)?;
        let file: MaterialFile = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = file
            .name
            .unwrap_or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default());
        bind_material(manager, &name, &file.properties, &base_dir)
    });

    factory.register(|manager: &ResourceManager, args: &MaterialFromProperties| {
        bind_material(manager, &args.name, &args.properties, &manager.resolve(&args.base_dir))
    });

    factory.register(|_: &ResourceManager, args: &MaterialInstance| {
        let base = &args.base;
        Ok(Material {
            name: format!("{} (instance)", base.name),
            base_color: args.base_color.unwrap_or(base.base_color),
            emissive: base.emissive,
            albedo: base.albedo.clone(),
            sampler: Arc::clone(&base.sampler),
            priority: base.priority.clone(),
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("prism_material_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_properties_deserialize_untagged() {
        let props: MaterialProperties = serde_json::from_str(
            r#"{ "diffuse_color": [0.5, 0.25, 1.0], "opacity": 0.5, "diffuse_texture": ["rock.png"], "texture_mapping": "clamp" }"#,
        )
        .unwrap();
        assert_eq!(props.get("opacity"), Some(&PropertyValue::Scalar(0.5)));
        assert_eq!(props.first_texture(ALBEDO_TEXTURE), Some(Path::new("rock.png")));
        assert_eq!(props.vector::<3>(BASE_COLOR, 1.0), Some([0.5, 0.25, 1.0]));
        assert_eq!(props.mapping(), TextureMapping::Clamp);
    }

    #[test]
    fn test_materials_share_textures_and_samplers() {
        let dir = scratch_dir("share");
        image::RgbaImage::from_pixel(2, 2, image::Rgba([255, 255, 255, 255]))
            .save(dir.join("rock.png"))
            .unwrap();
        let manager = ResourceManager::with_defaults(&dir);

        let mut props = MaterialProperties::new();
        props
            .set("base_color", PropertyValue::Vector(vec![1.0, 0.0, 0.0]))
            .set("albedo_texture", PropertyValue::Textures(vec![PathBuf::from("rock.png")]));
        let args = MaterialFromProperties {
            name: "red rock".into(),
            properties: props,
            base_dir: PathBuf::new(),
        };
        let a = manager.load(&args).unwrap().unwrap();
        let b = manager.load(&args).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(a.albedo().unwrap(), b.albedo().unwrap()));
        assert!(Arc::ptr_eq(a.sampler(), b.sampler()));
        assert_eq!(a.albedo_at(0.1, 0.1), Vec4::new(1.0, 0.0, 0.0, 1.0));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_material_file_is_cached_and_instanced() {
        let dir = scratch_dir("file");
        std::fs::write(
            dir.join("metal.json"),
            r#"{ "properties": { "base_color": [0.2, 0.4, 0.6], "emissive": [1.0, 0.5, 0.0] } }"#,
        )
        .unwrap();
        let manager = ResourceManager::with_defaults(&dir);
        let first = manager.load(&MaterialFromFile::new("metal.json")).unwrap().unwrap();
        let second = manager.load(&MaterialFromFile::new("metal.json")).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "metal");
        assert_eq!(first.emissive(), Vec3::new(1.0, 0.5, 0.0));
        assert!(first.albedo().is_none());

        let tinted = manager
            .load(&MaterialInstance::new(Arc::clone(&first)).with_base_color(Vec4::ONE))
            .unwrap()
            .unwrap();
        assert_eq!(tinted.base_color(), Vec4::ONE);
        assert_eq!(first.base_color(), Vec4::new(0.2, 0.4, 0.6, 1.0));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_missing_texture_propagates() {
        let manager = ResourceManager::with_defaults(std::env::temp_dir());
        let mut props = MaterialProperties::new();
        props.set("albedo_texture", PropertyValue::Text("nowhere/missing.png".into()));
        let err = manager
            .load(&MaterialFromProperties {
                name: "broken".into(),
                properties: props,
                base_dir: PathBuf::new(),
            })
            .unwrap_err();
        assert!(err.is_io());
        assert_eq!(manager.stats().direct_entries, 0);
    }
}
