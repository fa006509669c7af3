// src/resources/texture.rs
//! 2D textures and samplers.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::cache::hash_path;
use super::{
    CachedArgs, LoadArgs, NoCache, PriorityCell, Resource, ResourceFactory, ResourceKind, ResourceManager,
    ResourcePriority, TypedResource, UseCache,
};

// ---------- Texture2D ----------

/// Decoded RGBA8 (sRGB) texture.
#[derive(Debug)]
pub struct Texture2D {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    label: String,
    priority: PriorityCell,
}

impl Texture2D {
    pub fn from_rgba8(width: u32, height: u32, pixels: Vec<u8>, label: impl Into<String>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        crate::ensure!(
            width > 0 && height > 0 && pixels.len() == expected,
            "texture {}x{} needs {} bytes, got {}",
            width,
            height,
            expected,
            pixels.len()
        );
        Ok(Self {
            width,
            height,
            pixels,
            label: label.into(),
            priority: PriorityCell::default(),
        })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Texel fetch in linear `[0, 1]` (sRGB decoded), addressed by `mapping`.
    pub fn sample_nearest(&self, u: f32, v: f32, mapping: TextureMapping) -> [f32; 4] {
        let x = mapping.address(u, self.width);
        let y = mapping.address(v, self.height);
        let i = (y as usize * self.width as usize + x as usize) * 4;
        let px = &self.pixels[i..i + 4];
        [
            srgb_to_linear(px[0]),
            srgb_to_linear(px[1]),
            srgb_to_linear(px[2]),
            px[3] as f32 / 255.0,
        ]
    }
}

fn srgb_to_linear(value: u8) -> f32 {
    let c = value as f32 / 255.0;
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

impl Resource for Texture2D {
    fn size(&self) -> usize {
        self.pixels.len()
    }

    fn priority(&self) -> ResourcePriority {
        self.priority.get()
    }

    fn set_priority(&self, priority: ResourcePriority) {
        self.priority.set(priority)
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Texture2D
    }
}

impl TypedResource for Texture2D {
    const KIND: ResourceKind = ResourceKind::Texture2D;
}

/// Load an image file relative to the asset directory. Cached by path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureFromFile {
    pub path: PathBuf,
}

impl TextureFromFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl LoadArgs for TextureFromFile {
    type Resource = Texture2D;
    type Cache = UseCache;
    const TAG: &'static str = "TextureFromFile";
}

impl CachedArgs for TextureFromFile {
    fn cache_key(&self) -> u64 {
        hash_path(&self.path)
    }
}

/// Explicit pixel data. Never deduplicated.
#[derive(Clone, Debug)]
pub struct TextureFromPixels {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl TextureFromPixels {
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self {
            width,
            height,
            pixels: rgba.repeat(width as usize * height as usize),
        }
    }
}

impl LoadArgs for TextureFromPixels {
    type Resource = Texture2D;
    type Cache = NoCache;
    const TAG: &'static str = "TextureFromPixels";
}

// ---------- Sampler ----------

/// Addressing outside `[0, 1]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TextureMapping {
    #[default]
    Wrap = 0,
    Clamp = 1,
    Mirror = 2,
}

impl TextureMapping {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Clamp,
            2 => Self::Mirror,
            _ => Self::Wrap,
        }
    }

    /// Texel index for a normalized coordinate.
    pub fn address(self, coord: f32, extent: u32) -> u32 {
        let t = match self {
            Self::Wrap => coord.rem_euclid(1.0),
            Self::Clamp => coord.clamp(0.0, 1.0),
            Self::Mirror => {
                let period = coord.rem_euclid(2.0);
                if period > 1.0 {
                    2.0 - period
                } else {
                    period
                }
            }
        };
        ((t * extent as f32) as u32).min(extent.saturating_sub(1))
    }
}

/// Sampling state shared between materials.
#[derive(Debug)]
pub struct Sampler {
    mapping: RwLock<TextureMapping>,
    anisotropy: u8,
    priority: PriorityCell,
}

impl Sampler {
    #[inline]
    pub fn mapping(&self) -> TextureMapping {
        *self.mapping.read()
    }

    /// Last writer wins; the cache key keeps the creation-time mapping.
    pub fn set_mapping(&self, mapping: TextureMapping) {
        *self.mapping.write() = mapping;
    }

    #[inline]
    pub fn anisotropy(&self) -> u8 {
        self.anisotropy
    }
}

impl Resource for Sampler {
    fn size(&self) -> usize {
        std::mem::size_of::<Self>()
    }

    fn priority(&self) -> ResourcePriority {
        self.priority.get()
    }

    fn set_priority(&self, priority: ResourcePriority) {
        self.priority.set(priority)
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Sampler
    }
}

impl TypedResource for Sampler {
    const KIND: ResourceKind = ResourceKind::Sampler;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerFromDescription {
    pub mapping: TextureMapping,
    pub anisotropy: u8,
}

impl SamplerFromDescription {
    pub fn new(mapping: TextureMapping, anisotropy: u8) -> Self {
        Self { mapping, anisotropy }
    }
}

impl Default for SamplerFromDescription {
    fn default() -> Self {
        Self::new(TextureMapping::Wrap, 1)
    }
}

impl LoadArgs for SamplerFromDescription {
    type Resource = Sampler;
    type Cache = UseCache;
    const TAG: &'static str = "SamplerFromDescription";
}

impl CachedArgs for SamplerFromDescription {
    /// Bit-packed description: the key is the description itself.
    fn cache_key(&self) -> u64 {
        self.anisotropy as u64 | ((self.mapping as u64) << 8)
    }
}

// ---------- Loaders ----------

pub(super) fn register_loaders(factory: &mut ResourceFactory) {
    factory.register(|manager: &ResourceManager, args: &TextureFromFile| {
        let path = manager.resolve(&args.path);
        if !path.is_file() {
            return Err(Error::FileNotFound(path));
        }
        let image = image::open(&path)?.to_rgba8();
        let (width, height) = image.dimensions();
        log::debug!("decoded texture {} ({}x{})", path.display(), width, height);
        Texture2D::from_rgba8(width, height, image.into_raw(), path.display().to_string())
    });

    factory.register(|_: &ResourceManager, args: &TextureFromPixels| {
        Texture2D::from_rgba8(args.width, args.height, args.pixels.clone(), "pixels")
    });

    factory.register(|_: &ResourceManager, args: &SamplerFromDescription| {
        Ok(Sampler {
            mapping: RwLock::new(TextureMapping::from_u8(args.mapping as u8)),
            anisotropy: args.anisotropy.max(1),
            priority: PriorityCell::default(),
        })
    });
}
