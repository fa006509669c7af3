// src/gpu/mod.rs
//! GPU backend abstraction.
//!
//! The renderer and the postprocess chain only ever "allocate/recycle a surface of
//! a given description" and "submit a draw with bound inputs". Two backends
//! implement that contract:
//!
//! * [`headless::HeadlessBackend`]: CPU surfaces, software rasterizer and CPU
//!   effect kernels. Deterministic, used by tests and offline runs.
//! * [`wgpu_backend::WgpuBackend`]: wgpu textures and WGSL full-screen passes.

pub mod headless;
pub mod pool;
pub mod wgpu_backend;

use std::fmt;
use std::sync::Arc;

use glam::{Mat4, Vec3};

use crate::error::{Error, Result};
use crate::resources::{Material, Mesh};

pub use pool::{PoolStats, SurfacePool};

// ---------- Surfaces ----------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SurfaceFormat {
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
    Depth32Float,
}

impl SurfaceFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8Unorm | Self::Depth32Float => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }

    #[inline]
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Rgba8Unorm => "Rgba8Unorm",
            Self::Rgba16Float => "Rgba16Float",
            Self::Rgba32Float => "Rgba32Float",
            Self::Depth32Float => "Depth32Float",
        }
    }
}

impl fmt::Display for SurfaceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pool key: surfaces are interchangeable when their descriptions match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceDesc {
    pub width: u32,
    pub height: u32,
    pub format: SurfaceFormat,
    pub mip_levels: u32,
}

impl SurfaceDesc {
    #[inline]
    pub fn new(width: u32, height: u32, format: SurfaceFormat) -> Self {
        Self {
            width,
            height,
            format,
            mip_levels: 1,
        }
    }

    #[inline]
    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Approximate memory footprint (base level plus the mip chain).
    pub fn size_bytes(&self) -> usize {
        let mut total = 0;
        let (mut w, mut h) = (self.width as usize, self.height as usize);
        for _ in 0..self.mip_levels.max(1) {
            total += w * h * self.format.bytes_per_pixel();
            w = (w / 2).max(1);
            h = (h / 2).max(1);
        }
        total
    }

    pub(crate) fn allocation_error(&self, reason: impl Into<String>) -> Error {
        Error::Allocation {
            width: self.width,
            height: self.height,
            format: self.format.name().to_string(),
            reason: reason.into(),
        }
    }
}

/// Process-unique surface identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

/// Cheap, cloneable handle to a backend surface.
pub trait GpuSurface: Clone {
    fn id(&self) -> SurfaceId;
    fn desc(&self) -> SurfaceDesc;
}

// G-buffer and chain formats shared by the renderer, the postprocess chain and
// the backends' pipelines.
pub const ALBEDO_FORMAT: SurfaceFormat = SurfaceFormat::Rgba16Float;
pub const NORMAL_FORMAT: SurfaceFormat = SurfaceFormat::Rgba16Float;
pub const POSITION_FORMAT: SurfaceFormat = SurfaceFormat::Rgba32Float;
pub const EMISSIVE_FORMAT: SurfaceFormat = SurfaceFormat::Rgba16Float;
pub const DEPTH_FORMAT: SurfaceFormat = SurfaceFormat::Depth32Float;
pub const HDR_FORMAT: SurfaceFormat = SurfaceFormat::Rgba32Float;
pub const BLOOM_FORMAT: SurfaceFormat = SurfaceFormat::Rgba32Float;
pub const OUTPUT_FORMAT: SurfaceFormat = SurfaceFormat::Rgba16Float;

// ---------- Draws ----------

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    pub range: f32,
}

/// One mesh subset into the G-buffer.
/// Targets: albedo, normal, position, emissive, depth.
#[derive(Clone, Copy, Debug)]
pub struct GeometryParams<'a> {
    pub mesh: &'a Arc<Mesh>,
    pub subset: usize,
    pub material: &'a Arc<Material>,
    pub world: Mat4,
    pub view_proj: Mat4,
}

/// Inputs: albedo, normal, position, emissive. Target: HDR image.
#[derive(Clone, Copy, Debug)]
pub struct LightingParams<'a> {
    pub lights: &'a [PointLight],
    pub ambient: Vec3,
}

/// Input: HDR image. Target: bloom buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BloomParams {
    pub average_luminance: f32,
    pub key_value: f32,
    pub exposure: f32,
    pub threshold: f32,
    pub strength: f32,
    pub sigma: f32,
}

/// Inputs: HDR image, bloom buffer. Target: display image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TonemapParams {
    pub average_luminance: f32,
    pub key_value: f32,
    pub vignette: f32,
}

/// Percentile window of the luminance histogram.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LuminanceSettings {
    pub min_luminance: f32,
    pub max_luminance: f32,
    pub low_percentage: f32,
    pub high_percentage: f32,
}

#[derive(Clone, Copy, Debug)]
pub enum Pass<'a> {
    Geometry(GeometryParams<'a>),
    Lighting(LightingParams<'a>),
    Bloom(BloomParams),
    Tonemap(TonemapParams),
}

impl Pass<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Pass::Geometry(_) => "geometry",
            Pass::Lighting(_) => "lighting",
            Pass::Bloom(_) => "bloom",
            Pass::Tonemap(_) => "tonemap",
        }
    }

    /// Expected `(inputs, targets)` formats.
    pub fn signature(&self) -> (&'static [SurfaceFormat], &'static [SurfaceFormat]) {
        match self {
            Pass::Geometry(_) => (&[], &[ALBEDO_FORMAT, NORMAL_FORMAT, POSITION_FORMAT, EMISSIVE_FORMAT, DEPTH_FORMAT]),
            Pass::Lighting(_) => (&[ALBEDO_FORMAT, NORMAL_FORMAT, POSITION_FORMAT, EMISSIVE_FORMAT], &[HDR_FORMAT]),
            Pass::Bloom(_) => (&[HDR_FORMAT], &[BLOOM_FORMAT]),
            Pass::Tonemap(_) => (&[HDR_FORMAT, BLOOM_FORMAT], &[OUTPUT_FORMAT]),
        }
    }
}

/// A pass with its bound input and target surfaces.
pub struct Draw<'a, S> {
    pub pass: Pass<'a>,
    pub inputs: &'a [&'a S],
    pub targets: &'a [&'a S],
}

impl<'a, S: GpuSurface> Draw<'a, S> {
    pub fn new(pass: Pass<'a>, inputs: &'a [&'a S], targets: &'a [&'a S]) -> Self {
        Self { pass, inputs, targets }
    }

    /// Checks formats, matching target sizes and that no surface is bound twice.
    pub fn validate(&self) -> Result<()> {
        let pass = self.pass.name();
        let invalid = |reason: String| Error::InvalidDraw { pass, reason };
        let (inputs, targets) = self.pass.signature();

        if self.inputs.len() != inputs.len() || self.targets.len() != targets.len() {
            return Err(invalid(format!(
                "expected {} inputs and {} targets, got {} and {}",
                inputs.len(),
                targets.len(),
                self.inputs.len(),
                self.targets.len()
            )));
        }
        for (surface, format) in self.inputs.iter().chain(self.targets.iter()).zip(inputs.iter().chain(targets)) {
            if surface.desc().format != *format {
                return Err(invalid(format!("surface {:?} is {}, expected {}", surface.id(), surface.desc().format, format)));
            }
        }
        let extent = |s: &S| (s.desc().width, s.desc().height);
        if let Some(first) = self.targets.first() {
            if self.targets.iter().any(|t| extent(*t) != extent(*first)) {
                return Err(invalid("targets differ in size".into()));
            }
        }
        let mut bound: Vec<SurfaceId> = self.inputs.iter().chain(self.targets).map(|s| s.id()).collect();
        bound.sort_unstable();
        if let Some(pair) = bound.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(invalid(format!("surface {:?} bound more than once", pair[0])));
        }
        Ok(())
    }
}

/// Narrow device interface consumed by the renderer and the postprocess chain.
pub trait GpuBackend {
    type Surface: GpuSurface;

    fn allocate_surface(&self, desc: &SurfaceDesc) -> Result<Self::Surface>;

    /// Fills a surface. Depth surfaces use `value[0]`.
    fn clear(&self, target: &Self::Surface, value: [f32; 4]) -> Result<()>;

    fn submit(&self, draw: &Draw<'_, Self::Surface>) -> Result<()>;

    /// Percentile-window average luminance of an HDR image.
    fn measure_luminance(&self, image: &Self::Surface, settings: &LuminanceSettings) -> Result<f32>;

    fn present(&self, surface: &Self::Surface) -> Result<()>;
}
