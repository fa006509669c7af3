// src/config.rs
//! Engine configuration, loaded from JSON.
//!
//! Every section and field has a default, so `{}` is a complete config file and
//! [`EngineConfig::default`] runs as is.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::postprocess::PostprocessConfig;
use crate::renderer::RendererConfig;
use crate::scene::RebuildPolicy;
use crate::spatial::DEFAULT_OVERLAP_CONSTANT;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Prism Engine".into(),
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Relative asset paths resolve against this directory.
    pub base_dir: PathBuf,
    /// Idle surfaces kept per render target pool.
    pub max_idle_surfaces: usize,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("assets"),
            max_idle_surfaces: 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    pub overlap_constant: f32,
    pub rebuild_policy: RebuildPolicy,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            overlap_constant: DEFAULT_OVERLAP_CONSTANT,
            rebuild_policy: RebuildPolicy::OnDemand,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// glTF file imported at startup instead of the demo scene.
    pub gltf: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub window: WindowConfig,
    pub resources: ResourcesConfig,
    pub spatial: SpatialConfig,
    pub renderer: RendererConfig,
    pub postprocess: PostprocessConfig,
    pub scene: SceneConfig,
}

impl EngineConfig {
    /// Reads and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json(&text).with_context(|| format!("config {}", path.display()))?;
        log::info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        crate::ensure!(
            self.window.width > 0 && self.window.height > 0,
            "window size must be non-zero, got {}x{}",
            self.window.width,
            self.window.height
        );
        crate::ensure!(
            self.spatial.overlap_constant > 0.0,
            "overlap constant must be positive, got {}",
            self.spatial.overlap_constant
        );
        let post = &self.postprocess;
        crate::ensure!(
            0.0 <= post.luminance_low_percentage
                && post.luminance_low_percentage <= post.luminance_high_percentage
                && post.luminance_high_percentage <= 1.0,
            "luminance percentiles must satisfy 0 <= low <= high <= 1"
        );
        crate::ensure!(
            post.min_luminance > 0.0 && post.min_luminance < post.max_luminance,
            "luminance range must satisfy 0 < min < max"
        );
        Ok(())
    }

    /// Renderer settings with the shared pool cap applied.
    pub fn renderer_config(&self) -> RendererConfig {
        RendererConfig {
            max_idle_surfaces: self.resources.max_idle_surfaces,
            ..self.renderer
        }
    }

    /// Postprocess settings with the shared pool cap applied.
    pub fn postprocess_config(&self) -> PostprocessConfig {
        PostprocessConfig {
            max_idle_surfaces: self.resources.max_idle_surfaces,
            ..self.postprocess
        }
    }
}
