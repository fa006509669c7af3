// src/postprocess.rs
//! Postprocess chain: luminance metering, eye adaptation, bloom, tonemap.
//!
//! The only state carried across frames is the adapted luminance, which
//! starts at 0 and moves toward the metered value by `1 - exp(-dt * rate)`
//! each frame. Output and bloom scratch surfaces come from pools and are
//! recycled every frame.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::gpu::{
    BloomParams, Draw, GpuBackend, GpuSurface, LuminanceSettings, Pass, PoolStats, SurfaceDesc, SurfacePool,
    TonemapParams, BLOOM_FORMAT, OUTPUT_FORMAT,
};
use crate::time::Time;

/// Fixed tuning constants for the chain.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostprocessConfig {
    pub vignette: f32,
    pub bloom_exposure: f32,
    pub bloom_strength: f32,
    pub bloom_blur_sigma: f32,
    pub bloom_threshold: f32,
    pub key_value: f32,
    pub min_luminance: f32,
    pub max_luminance: f32,
    pub luminance_low_percentage: f32,
    pub luminance_high_percentage: f32,
    pub min_adapt_luminance: f32,
    pub max_adapt_luminance: f32,
    pub adaptation_rate: f32,
    /// Idle surfaces kept per pool.
    pub max_idle_surfaces: usize,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            vignette: 0.5,
            bloom_exposure: 1.0,
            bloom_strength: 0.5,
            bloom_blur_sigma: 1.67,
            bloom_threshold: 1.0,
            key_value: 0.4,
            min_luminance: 0.0156,
            max_luminance: 64.0,
            luminance_low_percentage: 0.85,
            luminance_high_percentage: 0.95,
            min_adapt_luminance: 0.2,
            max_adapt_luminance: 1.0,
            adaptation_rate: 0.75,
            max_idle_surfaces: 4,
        }
    }
}

impl PostprocessConfig {
    pub fn luminance_settings(&self) -> LuminanceSettings {
        LuminanceSettings {
            min_luminance: self.min_luminance,
            max_luminance: self.max_luminance,
            low_percentage: self.luminance_low_percentage,
            high_percentage: self.luminance_high_percentage,
        }
    }
}

/// One adaptation step: clamp the metered value, then smooth toward it.
#[inline]
pub fn adapt_luminance(previous: f32, measured: f32, delta_seconds: f32, config: &PostprocessConfig) -> f32 {
    let lo = config.min_adapt_luminance.min(config.max_adapt_luminance);
    let target = measured.clamp(lo, config.max_adapt_luminance);
    let ratio = 1.0 - (-delta_seconds.max(0.0) * config.adaptation_rate).exp();
    previous + (target - previous) * ratio
}

pub struct Postprocess<B: GpuBackend> {
    config: PostprocessConfig,
    current_luminance: f32,
    outputs: SurfacePool<B::Surface>,
    scratch: SurfacePool<B::Surface>,
    output: Option<B::Surface>,
}

impl<B: GpuBackend> Postprocess<B> {
    pub fn new(config: PostprocessConfig) -> Self {
        Self {
            config,
            current_luminance: 0.0,
            outputs: SurfacePool::new(config.max_idle_surfaces),
            scratch: SurfacePool::new(config.max_idle_surfaces),
            output: None,
        }
    }

    #[inline]
    pub fn config(&self) -> &PostprocessConfig {
        &self.config
    }

    /// Adapted luminance after the most recent [`Postprocess::execute`].
    #[inline]
    pub fn current_luminance(&self) -> f32 {
        self.current_luminance
    }

    /// The surface returned by the last `execute`, if any.
    #[inline]
    pub fn output(&self) -> Option<&B::Surface> {
        self.output.as_ref()
    }

    /// `(output pool, scratch pool)` statistics.
    pub fn pool_stats(&self) -> (PoolStats, PoolStats) {
        (self.outputs.stats(), self.scratch.stats())
    }

    /// Runs the chain on an HDR image and returns the display image.
    ///
    /// Allocation failures for the pooled surfaces are returned as is; there is
    /// no reduced-quality fallback.
    pub fn execute(&mut self, backend: &B, image: &B::Surface, time: &Time) -> Result<B::Surface> {
        let _span = tracing::debug_span!("postprocess", frame = time.frame()).entered();
        let extent = image.desc();

        if let Some(previous) = self.output.take() {
            self.outputs.push(previous);
        }
        let output = self.outputs.pop(backend, SurfaceDesc::new(extent.width, extent.height, OUTPUT_FORMAT))?;
        let bloom = self.scratch.pop(backend, SurfaceDesc::new(extent.width, extent.height, BLOOM_FORMAT))?;

        let luminance = self.update_luminance(backend, image, time)?;

        let c = &self.config;
        let bloom_params = BloomParams {
            average_luminance: luminance,
            key_value: c.key_value,
            exposure: c.bloom_exposure,
            threshold: c.bloom_threshold,
            strength: c.bloom_strength,
            sigma: c.bloom_blur_sigma,
        };
        backend.submit(&Draw::new(Pass::Bloom(bloom_params), &[image], &[&bloom]))?;

        let tonemap_params = TonemapParams {
            average_luminance: luminance,
            key_value: c.key_value,
            vignette: c.vignette,
        };
        backend.submit(&Draw::new(Pass::Tonemap(tonemap_params), &[image, &bloom], &[&output]))?;

        self.scratch.push(bloom);
        self.output = Some(output.clone());
        Ok(output)
    }

    fn update_luminance(&mut self, backend: &B, image: &B::Surface, time: &Time) -> Result<f32> {
        let measured = backend.measure_luminance(image, &self.config.luminance_settings())?;
        self.current_luminance = adapt_luminance(self.current_luminance, measured, time.delta_seconds(), &self.config);
        log::trace!("luminance measured {:.4}, adapted {:.4}", measured, self.current_luminance);
        Ok(self.current_luminance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessBackend;
    use crate::gpu::HDR_FORMAT;

    #[test]
    fn test_adaptation_converges_monotonically() {
        let config = PostprocessConfig::default();
        let mut luminance = 0.0;
        let mut last_step = f32::MAX;
        for _ in 0..200 {
            let next = adapt_luminance(luminance, 0.6, 1.0 / 60.0, &config);
            let step = next - luminance;
            assert!(step > 0.0 || (0.6 - next).abs() < 1e-6);
            assert!(step <= last_step);
            assert!(next <= 0.6 + 1e-6);
            last_step = step;
            luminance = next;
        }
        for _ in 0..2000 {
            luminance = adapt_luminance(luminance, 0.6, 1.0 / 60.0, &config);
        }
        assert!((luminance - 0.6).abs() < 1e-4);
    }

    #[test]
    fn test_adaptation_is_frame_rate_independent() {
        let config = PostprocessConfig::default();
        let simulate = |steps: usize, dt: f32| (0..steps).fold(0.0, |l, _| adapt_luminance(l, 0.8, dt, &config));
        let fast = simulate(240, 1.0 / 120.0);
        let slow = simulate(60, 1.0 / 30.0);
        assert!((fast - slow).abs() < 1e-4, "{fast} vs {slow}");
        // Two seconds at rate 0.75.
        let expected = 0.8 * (1.0 - (-2.0f32 * 0.75).exp());
        assert!((fast - expected).abs() < 1e-4);
    }

    #[test]
    fn test_adaptation_clamps_target() {
        let config = PostprocessConfig::default();
        assert!(adapt_luminance(0.0, 50.0, 1000.0, &config) <= 1.0);
        assert!((adapt_luminance(0.0, 0.001, 1000.0, &config) - 0.2).abs() < 1e-6);
        assert_eq!(adapt_luminance(0.5, 0.9, 0.0, &config), 0.5);
    }

    fn hdr_image(backend: &HeadlessBackend, value: f32) -> <HeadlessBackend as GpuBackend>::Surface {
        let image = backend.allocate_surface(&SurfaceDesc::new(16, 16, HDR_FORMAT)).unwrap();
        backend.clear(&image, [value, value, value, 1.0]).unwrap();
        image
    }

    #[test]
    fn test_execute_tracks_luminance_and_recycles() {
        let backend = HeadlessBackend::new();
        let image = hdr_image(&backend, 0.6);
        let mut chain = Postprocess::<HeadlessBackend>::new(PostprocessConfig::default());
        assert_eq!(chain.current_luminance(), 0.0);

        let mut previous = chain.current_luminance();
        let mut ids = Vec::new();
        for frame in 1..=30 {
            let out = chain.execute(&backend, &image, &Time::new(1.0 / 30.0, frame as f64 / 30.0, frame)).unwrap();
            assert_eq!(out.desc().format, OUTPUT_FORMAT);
            assert!(chain.current_luminance() > previous);
            previous = chain.current_luminance();
            ids.push(out.id());
        }
        // One second toward the metered value (about 0.6).
        assert!(previous > 0.25 && previous < 0.65);

        // The previous output is recycled into the next frame.
        ids.dedup();
        assert_eq!(ids.len(), 1);
        let (outputs, scratch) = chain.pool_stats();
        assert_eq!((outputs.misses, outputs.hits), (1, 29));
        assert_eq!(scratch.misses, 1);
        let stats = backend.stats();
        assert_eq!((stats.bloom_draws, stats.tonemap_draws), (30, 30));
    }

    #[test]
    fn test_output_is_display_range() {
        let backend = HeadlessBackend::new();
        let image = hdr_image(&backend, 40.0);
        let mut chain = Postprocess::<HeadlessBackend>::new(PostprocessConfig::default());
        let out = chain.execute(&backend, &image, &Time::new(0.1, 0.1, 1)).unwrap();
        assert!(out.texels().iter().all(|t| t[0] >= 0.0 && t[0] <= 1.0));
    }

    #[test]
    fn test_allocation_failure_is_fatal() {
        // Room for the HDR image only.
        let backend = HeadlessBackend::with_memory_budget(16 * 16 * 16);
        let image = hdr_image(&backend, 1.0);
        let mut chain = Postprocess::<HeadlessBackend>::new(PostprocessConfig::default());
        let err = chain.execute(&backend, &image, &Time::new(0.016, 0.016, 1)).unwrap_err();
        assert!(err.is_allocation());
        assert_eq!(chain.current_luminance(), 0.0);
    }
}
