// src/lib.rs
//! Prism: a small real-time 3D engine core.
//!
//! Resources are shared through a weak-reference cache, the scene is culled
//! with an octree, frames are shaded by a deferred renderer and finished by an
//! eye-adapting bloom and tonemap chain. Everything GPU-facing goes through
//! [`gpu::GpuBackend`], with a wgpu implementation for windows and a CPU one
//! for tests and offline runs.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod fx;
pub mod gpu;
pub mod importer;
pub mod postprocess;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod spatial;
pub mod time;

use std::sync::Arc;

use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

pub use config::EngineConfig;
pub use engine::{demo_scene, Engine};
pub use error::{Error, Result};
pub use gpu::headless::{HeadlessBackend, HeadlessStats};
pub use gpu::wgpu_backend::WgpuBackend;
pub use gpu::GpuBackend;
pub use time::{Time, TimeManager};

/// Outcome of [`run_headless`].
#[derive(Clone, Debug)]
pub struct HeadlessReport {
    pub frames: u64,
    pub stats: HeadlessStats,
    pub luminance: f32,
}

/// Renders `frames` frames at a fixed 60 Hz step on the CPU backend.
pub fn run_headless(config: &EngineConfig, frames: u64) -> Result<HeadlessReport> {
    let mut engine = Engine::new(config, HeadlessBackend::new())?;
    let dt = 1.0 / 60.0;
    for frame in 1..=frames {
        engine.frame_with(&Time::new(dt, frame as f64 * dt as f64, frame))?;
    }
    let report = HeadlessReport {
        frames,
        stats: engine.backend().stats(),
        luminance: engine.postprocess().current_luminance(),
    };
    log::info!(
        "headless run: {} frames, {} geometry draws, adapted luminance {:.3}",
        report.frames,
        report.stats.geometry_draws,
        report.luminance
    );
    Ok(report)
}

/// Opens a window and runs the engine on wgpu until it is closed.
pub fn run_native(config: EngineConfig) -> Result<()> {
    let event_loop = EventLoop::new().map_err(Error::gpu)?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = PrismApp {
        config,
        window: None,
        engine: None,
        failure: None,
    };
    event_loop.run_app(&mut app).map_err(Error::gpu)?;

    match app.failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

// ----------------------------------------------------------------------------
// winit 0.30 + wgpu 22 app state
// ----------------------------------------------------------------------------
struct PrismApp {
    config: EngineConfig,
    // Created inside the `resumed` event
    window: Option<Arc<Window>>,
    engine: Option<Engine<WgpuBackend>>,
    failure: Option<Error>,
}

impl PrismApp {
    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attrs = Window::default_attributes()
            .with_title(self.config.window.title.clone())
            .with_inner_size(PhysicalSize::new(self.config.window.width, self.config.window.height));
        let window = Arc::new(event_loop.create_window(attrs).map_err(Error::gpu)?);

        let backend = pollster::block_on(WgpuBackend::new(Some(window.clone())))?;
        let mut engine = Engine::new(&self.config, backend)?;
        let size = window.inner_size();
        engine.set_render_size(size.width, size.height);

        window.request_redraw();
        self.window = Some(window);
        self.engine = Some(engine);
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: Error) {
        log::error!("stopping: {err}");
        self.failure = Some(err);
        event_loop.exit();
    }
}

impl ApplicationHandler for PrismApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(err) = self.start(event_loop) {
            self.fail(event_loop, err);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        let Some(window) = self.window.clone() else { return };
        if window.id() != window_id {
            return;
        }
        let Some(engine) = self.engine.as_mut() else { return };

        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if size.width > 0 && size.height > 0 {
                    engine.backend().resize(size.width, size.height);
                    engine.set_render_size(size.width, size.height);
                }
            }
            WindowEvent::ScaleFactorChanged { scale_factor, .. } => {
                log::debug!("scale factor changed: {}", scale_factor);
            }
            WindowEvent::RedrawRequested => {
                if let Err(err) = engine.frame() {
                    self.fail(event_loop, err);
                    return;
                }
                window.request_redraw();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_run_reports() {
        let mut config = EngineConfig::default();
        config.window.width = 32;
        config.window.height = 24;
        config.resources.base_dir = std::env::temp_dir();
        let report = run_headless(&config, 3).unwrap();
        assert_eq!(report.frames, 3);
        assert_eq!(report.stats.presents, 3);
        assert_eq!(report.stats.lighting_draws, 3);
        assert!(report.luminance > 0.0);
    }
}
