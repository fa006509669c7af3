// src/engine.rs
//! Frame orchestration.
//!
//! [`Engine`] owns every subsystem explicitly: the GPU backend, the resource
//! manager, the scene, the deferred renderer, the postprocess chain and the
//! frame clock. One [`Engine::frame`] is update, render, postprocess, present.

use std::sync::Arc;

use glam::{Vec3, Vec4};

use crate::config::EngineConfig;
use crate::context::OptionContext;
use crate::error::{Error, Result};
use crate::gpu::GpuBackend;
use crate::importer::{import_gltf, spawn_model};
use crate::postprocess::Postprocess;
use crate::renderer::{DeferredRenderer, RenderStats};
use crate::resources::{
    MaterialFromProperties, MaterialInstance, MaterialProperties, MeshFromVertices, PropertyValue, ResourceManager,
};
use crate::scene::{
    CameraComponent, LightComponent, MeshRendererComponent, NodeId, RenderTarget, Scene, TransformComponent,
    VolumeComponent,
};
use crate::spatial::Aabb;
use crate::time::{Time, TimeManager};

const FOV_Y: f32 = std::f32::consts::FRAC_PI_3;
const NEAR: f32 = 0.1;
const FAR: f32 = 500.0;

pub struct Engine<B: GpuBackend> {
    backend: B,
    resources: Arc<ResourceManager>,
    scene: Scene,
    renderer: DeferredRenderer<B>,
    postprocess: Postprocess<B>,
    time: TimeManager,
    camera: NodeId,
}

impl<B: GpuBackend> Engine<B> {
    /// Builds the engine and its startup scene: the configured glTF file, or
    /// the procedural demo scene when none is set.
    pub fn new(config: &EngineConfig, backend: B) -> Result<Self> {
        config.validate()?;
        let resources = Arc::new(ResourceManager::with_defaults(&config.resources.base_dir));
        let mut scene = Scene::new(config.spatial.overlap_constant, config.spatial.rebuild_policy);
        let target = RenderTarget::new(config.window.width, config.window.height);

        let camera = match &config.scene.gltf {
            Some(path) => {
                let model = import_gltf(&resources, path)?;
                let root = scene.root();
                let node = spawn_model(&mut scene, root, &model)?;
                frame_model(&mut scene, node, model.mesh.bounds(), target)?
            }
            None => demo_scene(&mut scene, &resources, target)?,
        };

        log::info!(
            "engine ready: {} nodes, {}x{} target",
            scene.node_count(),
            target.width,
            target.height
        );
        Ok(Self {
            backend,
            resources,
            scene,
            renderer: DeferredRenderer::new(config.renderer_config()),
            postprocess: Postprocess::new(config.postprocess_config()),
            time: TimeManager::new(),
            camera,
        })
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[inline]
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    #[inline]
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    #[inline]
    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    #[inline]
    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    #[inline]
    pub fn camera(&self) -> NodeId {
        self.camera
    }

    /// Switches the active camera. The node must carry a camera component.
    pub fn set_camera(&mut self, node: NodeId) -> Result<()> {
        if self.scene.component::<CameraComponent>(node).is_none() {
            return Err(Error::MissingComponent {
                node: node.to_string(),
                component: "CameraComponent",
            });
        }
        self.camera = node;
        Ok(())
    }

    #[inline]
    pub fn postprocess(&self) -> &Postprocess<B> {
        &self.postprocess
    }

    #[inline]
    pub fn render_stats(&self) -> RenderStats {
        self.renderer.stats()
    }

    /// Resizes the active camera's render target. Zero sizes (minimized
    /// windows) are ignored.
    pub fn set_render_size(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        if let Some(camera) = self.scene.component_mut::<CameraComponent>(self.camera) {
            camera.set_target(RenderTarget::new(width, height));
        }
    }

    /// Runs one frame on the wall clock.
    pub fn frame(&mut self) -> Result<B::Surface> {
        let time = self.time.update();
        self.frame_with(&time)
    }

    /// Runs one frame with an explicit time step.
    pub fn frame_with(&mut self, time: &Time) -> Result<B::Surface> {
        let _span = tracing::debug_span!("frame", frame = time.frame()).entered();
        self.scene.update(time);
        let hdr = self.renderer.render(&self.backend, &self.scene, self.camera)?;
        let output = self.postprocess.execute(&self.backend, &hdr, time)?;
        self.backend.present(&output)?;

        if time.frame() % 600 == 0 {
            let stats = self.renderer.stats();
            log::debug!(
                "frame {}: {} visible, {} draws, {} lights, luminance {:.3}, {} KiB resident",
                time.frame(),
                stats.visible_nodes,
                stats.draw_calls,
                stats.lights,
                self.postprocess.current_luminance(),
                self.resources.total_footprint() / 1024
            );
        }
        Ok(output)
    }
}

/// Adds a camera and a key light placed to see `bounds`. Returns the camera.
fn frame_model(scene: &mut Scene, model: NodeId, bounds: Aabb, target: RenderTarget) -> Result<NodeId> {
    let radius = bounds.half_extents.length().max(1.0);
    let eye = bounds.center + Vec3::new(0.0, radius * 0.5, radius * 2.5);
    let parent = scene.node(model).and_then(|n| n.parent()).context("model node has no parent")?;

    let light = scene.create_node("key_light", parent)?;
    scene.add_component(light, TransformComponent::from_translation(eye + Vec3::Y * radius))?;
    scene.add_component(light, LightComponent::new(Vec3::ONE, 4.0 * radius * radius, radius * 8.0))?;

    let camera = scene.create_node("camera", parent)?;
    scene.add_component(camera, TransformComponent::looking_at(eye, bounds.center, Vec3::Y))?;
    scene.add_component(camera, CameraComponent::new(target, FOV_Y, NEAR, FAR.max(radius * 10.0)))?;
    Ok(camera)
}

/// Procedural scene: a 5x5 grid of cubes on a floor, two coloured point
/// lights, one glowing cube and a camera looking down at the grid. Returns
/// the camera node.
pub fn demo_scene(scene: &mut Scene, resources: &ResourceManager, target: RenderTarget) -> Result<NodeId> {
    let cube = resources.load(&MeshFromVertices::cube(0.5))?.context("no mesh loader registered")?;
    let mut properties = MaterialProperties::new();
    properties.set("base_color", PropertyValue::Vector(vec![0.8, 0.8, 0.8]));
    let base = resources
        .load(&MaterialFromProperties::new("demo_grey", properties, resources.base_dir()))?
        .context("no material loader registered")?;

    let root = scene.root();
    let grid = scene.create_node("grid", root)?;
    scene.add_component(grid, TransformComponent::identity())?;

    let floor = scene.create_node("floor", grid)?;
    scene.add_component(
        floor,
        TransformComponent::from_translation(Vec3::new(0.0, -0.6, 0.0)).with_scale(Vec3::new(12.0, 0.1, 12.0)),
    )?;
    scene.add_component(floor, VolumeComponent::new(cube.bounds()))?;
    scene.add_component(floor, MeshRendererComponent::new(Arc::clone(&cube), vec![Arc::clone(&base)]))?;

    for z in 0..5 {
        for x in 0..5 {
            let tint = Vec4::new(0.3 + 0.15 * x as f32, 0.4, 0.3 + 0.15 * z as f32, 1.0);
            let material = resources
                .load(&MaterialInstance::new(Arc::clone(&base)).with_base_color(tint))?
                .context("no material loader registered")?;
            let node = scene.create_node(format!("cube_{x}_{z}"), grid)?;
            let position = Vec3::new((x as f32 - 2.0) * 2.0, 0.0, (z as f32 - 2.0) * 2.0);
            scene.add_component(node, TransformComponent::from_translation(position))?;
            scene.add_component(node, VolumeComponent::new(cube.bounds()))?;
            scene.add_component(node, MeshRendererComponent::new(Arc::clone(&cube), vec![material]))?;
            scene.add_tag(node, "grid_cube")?;
        }
    }

    let mut glow = MaterialProperties::new();
    glow.set("base_color", PropertyValue::Vector(vec![1.0, 0.9, 0.6]))
        .set("emissive", PropertyValue::Vector(vec![6.0, 5.0, 3.0]));
    let glow = resources
        .load(&MaterialFromProperties::new("demo_glow", glow, resources.base_dir()))?
        .context("no material loader registered")?;
    let beacon = scene.create_node("beacon", root)?;
    scene.add_component(
        beacon,
        TransformComponent::from_translation(Vec3::new(0.0, 1.5, 0.0)).with_scale(Vec3::splat(0.5)),
    )?;
    scene.add_component(beacon, VolumeComponent::new(cube.bounds()))?;
    scene.add_component(beacon, MeshRendererComponent::new(Arc::clone(&cube), vec![glow]))?;

    for (name, position, color) in [
        ("warm_light", Vec3::new(-4.0, 4.0, 3.0), Vec3::new(1.0, 0.8, 0.6)),
        ("cool_light", Vec3::new(4.0, 3.0, -3.0), Vec3::new(0.5, 0.7, 1.0)),
    ] {
        let light = scene.create_node(name, root)?;
        scene.add_component(light, TransformComponent::from_translation(position))?;
        scene.add_component(light, LightComponent::new(color, 40.0, 20.0))?;
        scene.add_tag(light, "light")?;
    }

    let camera = scene.create_node("camera", root)?;
    scene.add_component(
        camera,
        TransformComponent::looking_at(Vec3::new(0.0, 8.0, 12.0), Vec3::ZERO, Vec3::Y),
    )?;
    scene.add_component(camera, CameraComponent::new(target, FOV_Y, NEAR, FAR))?;
    Ok(camera)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessBackend;
    use crate::gpu::{GpuSurface, SurfaceDesc, OUTPUT_FORMAT};

    fn small_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.window.width = 48;
        config.window.height = 32;
        config.resources.base_dir = std::env::temp_dir();
        config
    }

    #[test]
    fn test_demo_frames_render_and_present() {
        let mut engine = Engine::new(&small_config(), HeadlessBackend::new()).unwrap();
        assert_eq!(engine.scene().find_by_tag("grid_cube").len(), 25);

        let mut luminance = 0.0;
        for frame in 1..=10 {
            let time = Time::new(1.0 / 60.0, frame as f64 / 60.0, frame);
            let output = engine.frame_with(&time).unwrap();
            assert_eq!(output.desc(), SurfaceDesc::new(48, 32, OUTPUT_FORMAT));
            assert!(engine.postprocess().current_luminance() > luminance);
            luminance = engine.postprocess().current_luminance();
        }

        let stats = engine.render_stats();
        assert!(stats.visible_nodes > 10, "{stats:?}");
        assert_eq!(stats.lights, 2);
        assert_eq!(engine.backend().stats().presents, 10);
    }

    #[test]
    fn test_resize_changes_output_size() {
        let mut engine = Engine::new(&small_config(), HeadlessBackend::new()).unwrap();
        engine.frame_with(&Time::new(0.016, 0.016, 1)).unwrap();
        engine.set_render_size(0, 10);
        engine.set_render_size(16, 16);
        let output = engine.frame_with(&Time::new(0.016, 0.032, 2)).unwrap();
        assert_eq!((output.desc().width, output.desc().height), (16, 16));
    }

    #[test]
    fn test_set_camera_requires_component() {
        let mut engine = Engine::new(&small_config(), HeadlessBackend::new()).unwrap();
        let grid = engine.scene().find_by_name("grid").unwrap();
        assert!(engine.set_camera(grid).is_err());
        let camera = engine.camera();
        assert!(engine.set_camera(camera).is_ok());
    }

    #[test]
    fn test_missing_gltf_fails_startup() {
        let mut config = small_config();
        config.scene.gltf = Some("prism_missing_model.gltf".into());
        let err = Engine::new(&config, HeadlessBackend::new()).err().unwrap();
        assert!(err.is_io());
    }
}
