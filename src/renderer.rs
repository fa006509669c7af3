// src/renderer.rs
//! Deferred renderer.
//!
//! Per frame: cull the scene against the camera frustum, rasterize every visible
//! mesh subset into the G-buffer, then resolve all enabled lights in a single
//! full-screen lighting pass into an HDR image. G-buffer surfaces are pooled and
//! handed back at the end of the frame; the HDR image stays alive until the next
//! `render` so the postprocess chain can read it.

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gpu::{
    Draw, GeometryParams, GpuBackend, LightingParams, Pass, PointLight, PoolStats, SurfaceDesc, SurfaceFormat, SurfacePool,
    ALBEDO_FORMAT, DEPTH_FORMAT, EMISSIVE_FORMAT, HDR_FORMAT, NORMAL_FORMAT, POSITION_FORMAT,
};
use crate::scene::{CameraComponent, LightComponent, MeshRendererComponent, NodeId, Scene};

const GBUFFER_FORMATS: [SurfaceFormat; 5] = [ALBEDO_FORMAT, NORMAL_FORMAT, POSITION_FORMAT, EMISSIVE_FORMAT, DEPTH_FORMAT];

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Added to every lit texel, multiplied by albedo.
    pub ambient: [f32; 3],
    /// HDR value of texels no geometry covered.
    pub clear_color: [f32; 3],
    pub max_idle_surfaces: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            ambient: [0.03, 0.03, 0.03],
            clear_color: [0.02, 0.02, 0.025],
            max_idle_surfaces: 8,
        }
    }
}

/// Counters for the most recent frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub visible_nodes: usize,
    pub draw_calls: usize,
    pub lights: usize,
}

pub struct DeferredRenderer<B: GpuBackend> {
    config: RendererConfig,
    gbuffer: SurfacePool<B::Surface>,
    hdr: SurfacePool<B::Surface>,
    output: Option<B::Surface>,
    stats: RenderStats,
}

impl<B: GpuBackend> DeferredRenderer<B> {
    pub fn new(config: RendererConfig) -> Self {
        Self {
            config,
            gbuffer: SurfacePool::new(config.max_idle_surfaces),
            hdr: SurfacePool::new(config.max_idle_surfaces.min(2)),
            output: None,
            stats: RenderStats::default(),
        }
    }

    #[inline]
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    /// `(G-buffer pool, HDR pool)` statistics.
    pub fn pool_stats(&self) -> (PoolStats, PoolStats) {
        (self.gbuffer.stats(), self.hdr.stats())
    }

    /// Renders the scene as seen from `camera` and returns the HDR image.
    ///
    /// Uses world matrices and volumes from the last [`Scene::update`].
    pub fn render(&mut self, backend: &B, scene: &Scene, camera: NodeId) -> Result<B::Surface> {
        let _span = tracing::debug_span!("render", camera = %camera).entered();

        let view = match scene.component::<CameraComponent>(camera) {
            Some(view) if scene.component_enabled::<CameraComponent>(camera) => view,
            _ => {
                return Err(Error::MissingComponent {
                    node: camera.to_string(),
                    component: "CameraComponent",
                })
            }
        };
        let target = view.target();
        let view_proj = view.view_projection();
        let visible = scene.visible_nodes(&view.frustum());

        let gbuffer = self.pop_gbuffer(backend, target.width, target.height)?;
        if let Some(previous) = self.output.take() {
            self.hdr.push(previous);
        }
        let hdr = match self.hdr.pop(backend, SurfaceDesc::new(target.width, target.height, HDR_FORMAT)) {
            Ok(hdr) => hdr,
            Err(err) => {
                self.push_gbuffer(gbuffer);
                return Err(err);
            }
        };

        let result = self.draw_frame(backend, scene, &visible, view_proj, &gbuffer, &hdr);
        self.push_gbuffer(gbuffer);
        let stats = match result {
            Ok(stats) => stats,
            Err(err) => {
                self.hdr.push(hdr);
                return Err(err);
            }
        };

        self.output = Some(hdr.clone());
        self.stats = stats;
        log::trace!(
            "rendered {} visible nodes with {} draws and {} lights",
            stats.visible_nodes,
            stats.draw_calls,
            stats.lights
        );
        Ok(hdr)
    }

    /// Albedo, normal, position, emissive and depth targets. Surfaces popped
    /// before a failed allocation go straight back to the pool.
    fn pop_gbuffer(&mut self, backend: &B, width: u32, height: u32) -> Result<[B::Surface; 5]> {
        let mut popped = Vec::with_capacity(GBUFFER_FORMATS.len());
        for format in GBUFFER_FORMATS {
            match self.gbuffer.pop(backend, SurfaceDesc::new(width, height, format)) {
                Ok(surface) => popped.push(surface),
                Err(err) => {
                    popped.into_iter().for_each(|surface| self.gbuffer.push(surface));
                    return Err(err);
                }
            }
        }
        popped
            .try_into()
            .map_err(|_| Error::custom("G-buffer surface count mismatch"))
    }

    fn push_gbuffer(&mut self, gbuffer: [B::Surface; 5]) {
        for surface in gbuffer {
            self.gbuffer.push(surface);
        }
    }

    fn draw_frame(
        &self,
        backend: &B,
        scene: &Scene,
        visible: &[NodeId],
        view_proj: Mat4,
        gbuffer: &[B::Surface; 5],
        hdr: &B::Surface,
    ) -> Result<RenderStats> {
        let [albedo, normal, position, emissive, depth] = gbuffer;
        let [r, g, b] = self.config.clear_color;
        backend.clear(albedo, [0.0; 4])?;
        backend.clear(normal, [0.0; 4])?;
        backend.clear(position, [0.0; 4])?;
        backend.clear(emissive, [r, g, b, 0.0])?;
        backend.clear(depth, [1.0; 4])?;

        let mut stats = RenderStats {
            visible_nodes: visible.len(),
            ..RenderStats::default()
        };

        let targets = [albedo, normal, position, emissive, depth];
        for &id in visible {
            if !scene.component_enabled::<MeshRendererComponent>(id) {
                continue;
            }
            let (Some(renderer), Some(node)) = (scene.component::<MeshRendererComponent>(id), scene.node(id)) else {
                continue;
            };
            for subset in 0..renderer.mesh.subsets().len() {
                let Some(material) = renderer.material_for(subset) else {
                    log::debug!("node {} has no material for subset {}", id, subset);
                    continue;
                };
                let params = GeometryParams {
                    mesh: &renderer.mesh,
                    subset,
                    material,
                    world: node.world(),
                    view_proj,
                };
                backend.submit(&Draw::new(Pass::Geometry(params), &[], &targets))?;
                stats.draw_calls += 1;
            }
        }

        let lights: Vec<PointLight> = scene
            .nodes_with::<LightComponent>()
            .into_iter()
            .filter_map(|id| scene.component::<LightComponent>(id))
            .map(LightComponent::point_light)
            .collect();
        stats.lights = lights.len();

        let lighting = LightingParams {
            lights: &lights,
            ambient: Vec3::from(self.config.ambient),
        };
        backend.submit(&Draw::new(
            Pass::Lighting(lighting),
            &[albedo, normal, position, emissive],
            &[hdr],
        ))?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessBackend;
    use crate::gpu::GpuSurface;
    use crate::resources::{MaterialFromProperties, MaterialProperties, MeshFromVertices, PropertyValue, ResourceManager};
    use crate::scene::{RenderTarget, TransformComponent, VolumeComponent};
    use crate::time::Time;
    use std::sync::Arc;

    fn scene_with_cube(manager: &ResourceManager) -> (Scene, NodeId, NodeId) {
        let mut scene = Scene::default();
        let mesh = manager.load(&MeshFromVertices::cube(1.0)).unwrap().unwrap();
        let mut properties = MaterialProperties::new();
        properties.set("base_color", PropertyValue::Vector(vec![1.0, 0.5, 0.25]));
        let material = manager
            .load(&MaterialFromProperties::new("orange", properties, manager.base_dir()))
            .unwrap()
            .unwrap();

        let cube = scene.create_node("cube", scene.root()).unwrap();
        scene.add_component(cube, TransformComponent::identity()).unwrap();
        scene.add_component(cube, VolumeComponent::new(mesh.bounds())).unwrap();
        scene
            .add_component(cube, MeshRendererComponent::new(Arc::clone(&mesh), vec![material]))
            .unwrap();

        let light = scene.create_node("light", scene.root()).unwrap();
        scene
            .add_component(light, TransformComponent::from_translation(Vec3::new(0.0, 0.0, 4.0)))
            .unwrap();
        scene.add_component(light, LightComponent::new(Vec3::ONE, 20.0, 20.0)).unwrap();

        let camera = scene.create_node("camera", scene.root()).unwrap();
        scene
            .add_component(camera, TransformComponent::looking_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y))
            .unwrap();
        scene
            .add_component(
                camera,
                CameraComponent::new(RenderTarget::new(32, 32), std::f32::consts::FRAC_PI_3, 0.1, 100.0),
            )
            .unwrap();
        scene.update(&Time::new(0.016, 0.016, 1));
        (scene, cube, camera)
    }

    #[test]
    fn test_renders_visible_geometry() {
        let manager = ResourceManager::with_defaults(std::env::temp_dir());
        let (scene, _, camera) = scene_with_cube(&manager);
        let backend = HeadlessBackend::new();
        let mut renderer = DeferredRenderer::<HeadlessBackend>::new(RendererConfig::default());

        let hdr = renderer.render(&backend, &scene, camera).unwrap();
        assert_eq!(hdr.desc(), SurfaceDesc::new(32, 32, HDR_FORMAT));
        assert_eq!(
            renderer.stats(),
            RenderStats {
                visible_nodes: 1,
                draw_calls: 1,
                lights: 1,
            }
        );

        // The cube faces the camera and the light: the centre is lit orange.
        let centre = hdr.texel(16, 16).unwrap();
        assert!(centre[0] > centre[1] && centre[1] > centre[2], "{centre:?}");
        // Corners see the background.
        let corner = hdr.texel(0, 0).unwrap();
        let clear = RendererConfig::default().clear_color;
        assert!((corner[0] - clear[0]).abs() < 1e-6);
    }

    #[test]
    fn test_culled_nodes_are_not_drawn() {
        let manager = ResourceManager::with_defaults(std::env::temp_dir());
        let (mut scene, cube, camera) = scene_with_cube(&manager);
        scene.component_mut::<TransformComponent>(cube).unwrap().translation = Vec3::new(0.0, 0.0, 50.0);
        scene.update(&Time::new(0.016, 0.032, 2));

        let backend = HeadlessBackend::new();
        let mut renderer = DeferredRenderer::<HeadlessBackend>::new(RendererConfig::default());
        renderer.render(&backend, &scene, camera).unwrap();
        assert_eq!(renderer.stats().visible_nodes, 0);
        assert_eq!(backend.stats().geometry_draws, 0);
        assert_eq!(backend.stats().lighting_draws, 1);
    }

    #[test]
    fn test_gbuffer_is_recycled() {
        let manager = ResourceManager::with_defaults(std::env::temp_dir());
        let (scene, _, camera) = scene_with_cube(&manager);
        let backend = HeadlessBackend::new();
        let mut renderer = DeferredRenderer::<HeadlessBackend>::new(RendererConfig::default());
        for _ in 0..5 {
            renderer.render(&backend, &scene, camera).unwrap();
        }
        let (gbuffer, hdr) = renderer.pool_stats();
        assert_eq!((gbuffer.misses, gbuffer.hits), (5, 20));
        assert_eq!((hdr.misses, hdr.hits), (1, 4));
        assert_eq!(backend.stats().surfaces_allocated, 6);
    }

    #[test]
    fn test_missing_camera_is_an_error() {
        let manager = ResourceManager::with_defaults(std::env::temp_dir());
        let (mut scene, cube, camera) = scene_with_cube(&manager);
        let backend = HeadlessBackend::new();
        let mut renderer = DeferredRenderer::<HeadlessBackend>::new(RendererConfig::default());
        assert!(matches!(
            renderer.render(&backend, &scene, cube),
            Err(Error::MissingComponent { .. })
        ));
        scene.set_component_enabled::<CameraComponent>(camera, false).unwrap();
        assert!(renderer.render(&backend, &scene, camera).is_err());
    }

    /// Headless backend whose lighting submissions fail.
    struct LightingFails(HeadlessBackend);

    impl GpuBackend for LightingFails {
        type Surface = <HeadlessBackend as GpuBackend>::Surface;

        fn allocate_surface(&self, desc: &SurfaceDesc) -> Result<Self::Surface> {
            self.0.allocate_surface(desc)
        }

        fn clear(&self, target: &Self::Surface, value: [f32; 4]) -> Result<()> {
            self.0.clear(target, value)
        }

        fn submit(&self, draw: &Draw<'_, Self::Surface>) -> Result<()> {
            match draw.pass {
                Pass::Lighting(_) => Err(Error::gpu("device lost")),
                _ => self.0.submit(draw),
            }
        }

        fn measure_luminance(&self, image: &Self::Surface, settings: &crate::gpu::LuminanceSettings) -> Result<f32> {
            self.0.measure_luminance(image, settings)
        }

        fn present(&self, surface: &Self::Surface) -> Result<()> {
            self.0.present(surface)
        }
    }

    #[test]
    fn test_failed_frame_returns_surfaces_to_pools() {
        let manager = ResourceManager::with_defaults(std::env::temp_dir());
        let (scene, _, camera) = scene_with_cube(&manager);
        let backend = LightingFails(HeadlessBackend::new());
        let mut renderer = DeferredRenderer::<LightingFails>::new(RendererConfig::default());

        for _ in 0..3 {
            assert!(matches!(renderer.render(&backend, &scene, camera), Err(Error::Gpu(_))));
        }
        let (gbuffer, hdr) = renderer.pool_stats();
        assert_eq!(gbuffer.idle, 5);
        assert_eq!(hdr.idle, 1);
        assert_eq!((gbuffer.misses, gbuffer.hits), (5, 10));
        assert_eq!((hdr.misses, hdr.hits), (1, 2));
        assert_eq!(backend.0.stats().surfaces_allocated, 6);
    }

    #[test]
    fn test_failed_allocation_keeps_popped_surfaces() {
        let manager = ResourceManager::with_defaults(std::env::temp_dir());
        let (scene, _, camera) = scene_with_cube(&manager);
        // Room for the albedo and normal targets only.
        let backend = HeadlessBackend::with_memory_budget(2 * SurfaceDesc::new(32, 32, ALBEDO_FORMAT).size_bytes());
        let mut renderer = DeferredRenderer::<HeadlessBackend>::new(RendererConfig::default());

        let err = renderer.render(&backend, &scene, camera).unwrap_err();
        assert!(err.is_allocation());
        assert_eq!(renderer.pool_stats().0.idle, 2);
    }
}
