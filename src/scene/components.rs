// src/scene/components.rs
//! Built-in components.

use std::sync::Arc;

use glam::{Mat4, Quat, Vec3};

use crate::gpu::PointLight;
use crate::resources::{Material, Mesh};
use crate::spatial::{Aabb, BoundableId, Frustum};
use crate::time::Time;

use super::component::{Component, ComponentContext};

// ---------- Transform ----------

/// Local translation/rotation/scale. The scene writes the world matrix
/// before components update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransformComponent {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub(crate) world: Mat4,
}

impl Default for TransformComponent {
    fn default() -> Self {
        Self::identity()
    }
}

impl TransformComponent {
    pub fn identity() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            world: Mat4::IDENTITY,
        }
    }

    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Self::identity()
        }
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    /// Places the transform at `eye`, facing `target` (-Z forward).
    pub fn looking_at(eye: Vec3, target: Vec3, up: Vec3) -> Self {
        let view = Mat4::look_at_rh(eye, target, up);
        let (_, rotation, _) = view.inverse().to_scale_rotation_translation();
        Self {
            translation: eye,
            rotation,
            ..Self::identity()
        }
    }

    #[inline]
    pub fn local_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    /// World matrix as of the last scene update.
    #[inline]
    pub fn world_matrix(&self) -> Mat4 {
        self.world
    }
}

impl Component for TransformComponent {}

// ---------- Volume ----------

/// Object-space box registered (in world space) in the scene's octree.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumeComponent {
    pub local: Aabb,
    pub(crate) world: Aabb,
    pub(crate) boundable: Option<BoundableId>,
}

impl VolumeComponent {
    pub fn new(local: Aabb) -> Self {
        Self {
            local,
            world: local,
            boundable: None,
        }
    }

    /// World box as of the last scene update.
    #[inline]
    pub fn world_bounds(&self) -> Aabb {
        self.world
    }

    #[inline]
    pub fn boundable(&self) -> Option<BoundableId> {
        self.boundable
    }
}

impl Component for VolumeComponent {}

// ---------- Mesh renderer ----------

/// A mesh and one material per subset. Subsets past the end of `materials`
/// reuse the last one.
#[derive(Clone, Debug)]
pub struct MeshRendererComponent {
    pub mesh: Arc<Mesh>,
    pub materials: Vec<Arc<Material>>,
}

impl MeshRendererComponent {
    pub fn new(mesh: Arc<Mesh>, materials: Vec<Arc<Material>>) -> Self {
        Self { mesh, materials }
    }

    pub fn material_for(&self, subset: usize) -> Option<&Arc<Material>> {
        self.materials.get(subset).or_else(|| self.materials.last())
    }

    /// Object-space bounds of the mesh.
    pub fn bounds(&self) -> Aabb {
        self.mesh.bounds()
    }
}

impl Component for MeshRendererComponent {}

// ---------- Light ----------

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LightComponent {
    pub color: Vec3,
    pub intensity: f32,
    pub range: f32,
    position: Vec3,
}

impl LightComponent {
    pub fn new(color: Vec3, intensity: f32, range: f32) -> Self {
        Self {
            color,
            intensity,
            range,
            position: Vec3::ZERO,
        }
    }

    /// World position as of the last update.
    #[inline]
    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn point_light(&self) -> PointLight {
        PointLight {
            position: self.position,
            color: self.color,
            intensity: self.intensity,
            range: self.range,
        }
    }
}

impl Component for LightComponent {
    fn update(&mut self, ctx: &ComponentContext<'_>, _time: &Time) {
        let world = match ctx.sibling::<TransformComponent>() {
            Some(transform) => transform.world_matrix(),
            None => ctx.world,
        };
        self.position = world.w_axis.truncate();
    }
}

// ---------- Camera ----------

/// Size of the image a camera renders into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTarget {
    pub width: u32,
    pub height: u32,
}

impl RenderTarget {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[inline]
    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraComponent {
    target: RenderTarget,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
    view: Mat4,
}

impl CameraComponent {
    /// # Panics
    /// If the render target has a zero dimension.
    pub fn new(target: RenderTarget, fov_y: f32, near: f32, far: f32) -> Self {
        assert!(
            target.width > 0 && target.height > 0,
            "camera render target must be non-empty, got {}x{}",
            target.width,
            target.height
        );
        Self {
            target,
            fov_y,
            near,
            far,
            view: Mat4::IDENTITY,
        }
    }

    #[inline]
    pub fn target(&self) -> RenderTarget {
        self.target
    }

    /// # Panics
    /// If the render target has a zero dimension.
    pub fn set_target(&mut self, target: RenderTarget) {
        *self = Self::new(target, self.fov_y, self.near, self.far);
    }

    /// Right-handed perspective with 0..1 depth.
    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.target.aspect(), self.near, self.far)
    }

    /// View matrix as of the last update.
    #[inline]
    pub fn view(&self) -> Mat4 {
        self.view
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection() * self.view
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_proj(&self.view_projection())
    }
}

impl Component for CameraComponent {
    fn update(&mut self, ctx: &ComponentContext<'_>, _time: &Time) {
        let world = match ctx.sibling::<TransformComponent>() {
            Some(transform) => transform.world_matrix(),
            None => ctx.world,
        };
        self.view = world.inverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "render target")]
    fn test_zero_sized_camera_target_panics() {
        let _ = CameraComponent::new(RenderTarget::new(0, 480), 1.0, 0.1, 100.0);
    }

    #[test]
    fn test_looking_at_faces_target() {
        let transform = TransformComponent::looking_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        let forward = transform.local_matrix().transform_vector3(Vec3::NEG_Z);
        assert!((forward - Vec3::NEG_Z).length() < 1e-5);

        let transform = TransformComponent::looking_at(Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO, Vec3::Y);
        let forward = transform.local_matrix().transform_vector3(Vec3::NEG_Z);
        assert!((forward - Vec3::NEG_X).length() < 1e-5);
    }

    #[test]
    fn test_camera_frustum_follows_view() {
        let mut camera = CameraComponent::new(RenderTarget::new(64, 64), std::f32::consts::FRAC_PI_2, 0.1, 50.0);
        camera.view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        let frustum = camera.frustum();
        assert!(frustum.contains_point(Vec3::ZERO));
        assert!(!frustum.contains_point(Vec3::new(0.0, 0.0, 20.0)));
    }

    #[test]
    fn test_material_for_falls_back_to_last() {
        let manager = crate::resources::ResourceManager::with_defaults(std::env::temp_dir());
        let mesh = manager.load(&crate::resources::MeshFromVertices::cube(1.0)).unwrap().unwrap();
        let material = manager
            .load(&crate::resources::MaterialFromProperties::default())
            .unwrap()
            .unwrap();
        let renderer = MeshRendererComponent::new(mesh, vec![material.clone()]);
        assert!(Arc::ptr_eq(renderer.material_for(3).unwrap(), &material));
        assert_eq!(renderer.bounds(), Aabb::new(Vec3::ZERO, Vec3::ONE));
    }
}
