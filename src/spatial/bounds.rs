// src/spatial/bounds.rs
//! Bounding volumes and the six-plane view frustum used for culling.

use glam::{Mat4, Vec3, Vec4};

/// Axis-aligned box stored as center + half-extents.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Aabb {
    pub center: Vec3,
    pub half_extents: Vec3,
}

impl Aabb {
    /// Zero-sized box at the origin.
    pub const ZERO: Aabb = Aabb {
        center: Vec3::ZERO,
        half_extents: Vec3::ZERO,
    };

    #[inline]
    pub fn new(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            center,
            half_extents: half_extents.abs(),
        }
    }

    #[inline]
    pub fn from_min_max(min: Vec3, max: Vec3) -> Self {
        let lo = min.min(max);
        let hi = min.max(max);
        Self {
            center: (lo + hi) * 0.5,
            half_extents: (hi - lo) * 0.5,
        }
    }

    /// Tightest box around a point cloud, `None` when empty.
    pub fn from_points<I: IntoIterator<Item = Vec3>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(lo, hi), p| (lo.min(p), hi.max(p)));
        Some(Self::from_min_max(min, max))
    }

    #[inline]
    pub fn min(&self) -> Vec3 {
        self.center - self.half_extents
    }

    #[inline]
    pub fn max(&self) -> Vec3 {
        self.center + self.half_extents
    }

    #[inline]
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb::from_min_max(self.min().min(other.min()), self.max().max(other.max()))
    }

    /// `other` lies entirely inside `self`. Touching faces count as inside.
    #[inline]
    pub fn contains(&self, other: &Aabb) -> bool {
        self.min().cmple(other.min()).all() && other.max().cmple(self.max()).all()
    }

    #[inline]
    pub fn intersects(&self, other: &Aabb) -> bool {
        (self.center - other.center)
            .abs()
            .cmple(self.half_extents + other.half_extents)
            .all()
    }

    /// Box enclosing this one after an affine transform.
    pub fn transformed(&self, matrix: &Mat4) -> Aabb {
        let center = matrix.transform_point3(self.center);
        let abs_x = matrix.x_axis.truncate().abs();
        let abs_y = matrix.y_axis.truncate().abs();
        let abs_z = matrix.z_axis.truncate().abs();
        let half = abs_x * self.half_extents.x + abs_y * self.half_extents.y + abs_z * self.half_extents.z;
        Aabb::new(center, half)
    }
}

/// Plane in `normal . p + distance = 0` form; positive side is "inside".
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    #[inline]
    pub fn new(normal: Vec3, distance: f32) -> Self {
        Self { normal, distance }
    }

    fn from_vec4(v: Vec4) -> Self {
        let normal = v.truncate();
        let len = normal.length();
        if len <= f32::EPSILON {
            return Self::new(normal, v.w);
        }
        Self::new(normal / len, v.w / len)
    }

    #[inline]
    pub fn signed_distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }
}

/// Outcome of a volume/frustum test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intersection {
    Outside,
    Intersecting,
    Inside,
}

/// View volume bounded by six inward-facing planes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frustum {
    planes: [Plane; 6],
}

impl Frustum {
    /// Extracts the planes of a view-projection matrix with 0..1 clip depth
    /// (the wgpu / glam `perspective_rh` convention).
    pub fn from_view_proj(view_proj: &Mat4) -> Self {
        let r0 = view_proj.row(0);
        let r1 = view_proj.row(1);
        let r2 = view_proj.row(2);
        let r3 = view_proj.row(3);
        Self {
            planes: [
                Plane::from_vec4(r3 + r0), // left
                Plane::from_vec4(r3 - r0), // right
                Plane::from_vec4(r3 + r1), // bottom
                Plane::from_vec4(r3 - r1), // top
                Plane::from_vec4(r2),      // near
                Plane::from_vec4(r3 - r2), // far
            ],
        }
    }

    /// Frustum whose volume is exactly `bounds`.
    pub fn from_aabb(bounds: &Aabb) -> Self {
        let min = bounds.min();
        let max = bounds.max();
        Self {
            planes: [
                Plane::new(Vec3::X, -min.x),
                Plane::new(Vec3::NEG_X, max.x),
                Plane::new(Vec3::Y, -min.y),
                Plane::new(Vec3::NEG_Y, max.y),
                Plane::new(Vec3::Z, -min.z),
                Plane::new(Vec3::NEG_Z, max.z),
            ],
        }
    }

    #[inline]
    pub fn planes(&self) -> &[Plane; 6] {
        &self.planes
    }

    /// Box/plane separating-axis test against all six planes.
    pub fn classify(&self, bounds: &Aabb) -> Intersection {
        let mut result = Intersection::Inside;
        for plane in &self.planes {
            let radius = plane.normal.abs().dot(bounds.half_extents);
            let distance = plane.signed_distance(bounds.center);
            if distance + radius < 0.0 {
                return Intersection::Outside;
            }
            if distance - radius < 0.0 {
                result = Intersection::Intersecting;
            }
        }
        result
    }

    #[inline]
    pub fn intersects(&self, bounds: &Aabb) -> bool {
        self.classify(bounds) != Intersection::Outside
    }

    #[inline]
    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes.iter().all(|p| p.signed_distance(point) >= 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_and_contains() {
        let a = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let b = Aabb::new(Vec3::splat(10.0), Vec3::ONE);
        let u = a.union(&b);
        assert_eq!(u.min(), Vec3::splat(-1.0));
        assert_eq!(u.max(), Vec3::splat(11.0));
        assert!(u.contains(&a));
        assert!(u.contains(&b));
        assert!(u.contains(&u));
        assert!(!a.contains(&u));
    }

    #[test]
    fn test_transformed_box_encloses_rotation() {
        let unit = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let m = Mat4::from_rotation_z(std::f32::consts::FRAC_PI_4) * Mat4::from_scale(Vec3::splat(2.0));
        let t = unit.transformed(&(Mat4::from_translation(Vec3::X * 5.0) * m));
        assert!((t.center - Vec3::X * 5.0).length() < 1e-5);
        let expected = 2.0 * std::f32::consts::SQRT_2;
        assert!((t.half_extents.x - expected).abs() < 1e-4);
        assert!((t.half_extents.z - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_box_frustum_classification() {
        let frustum = Frustum::from_aabb(&Aabb::new(Vec3::ZERO, Vec3::splat(5.0)));
        assert_eq!(frustum.classify(&Aabb::new(Vec3::ZERO, Vec3::ONE)), Intersection::Inside);
        assert_eq!(
            frustum.classify(&Aabb::new(Vec3::new(5.0, 0.0, 0.0), Vec3::ONE)),
            Intersection::Intersecting
        );
        assert_eq!(
            frustum.classify(&Aabb::new(Vec3::new(7.0, 0.0, 0.0), Vec3::ONE)),
            Intersection::Outside
        );
    }

    #[test]
    fn test_perspective_frustum() {
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        let frustum = Frustum::from_view_proj(&(proj * view));
        assert!(frustum.contains_point(Vec3::new(0.0, 0.0, -10.0)));
        assert!(!frustum.contains_point(Vec3::new(0.0, 0.0, 10.0)));
        assert!(!frustum.contains_point(Vec3::new(0.0, 0.0, -200.0)));
        assert!(!frustum.contains_point(Vec3::new(20.0, 0.0, -10.0)));
        assert!(frustum.intersects(&Aabb::new(Vec3::new(0.0, 0.0, -50.0), Vec3::ONE)));
        assert!(!frustum.intersects(&Aabb::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ONE)));
    }
}
