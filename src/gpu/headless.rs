// src/gpu/headless.rs
//! CPU backend: surfaces are texel arrays, geometry is software rasterized and
//! the full-screen passes run the kernels from [`crate::fx`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use glam::{Mat3, Vec2, Vec3, Vec4};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::fx;

use super::{Draw, GeometryParams, GpuBackend, GpuSurface, LuminanceSettings, Pass, SurfaceDesc, SurfaceId};

#[derive(Debug)]
struct SurfaceData {
    id: SurfaceId,
    desc: SurfaceDesc,
    texels: RwLock<Vec<[f32; 4]>>,
    allocated: Arc<AtomicUsize>,
}

impl Drop for SurfaceData {
    fn drop(&mut self) {
        self.allocated.fetch_sub(self.desc.size_bytes(), Ordering::Relaxed);
    }
}

/// Shared handle to a CPU surface. Depth surfaces keep the depth in the red channel.
#[derive(Clone, Debug)]
pub struct HeadlessSurface(Arc<SurfaceData>);

impl HeadlessSurface {
    /// Copy of the base level texels, row-major.
    pub fn texels(&self) -> Vec<[f32; 4]> {
        self.0.texels.read().clone()
    }

    pub fn texel(&self, x: u32, y: u32) -> Option<[f32; 4]> {
        if x >= self.0.desc.width || y >= self.0.desc.height {
            return None;
        }
        let index = (y * self.0.desc.width + x) as usize;
        self.0.texels.read().get(index).copied()
    }

    /// Overwrites the base level. Used to feed synthetic images.
    pub fn upload(&self, texels: &[[f32; 4]]) -> Result<()> {
        let mut dst = self.0.texels.write();
        crate::ensure!(
            texels.len() == dst.len(),
            "upload of {} texels into a {}x{} surface",
            texels.len(),
            self.0.desc.width,
            self.0.desc.height
        );
        dst.copy_from_slice(texels);
        Ok(())
    }
}

impl GpuSurface for HeadlessSurface {
    #[inline]
    fn id(&self) -> SurfaceId {
        self.0.id
    }

    #[inline]
    fn desc(&self) -> SurfaceDesc {
        self.0.desc
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub surfaces_allocated: u64,
    pub geometry_draws: u64,
    pub lighting_draws: u64,
    pub bloom_draws: u64,
    pub tonemap_draws: u64,
    pub presents: u64,
    pub last_presented: Option<SurfaceId>,
}

#[derive(Debug)]
pub struct HeadlessBackend {
    next_id: AtomicU64,
    allocated: Arc<AtomicUsize>,
    memory_budget: Option<usize>,
    stats: Mutex<HeadlessStats>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            allocated: Arc::new(AtomicUsize::new(0)),
            memory_budget: None,
            stats: Mutex::new(HeadlessStats::default()),
        }
    }

    /// Allocations that would push live surface memory above `bytes` fail.
    pub fn with_memory_budget(bytes: usize) -> Self {
        Self {
            memory_budget: Some(bytes),
            ..Self::new()
        }
    }

    /// Bytes held by live surfaces.
    #[inline]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> HeadlessStats {
        self.stats.lock().clone()
    }

    fn rasterize(&self, params: &GeometryParams<'_>, targets: &[&HeadlessSurface]) -> Result<()> {
        let [albedo, normal, position, emissive, depth] = targets else {
            return Err(Error::InvalidDraw {
                pass: "geometry",
                reason: format!("expected 5 targets, got {}", targets.len()),
            });
        };
        let desc = albedo.desc();
        let (width, height) = (desc.width, desc.height);
        let mut albedo = albedo.0.texels.write();
        let mut normal = normal.0.texels.write();
        let mut position = position.0.texels.write();
        let mut emissive = emissive.0.texels.write();
        let mut depth = depth.0.texels.write();

        let mesh = params.mesh;
        let material = params.material;
        let normal_matrix = Mat3::from_mat4(params.world).inverse().transpose();
        let glow = material.emissive();

        for triangle in mesh.subset_indices(params.subset).chunks_exact(3) {
            let mut clip = [Vec4::ZERO; 3];
            let mut world = [Vec3::ZERO; 3];
            let mut normals = [Vec3::ZERO; 3];
            let mut uvs = [Vec2::ZERO; 3];
            for (k, &index) in triangle.iter().enumerate() {
                let vertex = &mesh.vertices()[index as usize];
                world[k] = params.world.transform_point3(Vec3::from(vertex.position));
                clip[k] = params.view_proj * world[k].extend(1.0);
                normals[k] = normal_matrix * Vec3::from(vertex.normal);
                uvs[k] = Vec2::from(vertex.uv);
            }
            // No near-plane clipping: triangles reaching behind the eye are dropped.
            if clip.iter().any(|c| c.w <= 1e-5) {
                continue;
            }

            let screen: [Vec3; 3] = clip.map(|c| {
                let ndc = c.truncate() / c.w;
                Vec3::new(
                    (ndc.x * 0.5 + 0.5) * width as f32,
                    (0.5 - ndc.y * 0.5) * height as f32,
                    ndc.z,
                )
            });
            let area = edge(screen[0], screen[1], screen[2].truncate());
            if area.abs() <= f32::EPSILON {
                continue;
            }

            let lo = screen.iter().fold(Vec2::splat(f32::MAX), |m, s| m.min(s.truncate()));
            let hi = screen.iter().fold(Vec2::splat(f32::MIN), |m, s| m.max(s.truncate()));
            let x0 = lo.x.floor().max(0.0) as u32;
            let y0 = lo.y.floor().max(0.0) as u32;
            let x1 = (hi.x.ceil().max(0.0) as u32).min(width);
            let y1 = (hi.y.ceil().max(0.0) as u32).min(height);

            for y in y0..y1 {
                for x in x0..x1 {
                    let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                    let b = Vec3::new(
                        edge(screen[1], screen[2], p),
                        edge(screen[2], screen[0], p),
                        edge(screen[0], screen[1], p),
                    ) / area;
                    if b.min_element() < 0.0 {
                        continue;
                    }
                    let z = b.dot(Vec3::new(screen[0].z, screen[1].z, screen[2].z));
                    let index = (y * width + x) as usize;
                    if !(0.0..=1.0).contains(&z) || z >= depth[index][0] {
                        continue;
                    }

                    // Perspective-correct attribute weights.
                    let pw = b / Vec3::new(clip[0].w, clip[1].w, clip[2].w);
                    let pw = pw / (pw.x + pw.y + pw.z);
                    let uv = uvs[0] * pw.x + uvs[1] * pw.y + uvs[2] * pw.z;
                    let n = (normals[0] * pw.x + normals[1] * pw.y + normals[2] * pw.z).normalize_or_zero();
                    let wp = world[0] * pw.x + world[1] * pw.y + world[2] * pw.z;
                    let color = material.albedo_at(uv.x, uv.y);

                    albedo[index] = [color.x, color.y, color.z, 1.0];
                    normal[index] = [n.x, n.y, n.z, 0.0];
                    position[index] = [wp.x, wp.y, wp.z, 1.0];
                    emissive[index] = [glow.x, glow.y, glow.z, 1.0];
                    depth[index] = [z, 0.0, 0.0, 0.0];
                }
            }
        }
        Ok(())
    }
}

#[inline]
fn edge(a: Vec3, b: Vec3, p: Vec2) -> f32 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

impl GpuBackend for HeadlessBackend {
    type Surface = HeadlessSurface;

    fn allocate_surface(&self, desc: &SurfaceDesc) -> Result<HeadlessSurface> {
        if desc.width == 0 || desc.height == 0 {
            return Err(desc.allocation_error("zero-sized surface"));
        }
        let bytes = desc.size_bytes();
        if let Some(budget) = self.memory_budget {
            let live = self.allocated_bytes();
            if live + bytes > budget {
                return Err(desc.allocation_error(format!(
                    "{bytes} bytes requested with {live} of {budget} in use"
                )));
            }
        }
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
        let id = SurfaceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.stats.lock().surfaces_allocated += 1;
        log::debug!("allocated surface {:?}: {}x{} {}", id, desc.width, desc.height, desc.format);

        Ok(HeadlessSurface(Arc::new(SurfaceData {
            id,
            desc: *desc,
            texels: RwLock::new(vec![[0.0; 4]; desc.texel_count()]),
            allocated: self.allocated.clone(),
        })))
    }

    fn clear(&self, target: &HeadlessSurface, value: [f32; 4]) -> Result<()> {
        let fill = if target.desc().format.is_depth() {
            [value[0], 0.0, 0.0, 0.0]
        } else {
            value
        };
        target.0.texels.write().fill(fill);
        Ok(())
    }

    fn submit(&self, draw: &Draw<'_, HeadlessSurface>) -> Result<()> {
        draw.validate()?;
        let (width, height) = match draw.targets.first() {
            Some(t) => (t.desc().width, t.desc().height),
            None => return Ok(()),
        };
        let read = |index: usize| draw.inputs[index].texels();

        match &draw.pass {
            Pass::Geometry(params) => {
                self.rasterize(params, draw.targets)?;
                self.stats.lock().geometry_draws += 1;
            }
            Pass::Lighting(params) => {
                let hdr = fx::shade(&read(0), &read(1), &read(2), &read(3), params.lights, params.ambient);
                *draw.targets[0].0.texels.write() = hdr;
                self.stats.lock().lighting_draws += 1;
            }
            Pass::Bloom(params) => {
                let glow = fx::bloom(&read(0), width, height, params);
                *draw.targets[0].0.texels.write() = glow;
                self.stats.lock().bloom_draws += 1;
            }
            Pass::Tonemap(params) => {
                let image = read(0);
                let glow = read(1);
                crate::ensure!(
                    image.len() == glow.len() && image.len() == draw.targets[0].desc().texel_count(),
                    "tonemap inputs and target differ in size"
                );
                *draw.targets[0].0.texels.write() = fx::tonemap(&image, &glow, width, height, params);
                self.stats.lock().tonemap_draws += 1;
            }
        }
        Ok(())
    }

    fn measure_luminance(&self, image: &HeadlessSurface, settings: &LuminanceSettings) -> Result<f32> {
        Ok(fx::average_luminance(&image.0.texels.read(), settings))
    }

    fn present(&self, surface: &HeadlessSurface) -> Result<()> {
        let mut stats = self.stats.lock();
        stats.presents += 1;
        stats.last_presented = Some(surface.id());
        Ok(())
    }
}
