// src/fx.rs
//! CPU reference kernels for the lighting and postprocess passes.
//!
//! The headless backend runs these directly. The wgpu backend mirrors them in
//! WGSL and reuses [`average_luminance`] on read-back texels.

use glam::{Vec3, Vec4};

use crate::gpu::{BloomParams, LuminanceSettings, PointLight, TonemapParams};

/// Bins of the log2 luminance histogram.
pub const HISTOGRAM_BINS: usize = 64;

const LUMINANCE_EPSILON: f32 = 1e-4;

/// Rec.709 relative luminance.
#[inline]
pub fn relative_luminance(rgb: Vec3) -> f32 {
    rgb.dot(Vec3::new(0.2126, 0.7152, 0.0722))
}

#[inline]
fn texel_luminance(texel: &[f32; 4]) -> f32 {
    relative_luminance(Vec3::new(texel[0], texel[1], texel[2])).max(0.0)
}

/// Average luminance of the texels between the low and high percentiles.
///
/// Luminances are binned on a log2 scale spanning `[min, max]`; the band
/// average uses bin centres, so the result is quantized to the bin width.
/// Empty input (or an empty band) yields `min_luminance`.
pub fn average_luminance(texels: &[[f32; 4]], settings: &LuminanceSettings) -> f32 {
    let min = settings.min_luminance.max(f32::MIN_POSITIVE);
    let max = settings.max_luminance.max(min);
    let (log_min, log_max) = (min.log2(), max.log2());
    let range = (log_max - log_min).max(f32::EPSILON);

    let mut histogram = [0u32; HISTOGRAM_BINS];
    for texel in texels {
        let lum = texel_luminance(texel).clamp(min, max);
        let t = (lum.log2() - log_min) / range;
        let bin = ((t * HISTOGRAM_BINS as f32) as usize).min(HISTOGRAM_BINS - 1);
        histogram[bin] += 1;
    }

    let count = texels.len() as f32;
    let low = settings.low_percentage.clamp(0.0, 1.0) * count;
    let high = settings.high_percentage.clamp(0.0, 1.0).max(settings.low_percentage) * count;

    let mut cumulative = 0.0;
    let mut weighted = 0.0;
    let mut weight = 0.0;
    for (bin, &n) in histogram.iter().enumerate() {
        let start = cumulative;
        cumulative += n as f32;
        let overlap = cumulative.min(high) - start.max(low);
        if overlap > 0.0 {
            let centre = (log_min + (bin as f32 + 0.5) / HISTOGRAM_BINS as f32 * range).exp2();
            weighted += centre * overlap;
            weight += overlap;
        }
    }

    if weight <= 0.0 {
        return min;
    }
    (weighted / weight).clamp(min, max)
}

/// Normalized Gaussian taps, radius `ceil(3 * sigma)`.
pub fn gaussian_weights(sigma: f32) -> Vec<f32> {
    if sigma <= 0.0 {
        return vec![1.0];
    }
    let radius = (3.0 * sigma).ceil() as i32;
    let mut weights: Vec<f32> = (-radius..=radius)
        .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = weights.iter().sum();
    weights.iter_mut().for_each(|w| *w /= sum);
    weights
}

/// Bright pass plus separable blur. Returns the glow buffer in HDR image units.
pub fn bloom(image: &[[f32; 4]], width: u32, height: u32, params: &BloomParams) -> Vec<[f32; 4]> {
    let scale = params.key_value / params.average_luminance.max(LUMINANCE_EPSILON) * params.exposure;

    let bright: Vec<Vec4> = image
        .iter()
        .map(|texel| {
            let exposed = Vec3::new(texel[0], texel[1], texel[2]) * scale;
            let lum = relative_luminance(exposed);
            if lum > params.threshold {
                (exposed * ((lum - params.threshold) / lum)).extend(1.0)
            } else {
                Vec4::ZERO
            }
        })
        .collect();

    let weights = gaussian_weights(params.sigma);
    let horizontal = blur(&bright, width, height, &weights, (1, 0));
    let blurred = blur(&horizontal, width, height, &weights, (0, 1));

    let unscale = if scale > 0.0 { params.strength / scale } else { 0.0 };
    blurred
        .into_iter()
        .map(|c| {
            let rgb = c.truncate() * unscale;
            [rgb.x, rgb.y, rgb.z, 1.0]
        })
        .collect()
}

fn blur(src: &[Vec4], width: u32, height: u32, weights: &[f32], step: (i32, i32)) -> Vec<Vec4> {
    let (w, h) = (width as i32, height as i32);
    let radius = (weights.len() / 2) as i32;
    let mut out = vec![Vec4::ZERO; src.len()];
    for y in 0..h {
        for x in 0..w {
            let mut acc = Vec4::ZERO;
            for (tap, weight) in weights.iter().enumerate() {
                let offset = tap as i32 - radius;
                let sx = (x + offset * step.0).clamp(0, w - 1);
                let sy = (y + offset * step.1).clamp(0, h - 1);
                acc += src[(sy * w + sx) as usize] * *weight;
            }
            out[(y * w + x) as usize] = acc;
        }
    }
    out
}

/// Auto-exposure, luminance-preserving Reinhard over `image + bloom`, vignette.
pub fn tonemap(
    image: &[[f32; 4]],
    bloom: &[[f32; 4]],
    width: u32,
    height: u32,
    params: &TonemapParams,
) -> Vec<[f32; 4]> {
    let exposure = params.key_value / params.average_luminance.max(LUMINANCE_EPSILON);
    let mut out = Vec::with_capacity(image.len());
    for (i, (texel, glow)) in image.iter().zip(bloom).enumerate() {
        let x = (i as u32 % width) as f32;
        let y = (i as u32 / width) as f32;
        let color = (Vec3::new(texel[0], texel[1], texel[2]) + Vec3::new(glow[0], glow[1], glow[2])) * exposure;
        let mapped = color / (1.0 + relative_luminance(color).max(0.0));

        let nx = (x + 0.5) / width as f32 * 2.0 - 1.0;
        let ny = (y + 0.5) / height as f32 * 2.0 - 1.0;
        let vignette = (1.0 - params.vignette * (nx * nx + ny * ny) * 0.5).max(0.0);

        let rgb = mapped * vignette;
        out.push([rgb.x, rgb.y, rgb.z, 1.0]);
    }
    out
}

/// Point-light attenuation: smooth window to zero at `range`, inverse-square body.
#[inline]
pub fn attenuation(distance: f32, range: f32) -> f32 {
    if range <= 0.0 {
        return 0.0;
    }
    let ratio = distance / range;
    let window = (1.0 - ratio * ratio * ratio * ratio).clamp(0.0, 1.0);
    window * window / (distance * distance + 1.0)
}

/// Deferred lighting over a G-buffer. Texels with zero albedo alpha had no
/// geometry and pass the emissive clear value (the background colour) through.
pub fn shade(
    albedo: &[[f32; 4]],
    normal: &[[f32; 4]],
    position: &[[f32; 4]],
    emissive: &[[f32; 4]],
    lights: &[PointLight],
    ambient: Vec3,
) -> Vec<[f32; 4]> {
    let mut out = Vec::with_capacity(albedo.len());
    for i in 0..albedo.len() {
        let base = Vec4::from(albedo[i]);
        if base.w <= 0.0 {
            out.push([emissive[i][0], emissive[i][1], emissive[i][2], 1.0]);
            continue;
        }
        let base = base.truncate();
        let n = Vec3::new(normal[i][0], normal[i][1], normal[i][2]).normalize_or_zero();
        let p = Vec3::new(position[i][0], position[i][1], position[i][2]);

        let mut color = base * ambient;
        for light in lights {
            let to_light = light.position - p;
            let distance = to_light.length();
            if distance <= f32::EPSILON {
                continue;
            }
            let n_dot_l = n.dot(to_light / distance).max(0.0);
            color += base * light.color * (light.intensity * n_dot_l * attenuation(distance, light.range));
        }
        color += Vec3::new(emissive[i][0], emissive[i][1], emissive[i][2]);
        out.push([color.x, color.y, color.z, 1.0]);
    }
    out
}
