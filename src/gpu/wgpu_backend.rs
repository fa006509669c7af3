// src/gpu/wgpu_backend.rs
//! wgpu 22 backend.
//!
//! Surfaces are textures usable as render targets, shader inputs and copy
//! sources. Full-screen passes read their inputs with `textureLoad`, so float
//! targets never need filtering support. Mesh and texture uploads are cached
//! per resource instance and dropped once the resource is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4};
use parking_lot::Mutex;
use wgpu::util::DeviceExt;
use winit::window::Window;

use crate::error::{Error, Result};
use crate::fx;
use crate::resources::{Mesh, Texture2D, TextureMapping, Vertex};

use super::{
    BloomParams, Draw, GeometryParams, GpuBackend, GpuSurface, LightingParams, LuminanceSettings, Pass, SurfaceDesc,
    SurfaceFormat, SurfaceId, TonemapParams, ALBEDO_FORMAT, BLOOM_FORMAT, DEPTH_FORMAT, EMISSIVE_FORMAT, HDR_FORMAT,
    NORMAL_FORMAT, OUTPUT_FORMAT, POSITION_FORMAT,
};

const FULLSCREEN_WGSL: &str = include_str!("shaders/fullscreen.wgsl");
const GEOMETRY_WGSL: &str = include_str!("shaders/geometry.wgsl");
const LIGHTING_WGSL: &str = include_str!("shaders/lighting.wgsl");
const BLOOM_WGSL: &str = include_str!("shaders/bloom.wgsl");
const TONEMAP_WGSL: &str = include_str!("shaders/tonemap.wgsl");
const BLIT_WGSL: &str = include_str!("shaders/blit.wgsl");

/// Lights beyond this are ignored by the lighting pass.
pub const MAX_LIGHTS: usize = 16;
const MAX_BLOOM_TAPS: usize = 32;

fn texture_format(format: SurfaceFormat) -> wgpu::TextureFormat {
    match format {
        SurfaceFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        SurfaceFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        SurfaceFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        SurfaceFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
    }
}

// ---------- Surfaces ----------

#[derive(Debug)]
struct SurfaceInner {
    id: SurfaceId,
    desc: SurfaceDesc,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

#[derive(Clone, Debug)]
pub struct WgpuSurface(Arc<SurfaceInner>);

impl WgpuSurface {
    #[inline]
    pub fn view(&self) -> &wgpu::TextureView {
        &self.0.view
    }
}

/// Colour attachment that keeps the target's contents.
fn load_attachment(surface: &WgpuSurface) -> Option<wgpu::RenderPassColorAttachment<'_>> {
    Some(wgpu::RenderPassColorAttachment {
        view: surface.view(),
        resolve_target: None,
        ops: wgpu::Operations {
            load: wgpu::LoadOp::Load,
            store: wgpu::StoreOp::Store,
        },
    })
}

impl GpuSurface for WgpuSurface {
    #[inline]
    fn id(&self) -> SurfaceId {
        self.0.id
    }

    #[inline]
    fn desc(&self) -> SurfaceDesc {
        self.0.desc
    }
}

// ---------- Uniform layouts ----------

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct GeometryUniform {
    world: [[f32; 4]; 4],
    view_proj: [[f32; 4]; 4],
    normal_matrix: [[f32; 4]; 4],
    base_color: [f32; 4],
    emissive: [f32; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct GpuLight {
    position_range: [f32; 4],
    color_intensity: [f32; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct LightingUniform {
    ambient: [f32; 4],
    counts: [u32; 4],
    lights: [GpuLight; MAX_LIGHTS],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct BloomUniform {
    params: [f32; 4],
    taps: [u32; 4],
    weights: [[f32; 4]; MAX_BLOOM_TAPS / 4],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct TonemapUniform {
    params: [f32; 4],
}

fn lighting_uniform(params: &LightingParams<'_>) -> LightingUniform {
    if params.lights.len() > MAX_LIGHTS {
        log::debug!("lighting pass: {} lights, using the first {}", params.lights.len(), MAX_LIGHTS);
    }
    let mut uniform = LightingUniform::zeroed();
    uniform.ambient = params.ambient.extend(0.0).to_array();
    let count = params.lights.len().min(MAX_LIGHTS);
    uniform.counts[0] = count as u32;
    for (dst, light) in uniform.lights.iter_mut().zip(params.lights) {
        *dst = GpuLight {
            position_range: light.position.extend(light.range).to_array(),
            color_intensity: light.color.extend(light.intensity).to_array(),
        };
    }
    uniform
}

fn bloom_uniform(params: &BloomParams) -> BloomUniform {
    let scale = params.key_value / params.average_luminance.max(1e-4) * params.exposure;
    let mut weights = fx::gaussian_weights(params.sigma);
    if weights.len() > MAX_BLOOM_TAPS - 1 {
        log::warn!("bloom sigma {} exceeds the kernel limit, truncating", params.sigma);
        let excess = (weights.len() - (MAX_BLOOM_TAPS - 1)) / 2;
        weights = weights[excess..weights.len() - excess].to_vec();
        let sum: f32 = weights.iter().sum();
        weights.iter_mut().for_each(|w| *w /= sum);
    }
    let mut uniform = BloomUniform::zeroed();
    uniform.params = [
        scale,
        params.threshold,
        if scale > 0.0 { params.strength / scale } else { 0.0 },
        0.0,
    ];
    uniform.taps[0] = weights.len() as u32;
    for (i, w) in weights.iter().enumerate() {
        uniform.weights[i / 4][i % 4] = *w;
    }
    uniform
}

fn tonemap_uniform(params: &TonemapParams) -> TonemapUniform {
    TonemapUniform {
        params: [params.key_value / params.average_luminance.max(1e-4), params.vignette, 0.0, 0.0],
    }
}

// ---------- Pipelines ----------

struct FullscreenPipeline {
    pipeline: wgpu::RenderPipeline,
    layout: wgpu::BindGroupLayout,
}

impl FullscreenPipeline {
    /// Binding 0 is the uniform block, bindings `1..=inputs` are unfiltered textures.
    fn new(device: &wgpu::Device, label: &str, source: &str, inputs: u32, target: SurfaceFormat) -> Self {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(format!("{FULLSCREEN_WGSL}\n{source}").into()),
        });

        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        entries.extend((1..=inputs).map(|binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        }));
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: "vs_fullscreen",
                compilation_options: Default::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: "fs_main",
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: texture_format(target),
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        Self { pipeline, layout }
    }
}

fn geometry_pipeline(device: &wgpu::Device) -> FullscreenPipeline {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("geometry"),
        source: wgpu::ShaderSource::Wgsl(GEOMETRY_WGSL.into()),
    });
    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("geometry_layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
        ],
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("geometry_pipeline_layout"),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });

    let color_target = |format: SurfaceFormat| {
        Some(wgpu::ColorTargetState {
            format: texture_format(format),
            blend: None,
            write_mask: wgpu::ColorWrites::ALL,
        })
    };
    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("geometry_pipeline"),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &module,
            entry_point: "vs_main",
            compilation_options: Default::default(),
            buffers: &[wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3, 2 => Float32x2],
            }],
        },
        fragment: Some(wgpu::FragmentState {
            module: &module,
            entry_point: "fs_main",
            compilation_options: Default::default(),
            targets: &[
                color_target(ALBEDO_FORMAT),
                color_target(NORMAL_FORMAT),
                color_target(POSITION_FORMAT),
                color_target(EMISSIVE_FORMAT),
            ],
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            ..Default::default()
        },
        depth_stencil: Some(wgpu::DepthStencilState {
            format: texture_format(DEPTH_FORMAT),
            depth_write_enabled: true,
            depth_compare: wgpu::CompareFunction::Less,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        }),
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    });

    FullscreenPipeline { pipeline, layout }
}

fn blit_pipeline(device: &wgpu::Device, format: wgpu::TextureFormat) -> FullscreenPipeline {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("blit"),
        source: wgpu::ShaderSource::Wgsl(format!("{FULLSCREEN_WGSL}\n{BLIT_WGSL}").into()),
    });
    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("blit_layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
        ],
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("blit_pipeline_layout"),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("blit_pipeline"),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &module,
            entry_point: "vs_fullscreen",
            compilation_options: Default::default(),
            buffers: &[],
        },
        fragment: Some(wgpu::FragmentState {
            module: &module,
            entry_point: "fs_main",
            compilation_options: Default::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    });
    FullscreenPipeline { pipeline, layout }
}

// ---------- Upload caches ----------

struct GpuMesh {
    source: Weak<Mesh>,
    vertices: wgpu::Buffer,
    indices: wgpu::Buffer,
}

struct GpuTexture {
    source: Weak<Texture2D>,
    view: wgpu::TextureView,
}

/// Entries keyed by the resource's address; a dead weak means the address
/// may have been reused and the entry is stale.
fn cached<R, G>(
    cache: &Mutex<HashMap<usize, Arc<G>>>,
    resource: &Arc<R>,
    source: impl Fn(&G) -> &Weak<R>,
    upload: impl FnOnce() -> G,
) -> Arc<G> {
    let key = Arc::as_ptr(resource) as usize;
    let mut cache = cache.lock();
    if let Some(entry) = cache.get(&key) {
        if source(entry).strong_count() > 0 {
            return Arc::clone(entry);
        }
    }
    cache.retain(|_, entry| source(entry).strong_count() > 0);
    let entry = Arc::new(upload());
    cache.insert(key, Arc::clone(&entry));
    entry
}

// ---------- Backend ----------

struct WindowTarget {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    blit: FullscreenPipeline,
}

pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    next_id: AtomicU64,
    window: Mutex<Option<WindowTarget>>,

    geometry: FullscreenPipeline,
    lighting: FullscreenPipeline,
    bloom: FullscreenPipeline,
    tonemap: FullscreenPipeline,

    wrap_sampler: wgpu::Sampler,
    clamp_sampler: wgpu::Sampler,
    mirror_sampler: wgpu::Sampler,
    white: Arc<GpuTexture>,

    meshes: Mutex<HashMap<usize, Arc<GpuMesh>>>,
    textures: Mutex<HashMap<usize, Arc<GpuTexture>>>,
}

impl WgpuBackend {
    /// Creates the device and, given a window, a presentable swapchain.
    pub async fn new(window: Option<Arc<Window>>) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = match &window {
            Some(window) => Some(instance.create_surface(Arc::clone(window)).map_err(Error::gpu)?),
            None => None,
        };

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: surface.as_ref(),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| Error::gpu("no suitable GPU adapter"))?;
        log::info!("using adapter: {:?}", adapter.get_info());

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("prism_device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(Error::gpu)?;

        let window_target = match (surface, &window) {
            (Some(surface), Some(window)) => {
                let size = window.inner_size();
                let caps = surface.get_capabilities(&adapter);
                let format = caps
                    .formats
                    .iter()
                    .copied()
                    .find(|f| f.is_srgb())
                    .or_else(|| caps.formats.first().copied())
                    .ok_or_else(|| Error::gpu("surface reports no formats"))?;
                let config = wgpu::SurfaceConfiguration {
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    format,
                    width: size.width.max(1),
                    height: size.height.max(1),
                    present_mode: wgpu::PresentMode::AutoVsync,
                    alpha_mode: caps.alpha_modes.first().copied().unwrap_or(wgpu::CompositeAlphaMode::Auto),
                    view_formats: vec![],
                    desired_maximum_frame_latency: 2,
                };
                surface.configure(&device, &config);
                Some(WindowTarget {
                    blit: blit_pipeline(&device, format),
                    surface,
                    config,
                })
            }
            _ => None,
        };

        let sampler = |address: wgpu::AddressMode, label: &str| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some(label),
                address_mode_u: address,
                address_mode_v: address,
                address_mode_w: address,
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                mipmap_filter: wgpu::FilterMode::Nearest,
                ..Default::default()
            })
        };
        let wrap_sampler = sampler(wgpu::AddressMode::Repeat, "wrap_sampler");
        let clamp_sampler = sampler(wgpu::AddressMode::ClampToEdge, "clamp_sampler");
        let mirror_sampler = sampler(wgpu::AddressMode::MirrorRepeat, "mirror_sampler");

        let white = Arc::new(GpuTexture {
            source: Weak::new(),
            view: upload_rgba8(&device, &queue, 1, 1, &[255; 4], "white"),
        });

        Ok(Self {
            geometry: geometry_pipeline(&device),
            lighting: FullscreenPipeline::new(&device, "lighting", LIGHTING_WGSL, 4, HDR_FORMAT),
            bloom: FullscreenPipeline::new(&device, "bloom", BLOOM_WGSL, 1, BLOOM_FORMAT),
            tonemap: FullscreenPipeline::new(&device, "tonemap", TONEMAP_WGSL, 2, OUTPUT_FORMAT),
            device: Arc::new(device),
            queue: Arc::new(queue),
            next_id: AtomicU64::new(1),
            window: Mutex::new(window_target),
            wrap_sampler,
            clamp_sampler,
            mirror_sampler,
            white,
            meshes: Mutex::new(HashMap::new()),
            textures: Mutex::new(HashMap::new()),
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    #[inline]
    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    /// Reconfigures the swapchain. Zero sizes (minimized windows) are ignored.
    pub fn resize(&self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        if let Some(target) = self.window.lock().as_mut() {
            target.config.width = width;
            target.config.height = height;
            target.surface.configure(&self.device, &target.config);
        }
    }

    fn sampler(&self, mapping: TextureMapping) -> &wgpu::Sampler {
        match mapping {
            TextureMapping::Wrap => &self.wrap_sampler,
            TextureMapping::Clamp => &self.clamp_sampler,
            TextureMapping::Mirror => &self.mirror_sampler,
        }
    }

    fn mesh_buffers(&self, mesh: &Arc<Mesh>) -> Arc<GpuMesh> {
        cached(&self.meshes, mesh, |m| &m.source, || GpuMesh {
            source: Arc::downgrade(mesh),
            vertices: self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("mesh_vertices"),
                contents: bytemuck::cast_slice(mesh.vertices()),
                usage: wgpu::BufferUsages::VERTEX,
            }),
            indices: self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("mesh_indices"),
                contents: bytemuck::cast_slice(mesh.indices()),
                usage: wgpu::BufferUsages::INDEX,
            }),
        })
    }

    fn texture_view(&self, texture: &Arc<Texture2D>) -> Arc<GpuTexture> {
        cached(&self.textures, texture, |t| &t.source, || GpuTexture {
            source: Arc::downgrade(texture),
            view: upload_rgba8(
                &self.device,
                &self.queue,
                texture.width(),
                texture.height(),
                texture.pixels(),
                texture.label(),
            ),
        })
    }

    fn encode_geometry(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        params: &GeometryParams<'_>,
        targets: &[&WgpuSurface],
    ) -> Result<()> {
        let [albedo, normal, position, emissive, depth] = targets else {
            return Err(Error::InvalidDraw {
                pass: "geometry",
                reason: format!("expected 5 targets, got {}", targets.len()),
            });
        };
        let Some(subset) = params.mesh.subsets().get(params.subset).copied() else {
            return Ok(());
        };
        if subset.index_count == 0 {
            return Ok(());
        }

        let mesh = self.mesh_buffers(params.mesh);
        let material = params.material;
        let texture = match material.albedo() {
            Some(texture) => self.texture_view(texture),
            None => Arc::clone(&self.white),
        };
        let normal_matrix = Mat4::from_mat3(Mat3::from_mat4(params.world).inverse().transpose());
        let uniform = GeometryUniform {
            world: params.world.to_cols_array_2d(),
            view_proj: params.view_proj.to_cols_array_2d(),
            normal_matrix: normal_matrix.to_cols_array_2d(),
            base_color: material.base_color().to_array(),
            emissive: material.emissive().extend(0.0).to_array(),
        };
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("geometry_uniform"),
            contents: bytemuck::bytes_of(&uniform),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("geometry_bind_group"),
            layout: &self.geometry.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&texture.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(self.sampler(material.sampler().mapping())),
                },
            ],
        });

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("geometry_pass"),
            color_attachments: &[
                load_attachment(albedo),
                load_attachment(normal),
                load_attachment(position),
                load_attachment(emissive),
            ],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: depth.view(),
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&self.geometry.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.set_vertex_buffer(0, mesh.vertices.slice(..));
        pass.set_index_buffer(mesh.indices.slice(..), wgpu::IndexFormat::Uint32);
        pass.draw_indexed(subset.start_index..subset.start_index + subset.index_count, 0, 0..1);
        Ok(())
    }

    fn encode_fullscreen(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        pipeline: &FullscreenPipeline,
        uniform: &[u8],
        inputs: &[&WgpuSurface],
        target: &WgpuSurface,
    ) {
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("pass_uniform"),
            contents: uniform,
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: buffer.as_entire_binding(),
        }];
        entries.extend(inputs.iter().enumerate().map(|(i, input)| wgpu::BindGroupEntry {
            binding: i as u32 + 1,
            resource: wgpu::BindingResource::TextureView(input.view()),
        }));
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &pipeline.layout,
            entries: &entries,
        });

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: None,
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target.view(),
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&pipeline.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..3, 0..1);
    }

    /// Reads an Rgba32Float surface back to the CPU.
    fn read_texels(&self, surface: &WgpuSurface) -> Result<Vec<[f32; 4]>> {
        let desc = surface.desc();
        if desc.format != SurfaceFormat::Rgba32Float {
            return Err(Error::gpu(format!("read-back supports Rgba32Float only, got {}", desc.format)));
        }
        let unpadded = desc.width * desc.format.bytes_per_pixel() as u32;
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: padded as u64 * desc.height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &surface.0.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(desc.height),
                },
            },
            wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv().map_err(Error::gpu)?.map_err(Error::gpu)?;

        let texels = {
            let data = slice.get_mapped_range();
            let mut texels = Vec::with_capacity(desc.texel_count());
            for row in data.chunks(padded as usize) {
                for px in row[..unpadded as usize].chunks_exact(16) {
                    texels.push(bytemuck::pod_read_unaligned::<[f32; 4]>(px));
                }
            }
            texels
        };
        buffer.unmap();
        Ok(texels)
    }
}

fn upload_rgba8(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    width: u32,
    height: u32,
    pixels: &[u8],
    label: &str,
) -> wgpu::TextureView {
    let texture = device.create_texture_with_data(
        queue,
        &wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        },
        wgpu::util::TextureDataOrder::LayerMajor,
        pixels,
    );
    texture.create_view(&wgpu::TextureViewDescriptor::default())
}

impl GpuBackend for WgpuBackend {
    type Surface = WgpuSurface;

    fn allocate_surface(&self, desc: &SurfaceDesc) -> Result<WgpuSurface> {
        let max = self.device.limits().max_texture_dimension_2d;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(desc.allocation_error(format!("extent outside 1..={max}")));
        }
        let usage = if desc.format.is_depth() {
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING
        } else {
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST
        };
        let id = SurfaceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let label = format!("surface_{}", id.0);

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: desc.mip_levels.max(1),
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(desc.format),
            usage,
            view_formats: &[],
        });
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        if let Some(err) = out_of_memory.or(validation) {
            return Err(desc.allocation_error(err.to_string()));
        }
        log::debug!("allocated {} ({}x{} {})", label, desc.width, desc.height, desc.format);

        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            base_mip_level: 0,
            mip_level_count: Some(1),
            ..Default::default()
        });
        Ok(WgpuSurface(Arc::new(SurfaceInner {
            id,
            desc: *desc,
            texture,
            view,
        })))
    }

    fn clear(&self, target: &WgpuSurface, value: [f32; 4]) -> Result<()> {
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("clear"),
        });
        {
            let color;
            let (color_attachments, depth_stencil_attachment) = if target.desc().format.is_depth() {
                let depth = wgpu::RenderPassDepthStencilAttachment {
                    view: target.view(),
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(value[0]),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                };
                (&[][..], Some(depth))
            } else {
                color = [Some(wgpu::RenderPassColorAttachment {
                    view: target.view(),
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: value[0] as f64,
                            g: value[1] as f64,
                            b: value[2] as f64,
                            a: value[3] as f64,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })];
                (&color[..], None)
            };
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("clear"),
                color_attachments,
                depth_stencil_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn submit(&self, draw: &Draw<'_, WgpuSurface>) -> Result<()> {
        draw.validate()?;
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(draw.pass.name()),
        });
        match &draw.pass {
            Pass::Geometry(params) => self.encode_geometry(&mut encoder, params, draw.targets)?,
            Pass::Lighting(params) => {
                let uniform = lighting_uniform(params);
                self.encode_fullscreen(&mut encoder, &self.lighting, bytemuck::bytes_of(&uniform), draw.inputs, draw.targets[0]);
            }
            Pass::Bloom(params) => {
                let uniform = bloom_uniform(params);
                self.encode_fullscreen(&mut encoder, &self.bloom, bytemuck::bytes_of(&uniform), draw.inputs, draw.targets[0]);
            }
            Pass::Tonemap(params) => {
                let uniform = tonemap_uniform(params);
                self.encode_fullscreen(&mut encoder, &self.tonemap, bytemuck::bytes_of(&uniform), draw.inputs, draw.targets[0]);
            }
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn measure_luminance(&self, image: &WgpuSurface, settings: &LuminanceSettings) -> Result<f32> {
        let texels = self.read_texels(image)?;
        Ok(fx::average_luminance(&texels, settings))
    }

    fn present(&self, surface: &WgpuSurface) -> Result<()> {
        let format = surface.desc().format;
        if !matches!(format, SurfaceFormat::Rgba16Float | SurfaceFormat::Rgba8Unorm) {
            return Err(Error::gpu(format!("cannot present a {format} surface")));
        }
        let mut window = self.window.lock();
        let Some(target) = window.as_mut() else {
            return Ok(());
        };

        let frame = match target.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                log::warn!("swapchain lost, reconfiguring");
                target.surface.configure(&self.device, &target.config);
                return Ok(());
            }
            Err(wgpu::SurfaceError::Timeout) => {
                log::warn!("swapchain timeout, skipping frame");
                return Ok(());
            }
            Err(err) => return Err(Error::gpu(err)),
        };
        let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("blit_bind_group"),
            layout: &target.blit.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(surface.view()),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.clamp_sampler),
                },
            ],
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("present"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("blit_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&target.blit.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
        frame.present();
        Ok(())
    }
}
