//! Rendering context and the current-binding discipline.
//!
//! A [`Context`] owns the GPU device/queue pair behind every resource the
//! crate creates. GPU objects may only be created or mutated while their
//! context is *current* on the calling thread; [`Context::current`] returns
//! an RAII guard that binds it, reentrantly, and releases the binding on
//! every exit path.
//!
//! Resources are exclusively owned by the context under which they were
//! created. Sharing a buffer or texture between two contexts is not
//! supported and is not detected beyond the currency check.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cgmath::Matrix4;

use crate::error::{Error, Result};
use crate::framebuffer::Framebuffer;
use crate::scene::Scene;
use crate::tensor::Tensor;
use crate::viewer::{CameraManipulator, Viewer};

/// Default clear color, a desaturated blue.
pub const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.32, 0.34, 0.87, 1.0];

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // (context id, reentrancy depth); id 0 means no context bound.
    static CURRENT: Cell<(u64, u32)> = const { Cell::new((0, 0)) };
}

/// Shared GPU state behind a context. Resources hold an `Arc` of this and
/// validate currency through it before touching the device.
pub(crate) struct GpuState {
    pub id: u64,
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    /// Whether wireframe fill (`PolygonMode::Line`) is available.
    pub polygon_mode_line: bool,
    /// Bound in place of sampler uniforms that have no explicit texture.
    pub default_sampler: wgpu::Sampler,
    /// 1x1 white texture bound for texture uniforms left unset.
    pub fallback_texture_view: wgpu::TextureView,
}

impl GpuState {
    pub fn is_current(&self) -> bool {
        CURRENT.with(|c| c.get().0 == self.id)
    }

    pub fn ensure_current(&self) -> Result<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(Error::NotCurrent)
        }
    }

    /// Uploads host bytes into a new GPU buffer, padding the allocation to
    /// the 4-byte copy alignment wgpu requires.
    pub fn upload_bytes(&self, bytes: &[u8], usage: wgpu::BufferUsages) -> wgpu::Buffer {
        let padded = pad4(bytes.len().max(4));
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tenview upload"),
            size: padded as u64,
            usage: usage | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: true,
        });
        buffer.slice(..).get_mapped_range_mut()[..bytes.len()].copy_from_slice(bytes);
        buffer.unmap();
        buffer
    }

    /// Writes host bytes into an existing buffer at offset zero, padding
    /// the tail write to the copy alignment.
    pub fn write_bytes(&self, target: &wgpu::Buffer, bytes: &[u8]) {
        let padded = pad4(bytes.len());
        if padded == bytes.len() {
            self.queue.write_buffer(target, 0, bytes);
        } else {
            let mut tmp = bytes.to_vec();
            tmp.resize(padded, 0);
            self.queue.write_buffer(target, 0, &tmp);
        }
    }

    /// Blocking download of a GPU buffer through a staging copy.
    pub fn read_buffer(&self, src: &wgpu::Buffer, size: u64) -> Result<Vec<u8>> {
        let padded = pad4(size as usize) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tenview readback"),
            size: padded,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("tenview readback encoder"),
            });
        encoder.copy_buffer_to_buffer(src, 0, &staging, 0, padded.min(src.size()));
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| Error::Gpu(format!("device poll failed: {e}")))?;
        rx.recv()
            .map_err(|_| Error::Gpu("buffer map callback dropped".into()))?
            .map_err(|e| Error::Gpu(format!("buffer map failed: {e:?}")))?;

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    /// Submits one encoder and waits for the GPU to finish.
    pub fn submit_wait(&self, encoder: wgpu::CommandEncoder) -> Result<()> {
        self.queue.submit(std::iter::once(encoder.finish()));
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| Error::Gpu(format!("device poll failed: {e}")))?;
        Ok(())
    }

    /// Binds this device current on the calling thread, reentrantly. The
    /// viewer renders through this, without a [`Context`] reference.
    pub fn bind(&self) -> Result<BindGuard> {
        CURRENT.with(|c| {
            let (id, depth) = c.get();
            if id == 0 {
                c.set((self.id, 1));
                Ok(())
            } else if id == self.id {
                c.set((id, depth + 1));
                Ok(())
            } else {
                Err(Error::ContextBusy)
            }
        })?;
        Ok(BindGuard { _private: () })
    }
}

pub(crate) struct BindGuard {
    _private: (),
}

impl Drop for BindGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| {
            let (id, depth) = c.get();
            debug_assert!(id != 0 && depth > 0);
            if depth <= 1 {
                c.set((0, 0));
            } else {
                c.set((id, depth - 1));
            }
        });
    }
}

pub(crate) fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// RAII guard returned by [`Context::current`]. Dropping it decrements the
/// reentrancy depth and unbinds the context at depth zero.
pub struct CurrentGuard<'a> {
    _bind: BindGuard,
    _ctx: PhantomData<&'a Context>,
}

/// The rendering context: device, queue and the logical render target
/// dimensions used for off-screen rendering.
pub struct Context {
    gpu: Arc<GpuState>,
    width: u32,
    height: u32,
    clear_color: [f32; 4],
}

impl Context {
    /// Creates a context with the given logical output dimensions.
    ///
    /// Initializes wgpu headlessly; a window surface is only created when
    /// a [`Viewer`] is requested.
    pub fn new(width: u32, height: u32) -> Result<Context> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| Error::Gpu(format!("no suitable adapter: {e}")))?;

        let polygon_mode_line = adapter
            .features()
            .contains(wgpu::Features::POLYGON_MODE_LINE);
        let mut required_features = wgpu::Features::empty();
        if polygon_mode_line {
            required_features |= wgpu::Features::POLYGON_MODE_LINE;
        }

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("tenview device"),
            required_features,
            required_limits: wgpu::Limits {
                max_texture_dimension_2d: 4096,
                ..wgpu::Limits::downlevel_defaults()
            },
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| Error::Gpu(format!("failed to request device: {e}")))?;

        let default_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("tenview default sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let fallback_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("tenview fallback texture"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &fallback_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &[255u8; 4],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4),
                rows_per_image: Some(1),
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        let fallback_texture_view =
            fallback_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let gpu = Arc::new(GpuState {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            instance,
            adapter,
            device,
            queue,
            polygon_mode_line,
            default_sampler,
            fallback_texture_view,
        });

        log::info!(
            "tenview context {} created ({}x{}, wireframe={})",
            gpu.id,
            width,
            height,
            polygon_mode_line
        );

        Ok(Context {
            gpu,
            width,
            height,
            clear_color: DEFAULT_CLEAR_COLOR,
        })
    }

    pub(crate) fn gpu(&self) -> Arc<GpuState> {
        self.gpu.clone()
    }

    /// Binds this context as current on the calling thread.
    ///
    /// Nesting is legal and idempotent: the binding is released when the
    /// outermost guard drops. Binding while a *different* context is
    /// current on this thread fails with [`Error::ContextBusy`].
    pub fn current(&self) -> Result<CurrentGuard<'_>> {
        Ok(CurrentGuard {
            _bind: self.gpu.bind()?,
            _ctx: PhantomData,
        })
    }

    /// True while any [`CurrentGuard`] for this context is alive on the
    /// calling thread, at any nesting depth.
    pub fn is_current(&self) -> bool {
        self.gpu.is_current()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Changes the logical render target dimensions used by subsequent
    /// renders that pass no explicit override.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width.max(1);
        self.height = height.max(1);
    }

    pub fn clear_color(&self) -> [f32; 4] {
        self.clear_color
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    /// Sets the clear color from a 4-component tensor of any supported
    /// dtype, host- or GPU-resident (the latter requires currency).
    pub fn set_clear_color_tensor(&mut self, color: &Tensor) -> Result<()> {
        let values = color.to_f32_components()?;
        if values.len() != 4 {
            return Err(Error::Shape(format!(
                "clear color needs 4 components, got {}",
                values.len()
            )));
        }
        self.clear_color = [values[0], values[1], values[2], values[3]];
        Ok(())
    }

    /// Off-screen render into `framebuffer`.
    ///
    /// The framebuffer's attachments are (re)sized to the context
    /// dimensions, or to `size` when given, and are left populated for
    /// read-back. The scene itself is not mutated beyond per-node render
    /// caches.
    pub fn render(
        &mut self,
        projection: Matrix4<f32>,
        view: Matrix4<f32>,
        framebuffer: &mut Framebuffer,
        scene: &Scene,
        size: Option<(u32, u32)>,
    ) -> Result<()> {
        let _guard = self.current()?;
        let (width, height) = size.unwrap_or((self.width, self.height));
        framebuffer.set_size(width, height)?;

        let color_formats = framebuffer.color_formats();
        let color_views = framebuffer.color_views();
        let depth_view = framebuffer.depth_view()?;

        let nodes = scene.flatten();
        let targets = crate::program::RenderTargets {
            color_formats: &color_formats,
            depth_format: Some(Framebuffer::DEPTH_FORMAT),
        };

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("tenview render encoder"),
            });

        {
            let [r, g, b, a] = self.clear_color;
            let attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = color_views
                .iter()
                .map(|view| {
                    view.as_ref().map(|view| wgpu::RenderPassColorAttachment {
                        view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color {
                                r: r as f64,
                                g: g as f64,
                                b: b as f64,
                                a: a as f64,
                            }),
                            store: wgpu::StoreOp::Store,
                        },
                    })
                })
                .collect();

            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("tenview offscreen pass"),
                color_attachments: &attachments,
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                occlusion_query_set: None,
                timestamp_writes: None,
            });

            let mut draw_seq = 0u64;
            for node in &nodes {
                node.borrow_mut().encode(
                    &mut pass,
                    &targets,
                    &projection,
                    &view,
                    &mut draw_seq,
                )?;
            }
        }

        self.gpu.submit_wait(encoder)?;
        Ok(())
    }

    /// Creates an interactive viewer window showing `scene`.
    pub fn viewer(&self, scene: Scene, cam_manip: CameraManipulator) -> Result<Viewer> {
        Viewer::new(
            self.gpu.clone(),
            scene,
            cam_manip,
            self.width,
            self.height,
            self.clear_color,
        )
    }

    /// Shows a viewer window and polls it until it signals termination.
    pub fn show(&self, scene: Scene, cam_manip: CameraManipulator) -> Result<()> {
        let mut viewer = self.viewer(scene, cam_manip)?;
        loop {
            let key = viewer.wait_key(1)?;
            if key < 0 {
                break;
            }
        }
        viewer.release();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> Option<Context> {
    match Context::new(64, 64) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            eprintln!("no GPU adapter available, skipping test: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn test_make_current_nesting() {
        let Some(ctx) = test_context() else { return };
        assert!(!ctx.is_current());
        {
            let _a = ctx.current().unwrap();
            {
                let _b = ctx.current().unwrap();
                {
                    let _c = ctx.current().unwrap();
                    assert!(ctx.is_current());
                }
                assert!(ctx.is_current());
            }
            assert!(ctx.is_current());
        }
        assert!(!ctx.is_current());
    }

    #[test]
    fn test_second_context_is_busy() {
        let Some(ctx_a) = test_context() else { return };
        let Some(ctx_b) = test_context() else { return };
        let _guard = ctx_a.current().unwrap();
        assert!(matches!(ctx_b.current(), Err(Error::ContextBusy)));
        assert!(!ctx_b.is_current());
    }

    #[test]
    fn test_attributes() {
        let Some(mut ctx) = test_context() else { return };
        assert_eq!(64, ctx.width());
        assert_eq!(64, ctx.height());
        ctx.resize(512, 612);
        assert_eq!(512, ctx.width());
        assert_eq!(612, ctx.height());

        let color = Tensor::from_vec(vec![1i32, 0, 1, 1], &[4]).unwrap();
        ctx.set_clear_color_tensor(&color).unwrap();
        assert_eq!(ctx.clear_color(), [1.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_render_size_override() {
        let Some(mut ctx) = test_context() else { return };
        let scene = Scene::new();
        let mut fb = {
            let _guard = ctx.current().unwrap();
            Framebuffer::new(&ctx)
        };

        let identity = Matrix4::from_scale(1.0);
        ctx.render(identity, identity, &mut fb, &scene, None).unwrap();
        assert_eq!((fb.width(), fb.height()), (64, 64));

        // per-call override resizes the attachments
        ctx.render(identity, identity, &mut fb, &scene, Some((16, 32)))
            .unwrap();
        assert_eq!((fb.width(), fb.height()), (16, 32));
        let _guard = ctx.current().unwrap();
        let image = fb.attachment(0).unwrap().borrow().to_tensor().unwrap();
        assert_eq!(image.shape(), &[32, 16, 4]);
    }

    #[test]
    fn test_guard_released_on_early_exit() {
        let Some(ctx) = test_context() else { return };
        let failing = || -> Result<()> {
            let _guard = ctx.current()?;
            Err(Error::Shape("forced".into()))
        };
        assert!(failing().is_err());
        assert!(!ctx.is_current());
    }
}
