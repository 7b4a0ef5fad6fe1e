//! Interactive window on top of a scene.
//!
//! The viewer is polled rather than run: [`Viewer::wait_key`] pumps the
//! winit event loop for a bounded time and reports the last key press,
//! with a negative value once the window was closed or Escape pressed.

use std::sync::Arc;
use std::time::Duration;

use cgmath::Matrix4;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::{ElementState, KeyEvent, MouseButton, MouseScrollDelta, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{Key, NamedKey},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowAttributes},
};

use crate::camera::{FirstPerson, TrackBall};
use crate::context::GpuState;
use crate::error::{Error, Result};
use crate::framebuffer::{AttachmentFormat, Framebuffer};
use crate::program::RenderTargets;
use crate::projection::Projection;
use crate::scene::Scene;
use crate::tensor::Tensor;

pub use crate::camera::CameraManipulator;

const DEFAULT_FOV_Y: f32 = 45.0;

pub struct Viewer {
    event_loop: EventLoop<()>,
    state: ViewerState,
    released: bool,
}

struct ViewerState {
    gpu: Arc<GpuState>,
    scene: Scene,
    manipulator: CameraManipulator,
    trackball: TrackBall,
    first_person: FirstPerson,
    move_speed: f32,
    near: f64,
    far: f64,

    window: Option<Arc<Window>>,
    surface: Option<wgpu::Surface<'static>>,
    config: Option<wgpu::SurfaceConfiguration>,
    depth: Option<wgpu::Texture>,

    width: u32,
    height: u32,
    clear_color: [f32; 4],

    pending_key: Option<i32>,
    closed: bool,
    error: Option<Error>,
    dragging: bool,
    cursor: Option<(f64, f64)>,
}

impl Viewer {
    pub(crate) fn new(
        gpu: Arc<GpuState>,
        scene: Scene,
        manipulator: CameraManipulator,
        width: u32,
        height: u32,
        clear_color: [f32; 4],
    ) -> Result<Viewer> {
        let event_loop = EventLoop::new()
            .map_err(|e| Error::Gpu(format!("failed to create event loop: {e}")))?;

        let mut state = ViewerState {
            gpu,
            scene,
            manipulator,
            trackball: TrackBall::default(),
            first_person: FirstPerson::default(),
            move_speed: 0.1,
            near: 0.05,
            far: 1000.0,
            window: None,
            surface: None,
            config: None,
            depth: None,
            width: width.max(1),
            height: height.max(1),
            clear_color,
            pending_key: None,
            closed: false,
            error: None,
            dragging: false,
            cursor: None,
        };
        state.reset_view();

        Ok(Viewer {
            event_loop,
            state,
            released: false,
        })
    }

    /// Pumps window events for at most `timeout_ms` milliseconds.
    ///
    /// Returns the character code of the last key pressed since the
    /// previous call, `0` when no key was pressed, or a negative value
    /// once the viewer wants to quit.
    pub fn wait_key(&mut self, timeout_ms: u64) -> Result<i32> {
        if self.released || self.state.closed {
            return Ok(-1);
        }

        let status = self
            .event_loop
            .pump_app_events(Some(Duration::from_millis(timeout_ms)), &mut self.state);
        if let PumpStatus::Exit(_) = status {
            self.state.closed = true;
        }
        if let Some(err) = self.state.error.take() {
            return Err(err);
        }
        if self.state.closed {
            return Ok(-1);
        }
        Ok(self.state.pending_key.take().unwrap_or(0))
    }

    /// Reframes the camera so the whole scene is visible.
    pub fn reset_view(&mut self) {
        self.state.reset_view();
    }

    pub fn scene(&self) -> &Scene {
        &self.state.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.state.scene
    }

    pub fn projection_matrix(&self) -> Matrix4<f32> {
        self.state.projection().to_matrix()
    }

    pub fn view_matrix(&self) -> Matrix4<f32> {
        self.state.view_matrix()
    }

    /// Renders the scene off-screen at the window size and returns the
    /// image as a `[height, width, 4]` uint8 tensor.
    pub fn take_screenshot(&mut self) -> Result<Tensor> {
        let _bind = self.state.gpu.bind()?;

        let mut fb = Framebuffer::bare(self.state.gpu.clone());
        fb.set_attachment(0, AttachmentFormat::RgbaUint8);
        fb.set_size(self.state.width, self.state.height)?;

        let projection = self.state.projection().to_matrix();
        let view = self.state.view_matrix();

        let color_formats = fb.color_formats();
        let color_views = fb.color_views();
        let depth_view = fb.depth_view()?;
        let color_view = color_views[0]
            .as_ref()
            .ok_or_else(|| Error::Gpu("screenshot attachment missing".into()))?;

        let mut encoder =
            self.state
                .gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("tenview screenshot encoder"),
                });
        encode_scene_pass(
            &mut encoder,
            color_view,
            &color_formats,
            &depth_view,
            self.state.clear_color,
            &self.state.scene,
            &projection,
            &view,
        )?;
        self.state.gpu.submit_wait(encoder)?;

        let attachment = fb
            .attachment(0)
            .ok_or_else(|| Error::Gpu("screenshot attachment missing".into()))?;
        let tensor = attachment.borrow().to_tensor()?;
        Ok(tensor)
    }

    /// Closes the window and drops the surface. Further `wait_key` calls
    /// return a negative value.
    pub fn release(&mut self) {
        self.state.surface = None;
        self.state.config = None;
        self.state.depth = None;
        self.state.window = None;
        self.released = true;
    }
}

impl ViewerState {
    fn reset_view(&mut self) {
        let bounds = self.scene.bounds();
        let fov = self.fov_for_framing();
        self.trackball.reset(bounds, fov);
        self.first_person.reset(bounds, fov);

        let radius = bounds.map(|b| b.radius()).unwrap_or(1.0).max(1e-3);
        self.move_speed = radius * 0.05;
        self.near = (radius as f64 * 0.01).max(1e-4);
        self.far = (radius as f64 * 100.0).max(10.0);
    }

    /// The narrower of the vertical and horizontal fields of view, so a
    /// framed sphere fits both window dimensions.
    fn fov_for_framing(&self) -> f32 {
        let proj = self.projection();
        proj.fov_y.min(proj.fov_x) as f32
    }

    fn projection(&self) -> Projection {
        let aspect = self.width as f64 / self.height.max(1) as f64;
        Projection::perspective(DEFAULT_FOV_Y as f64, self.near, self.far, Some(aspect))
    }

    fn view_matrix(&self) -> Matrix4<f32> {
        match self.manipulator {
            CameraManipulator::TrackBall => self.trackball.view_matrix(),
            CameraManipulator::FirstPerson => self.first_person.view_matrix(),
        }
    }

    fn create_depth(&self) -> wgpu::Texture {
        self.gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("tenview viewer depth"),
            size: wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Framebuffer::DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        })
    }

    fn configure_surface(&mut self) {
        let (Some(surface), Some(config)) = (self.surface.as_ref(), self.config.as_mut()) else {
            return;
        };
        config.width = self.width;
        config.height = self.height;
        surface.configure(&self.gpu.device, config);
        self.depth = Some(self.create_depth());
    }

    fn render_frame(&mut self) -> Result<()> {
        let (Some(surface), Some(config)) = (self.surface.as_ref(), self.config.as_ref()) else {
            return Ok(());
        };

        let frame = match surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                self.configure_surface();
                return Ok(());
            }
            Err(e) => return Err(Error::Gpu(format!("surface acquire failed: {e}"))),
        };

        let color_view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let depth = self
            .depth
            .get_or_insert_with(|| {
                self.gpu.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("tenview viewer depth"),
                    size: wgpu::Extent3d {
                        width: config.width,
                        height: config.height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: Framebuffer::DEPTH_FORMAT,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    view_formats: &[],
                })
            })
            .create_view(&wgpu::TextureViewDescriptor::default());

        let projection = self.projection().to_matrix();
        let view = self.view_matrix();
        let color_formats = [Some(config.format)];

        let _bind = self.gpu.bind()?;
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("tenview viewer encoder"),
            });
        encode_scene_pass(
            &mut encoder,
            &color_view,
            &color_formats,
            &depth,
            self.clear_color,
            &self.scene,
            &projection,
            &view,
        )?;
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        frame.present();
        Ok(())
    }

    fn handle_key(&mut self, event: &KeyEvent) {
        if event.state != ElementState::Pressed {
            return;
        }
        match &event.logical_key {
            Key::Named(NamedKey::Escape) => {
                self.pending_key = Some(-1);
                self.closed = true;
            }
            Key::Character(text) => {
                let ch = text.chars().next().unwrap_or('\0');
                if self.manipulator == CameraManipulator::FirstPerson {
                    match ch.to_ascii_lowercase() {
                        'w' => self.first_person.advance(self.move_speed),
                        's' => self.first_person.advance(-self.move_speed),
                        'a' => self.first_person.strafe(-self.move_speed),
                        'd' => self.first_person.strafe(self.move_speed),
                        _ => {}
                    }
                }
                self.pending_key = Some(ch as i32);
            }
            _ => {}
        }
    }

    fn handle_drag(&mut self, dx: f32, dy: f32) {
        match self.manipulator {
            CameraManipulator::TrackBall => self.trackball.rotate(dx * 0.4, -dy * 0.4),
            CameraManipulator::FirstPerson => self.first_person.look(dx * 0.2, -dy * 0.2),
        }
    }
}

impl ApplicationHandler for ViewerState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attributes = WindowAttributes::default()
            .with_title("tenview")
            .with_inner_size(winit::dpi::LogicalSize::new(self.width, self.height));
        let window = match event_loop.create_window(attributes) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                self.error = Some(Error::Gpu(format!("failed to create window: {e}")));
                self.closed = true;
                return;
            }
        };

        let surface = match self.gpu.instance.create_surface(window.clone()) {
            Ok(surface) => surface,
            Err(e) => {
                self.error = Some(Error::Gpu(format!("failed to create surface: {e}")));
                self.closed = true;
                return;
            }
        };

        let (width, height) = window.inner_size().into();
        self.width = u32::max(width, 1);
        self.height = u32::max(height, 1);

        let caps = surface.get_capabilities(&self.gpu.adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .unwrap_or(caps.formats[0]);
        self.config = Some(wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: self.width,
            height: self.height,
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        });
        self.surface = Some(surface);
        self.window = Some(window);
        self.configure_surface();
        log::info!("viewer window open, surface format {format:?}");
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                self.closed = true;
                event_loop.exit();
            }
            WindowEvent::KeyboardInput { event, .. } => {
                self.handle_key(&event);
                if self.closed {
                    event_loop.exit();
                }
            }
            WindowEvent::Resized(PhysicalSize { width, height }) => {
                self.width = width.max(1);
                self.height = height.max(1);
                self.configure_surface();
            }
            WindowEvent::MouseInput { state, button, .. } => {
                if button == MouseButton::Left {
                    self.dragging = state == ElementState::Pressed;
                    if !self.dragging {
                        self.cursor = None;
                    }
                }
            }
            WindowEvent::CursorMoved { position, .. } => {
                let pos = (position.x, position.y);
                if self.dragging {
                    if let Some((px, py)) = self.cursor {
                        self.handle_drag((pos.0 - px) as f32, (pos.1 - py) as f32);
                    }
                }
                self.cursor = Some(pos);
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let steps = match delta {
                    MouseScrollDelta::LineDelta(_, y) => y,
                    MouseScrollDelta::PixelDelta(pos) => pos.y as f32 / 60.0,
                };
                if self.manipulator == CameraManipulator::TrackBall {
                    self.trackball.zoom(steps);
                } else {
                    self.first_person.advance(steps * self.move_speed);
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render_frame() {
                    log::error!("viewer frame failed: {e}");
                    self.error = Some(e);
                    self.closed = true;
                    event_loop.exit();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

/// One clear-and-draw pass over a flattened scene.
#[allow(clippy::too_many_arguments)]
fn encode_scene_pass(
    encoder: &mut wgpu::CommandEncoder,
    color_view: &wgpu::TextureView,
    color_formats: &[Option<wgpu::TextureFormat>],
    depth_view: &wgpu::TextureView,
    clear: [f32; 4],
    scene: &Scene,
    projection: &Matrix4<f32>,
    view: &Matrix4<f32>,
) -> Result<()> {
    let targets = RenderTargets {
        color_formats,
        depth_format: Some(Framebuffer::DEPTH_FORMAT),
    };

    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("tenview viewer pass"),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view: color_view,
            resolve_target: None,
            ops: wgpu::Operations {
                load: wgpu::LoadOp::Clear(wgpu::Color {
                    r: clear[0] as f64,
                    g: clear[1] as f64,
                    b: clear[2] as f64,
                    a: clear[3] as f64,
                }),
                store: wgpu::StoreOp::Store,
            },
        })],
        depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
            view: depth_view,
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
    for node in scene.flatten() {
        node.borrow_mut()
            .encode(&mut pass, &targets, projection, view, &mut draw_seq)?;
    }
    Ok(())
}
