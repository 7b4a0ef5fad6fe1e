//! Off-screen render targets with tensor read-back.
//!
//! A framebuffer is a set of color attachments keyed by output location
//! plus an implicit depth attachment. Attachments are allocated lazily:
//! the render call sizes them to the requested dimensions, so resizing
//! the context (or passing a per-render override) just reallocates on the
//! next frame.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::context::{Context, GpuState};
use crate::error::{Error, Result};
use crate::tensor::DType;
use crate::texture::{Texture, TextureRef};

/// Pixel format of one color attachment.
///
/// Three-channel formats are not expressible as wgpu color targets; users
/// of RGB outputs get the RGBA variant and drop the alpha channel after
/// read-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentFormat {
    RgbaUint8,
    RgbaFloat32,
    RgbaInt32,
    RUint8,
    RFloat32,
    RInt32,
    /// Read back as an Int32 tensor with the same bit pattern.
    RUint32,
}

impl AttachmentFormat {
    pub(crate) fn texture_format(self) -> wgpu::TextureFormat {
        match self {
            AttachmentFormat::RgbaUint8 => wgpu::TextureFormat::Rgba8Unorm,
            AttachmentFormat::RgbaFloat32 => wgpu::TextureFormat::Rgba32Float,
            AttachmentFormat::RgbaInt32 => wgpu::TextureFormat::Rgba32Sint,
            AttachmentFormat::RUint8 => wgpu::TextureFormat::R8Unorm,
            AttachmentFormat::RFloat32 => wgpu::TextureFormat::R32Float,
            AttachmentFormat::RInt32 => wgpu::TextureFormat::R32Sint,
            AttachmentFormat::RUint32 => wgpu::TextureFormat::R32Uint,
        }
    }

    fn dtype(self) -> DType {
        match self {
            AttachmentFormat::RgbaUint8 | AttachmentFormat::RUint8 => DType::Uint8,
            AttachmentFormat::RgbaFloat32 | AttachmentFormat::RFloat32 => DType::Float32,
            AttachmentFormat::RgbaInt32 | AttachmentFormat::RInt32 | AttachmentFormat::RUint32 => {
                DType::Int32
            }
        }
    }

    fn channels(self) -> usize {
        match self {
            AttachmentFormat::RgbaUint8
            | AttachmentFormat::RgbaFloat32
            | AttachmentFormat::RgbaInt32 => 4,
            _ => 1,
        }
    }
}

/// Off-screen render target.
pub struct Framebuffer {
    gpu: Arc<GpuState>,
    width: u32,
    height: u32,
    attachments: BTreeMap<u32, (AttachmentFormat, TextureRef)>,
    depth: Option<wgpu::Texture>,
}

impl Framebuffer {
    pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

    /// Creates a framebuffer with a single RGBA byte attachment at
    /// location 0.
    pub fn new(ctx: &Context) -> Framebuffer {
        let mut fb = Framebuffer::bare(ctx.gpu());
        fb.set_attachment(0, AttachmentFormat::RgbaUint8);
        fb
    }

    /// Creates a framebuffer with the given attachments.
    pub fn with_attachments(ctx: &Context, attachments: &[(u32, AttachmentFormat)]) -> Framebuffer {
        let mut fb = Framebuffer::bare(ctx.gpu());
        for &(location, format) in attachments {
            fb.set_attachment(location, format);
        }
        fb
    }

    pub(crate) fn bare(gpu: Arc<GpuState>) -> Framebuffer {
        Framebuffer {
            gpu,
            width: 0,
            height: 0,
            attachments: BTreeMap::new(),
            depth: None,
        }
    }

    /// Declares (or replaces) the attachment at an output location. The
    /// backing texture is allocated at the next render.
    pub fn set_attachment(&mut self, location: u32, format: AttachmentFormat) {
        let texture = Texture::for_render_target(
            self.gpu.clone(),
            format.texture_format(),
            format.dtype(),
            format.channels(),
        );
        self.attachments.insert(
            location,
            (format, std::rc::Rc::new(std::cell::RefCell::new(texture))),
        );
        self.width = 0; // force reallocation pass
    }

    /// The texture backing an output location, readable with
    /// `Texture::to_tensor` after a render.
    pub fn attachment(&self, location: u32) -> Option<TextureRef> {
        self.attachments.get(&location).map(|(_, t)| t.clone())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub(crate) fn set_size(&mut self, width: u32, height: u32) -> Result<()> {
        self.gpu.ensure_current()?;
        if self.attachments.is_empty() {
            return Err(Error::Gpu("framebuffer has no color attachments".into()));
        }
        let width = width.max(1);
        let height = height.max(1);
        if self.width == width && self.height == height && self.depth.is_some() {
            return Ok(());
        }
        for (_, texture) in self.attachments.values() {
            texture.borrow_mut().resize(width, height);
        }
        self.depth = Some(self.gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("tenview depth attachment"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        }));
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Color target formats indexed densely by location, `None` for gaps.
    pub(crate) fn color_formats(&self) -> Vec<Option<wgpu::TextureFormat>> {
        let max = match self.attachments.keys().next_back() {
            Some(&max) => max,
            None => return Vec::new(),
        };
        (0..=max)
            .map(|loc| {
                self.attachments
                    .get(&loc)
                    .map(|(format, _)| format.texture_format())
            })
            .collect()
    }

    pub(crate) fn color_views(&self) -> Vec<Option<wgpu::TextureView>> {
        let max = match self.attachments.keys().next_back() {
            Some(&max) => max,
            None => return Vec::new(),
        };
        (0..=max)
            .map(|loc| {
                self.attachments
                    .get(&loc)
                    .and_then(|(_, t)| t.borrow().view().ok())
            })
            .collect()
    }

    pub(crate) fn depth_view(&self) -> Result<wgpu::TextureView> {
        let depth = self
            .depth
            .as_ref()
            .ok_or_else(|| Error::Gpu("framebuffer depth attachment not allocated".into()))?;
        Ok(depth.create_view(&wgpu::TextureViewDescriptor::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    #[test]
    fn test_attachment_layout() {
        let Some(ctx) = test_context() else { return };
        let mut fb = Framebuffer::new(&ctx);
        fb.set_attachment(2, AttachmentFormat::RInt32);

        let formats = fb.color_formats();
        assert_eq!(formats.len(), 3);
        assert_eq!(formats[0], Some(wgpu::TextureFormat::Rgba8Unorm));
        assert_eq!(formats[1], None);
        assert_eq!(formats[2], Some(wgpu::TextureFormat::R32Sint));
        assert!(fb.attachment(0).is_some());
        assert!(fb.attachment(1).is_none());
    }

    #[test]
    fn test_lazy_sizing() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();

        let mut fb = Framebuffer::new(&ctx);
        fb.set_size(32, 16).unwrap();
        assert_eq!(fb.width(), 32);
        assert_eq!(fb.height(), 16);

        let tex = fb.attachment(0).unwrap();
        assert_eq!(tex.borrow().width(), 32);
        assert_eq!(tex.borrow().height(), 16);

        let cleared = tex.borrow().to_tensor().unwrap();
        assert_eq!(cleared.shape(), &[16, 32, 4]);

        fb.set_size(8, 8).unwrap();
        assert_eq!(fb.attachment(0).unwrap().borrow().width(), 8);
    }
}
