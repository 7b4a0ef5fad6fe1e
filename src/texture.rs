//! GPU textures created from tensors and read back into them.
//!
//! Tensor shape implies the texture layout: the trailing dimension is the
//! channel count when present. Three-channel data has no sampleable wgpu
//! format, so it is padded to four channels on upload and stripped again
//! on read-back.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::context::{Context, GpuState};
use crate::error::{Error, Result};
use crate::tensor::{DType, Device, Tensor};

/// Texture dimensionality. `Rectangle` is kept for API parity with
/// pre-normalized-coordinate pipelines and maps onto a plain 2D texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TexTarget {
    D1,
    D2,
    D3,
    Rectangle,
}

/// Shared handle to a [`Texture`].
pub type TextureRef = Rc<RefCell<Texture>>;

/// How the sampled value reaches the shader, used for bind group layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SampleKind {
    Float { filterable: bool },
    Sint,
    Uint,
}

/// A GPU texture with known channel count and element type.
pub struct Texture {
    gpu: Arc<GpuState>,
    target: TexTarget,
    width: u32,
    height: u32,
    depth: u32,
    channels: usize,
    dtype: DType,
    format: wgpu::TextureFormat,
    raw: Option<wgpu::Texture>,
    render_target: bool,
}

fn texel_format(dtype: DType, channels: usize) -> Result<wgpu::TextureFormat> {
    let physical = if channels == 3 { 4 } else { channels };
    let format = match (dtype, physical) {
        (DType::Uint8, 1) => wgpu::TextureFormat::R8Unorm,
        (DType::Uint8, 2) => wgpu::TextureFormat::Rg8Unorm,
        (DType::Uint8, 4) => wgpu::TextureFormat::Rgba8Unorm,
        (DType::Float32, 1) => wgpu::TextureFormat::R32Float,
        (DType::Float32, 2) => wgpu::TextureFormat::Rg32Float,
        (DType::Float32, 4) => wgpu::TextureFormat::Rgba32Float,
        (DType::Int32, 1) => wgpu::TextureFormat::R32Sint,
        (DType::Int32, 2) => wgpu::TextureFormat::Rg32Sint,
        (DType::Int32, 4) => wgpu::TextureFormat::Rgba32Sint,
        (dtype, n) => {
            return Err(Error::unsupported(
                dtype,
                format!("no texture format for {n} channels of this dtype"),
            ))
        }
    };
    Ok(format)
}

impl Texture {
    /// Creates a 2D texture from a `[H, W]` or `[H, W, C]` tensor.
    pub fn from_tensor(ctx: &Context, data: &Tensor) -> Result<TextureRef> {
        Texture::from_tensor_with(ctx, data, TexTarget::D2)
    }

    /// Creates a texture of the given target from a tensor whose rank
    /// matches the dimensionality, with an optional trailing channel dim.
    pub fn from_tensor_with(ctx: &Context, data: &Tensor, target: TexTarget) -> Result<TextureRef> {
        let gpu = ctx.gpu();
        gpu.ensure_current()?;

        let shape = data.shape();
        let base_rank = match target {
            TexTarget::D1 => 1,
            TexTarget::D2 | TexTarget::Rectangle => 2,
            TexTarget::D3 => 3,
        };
        let (dims, channels): (&[usize], usize) = if shape.len() == base_rank {
            (shape, 1)
        } else if shape.len() == base_rank + 1 {
            (&shape[..base_rank], shape[base_rank])
        } else {
            return Err(Error::Shape(format!(
                "{target:?} texture takes rank {} or {} tensors, got shape {shape:?}",
                base_rank,
                base_rank + 1
            )));
        };
        if channels == 0 || channels > 4 {
            return Err(Error::Shape(format!(
                "texture channel count must be 1..=4, got {channels}"
            )));
        }

        let (width, height, depth) = match target {
            TexTarget::D1 => (dims[0] as u32, 1, 1),
            TexTarget::D2 | TexTarget::Rectangle => (dims[1] as u32, dims[0] as u32, 1),
            TexTarget::D3 => (dims[2] as u32, dims[1] as u32, dims[0] as u32),
        };

        let mut texture = Texture {
            gpu,
            target,
            width,
            height,
            depth,
            channels,
            dtype: data.dtype(),
            format: texel_format(data.dtype(), channels)?,
            raw: None,
            render_target: false,
        };
        texture.allocate();
        texture.upload(data)?;
        Ok(Rc::new(RefCell::new(texture)))
    }

    /// Allocates a zero-filled texture.
    pub fn empty(
        ctx: &Context,
        target: TexTarget,
        width: u32,
        height: u32,
        depth: u32,
        channels: usize,
        dtype: DType,
    ) -> Result<TextureRef> {
        let gpu = ctx.gpu();
        gpu.ensure_current()?;
        let mut texture = Texture {
            gpu,
            target,
            width: width.max(1),
            height: height.max(1),
            depth: depth.max(1),
            channels,
            dtype,
            format: texel_format(dtype, channels)?,
            raw: None,
            render_target: false,
        };
        texture.allocate();
        Ok(Rc::new(RefCell::new(texture)))
    }

    /// Internal constructor for framebuffer color attachments; sized
    /// lazily by [`Texture::resize`] at render time.
    pub(crate) fn for_render_target(
        gpu: Arc<GpuState>,
        format: wgpu::TextureFormat,
        dtype: DType,
        channels: usize,
    ) -> Texture {
        Texture {
            gpu,
            target: TexTarget::D2,
            width: 0,
            height: 0,
            depth: 1,
            channels,
            dtype,
            format,
            raw: None,
            render_target: true,
        }
    }

    pub(crate) fn resize(&mut self, width: u32, height: u32) {
        if self.width == width && self.height == height && self.raw.is_some() {
            return;
        }
        self.width = width;
        self.height = height;
        self.allocate();
    }

    fn allocate(&mut self) {
        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC;
        if self.render_target {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        let dimension = match self.target {
            TexTarget::D1 => wgpu::TextureDimension::D1,
            TexTarget::D2 | TexTarget::Rectangle => wgpu::TextureDimension::D2,
            TexTarget::D3 => wgpu::TextureDimension::D3,
        };
        self.raw = Some(self.gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("tenview texture"),
            size: wgpu::Extent3d {
                width: self.width.max(1),
                height: self.height.max(1),
                depth_or_array_layers: self.depth.max(1),
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension,
            format: self.format,
            usage,
            view_formats: &[],
        }));
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn target(&self) -> TexTarget {
        self.target
    }

    fn physical_channels(&self) -> usize {
        if self.channels == 3 {
            4
        } else {
            self.channels
        }
    }

    fn texel_bytes(&self) -> usize {
        self.physical_channels() * self.dtype.size_of()
    }

    pub(crate) fn sample_kind(&self) -> SampleKind {
        match self.format {
            wgpu::TextureFormat::R8Unorm
            | wgpu::TextureFormat::Rg8Unorm
            | wgpu::TextureFormat::Rgba8Unorm => SampleKind::Float { filterable: true },
            wgpu::TextureFormat::R32Float
            | wgpu::TextureFormat::Rg32Float
            | wgpu::TextureFormat::Rgba32Float => SampleKind::Float { filterable: false },
            wgpu::TextureFormat::R32Sint
            | wgpu::TextureFormat::Rg32Sint
            | wgpu::TextureFormat::Rgba32Sint => SampleKind::Sint,
            wgpu::TextureFormat::R32Uint => SampleKind::Uint,
            _ => SampleKind::Float { filterable: true },
        }
    }

    pub(crate) fn raw_wgpu(&self) -> Result<&wgpu::Texture> {
        self.raw
            .as_ref()
            .ok_or_else(|| Error::Gpu("texture was never allocated".into()))
    }

    pub(crate) fn view(&self) -> Result<wgpu::TextureView> {
        Ok(self
            .raw_wgpu()?
            .create_view(&wgpu::TextureViewDescriptor::default()))
    }

    /// Replaces the texture contents with a copy of `data`, which must
    /// match the shape the texture was created with.
    pub fn upload(&mut self, data: &Tensor) -> Result<()> {
        self.gpu.ensure_current()?;
        let expected = self.width as usize
            * self.height as usize
            * self.depth as usize
            * self.channels
            * self.dtype.size_of();
        if data.byte_len() != expected || data.dtype() != self.dtype {
            return Err(Error::Shape(format!(
                "texture upload expects {} bytes of {:?}, got {} of {:?}",
                expected,
                self.dtype,
                data.byte_len(),
                data.dtype()
            )));
        }

        let bytes = data.host_bytes()?;
        let bytes = if self.channels == 3 {
            pad_rgb_to_rgba(&bytes, self.dtype)
        } else {
            bytes
        };

        let bytes_per_row = self.width.max(1) * self.texel_bytes() as u32;
        self.gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: self.raw_wgpu()?,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(self.height.max(1)),
            },
            wgpu::Extent3d {
                width: self.width.max(1),
                height: self.height.max(1),
                depth_or_array_layers: self.depth.max(1),
            },
        );
        Ok(())
    }

    /// Reads the texture back into a host tensor shaped the same way the
    /// source tensor was.
    pub fn to_tensor(&self) -> Result<Tensor> {
        self.gpu.ensure_current()?;
        let texel = self.texel_bytes() as u32;
        let unpadded_row = self.width.max(1) * texel;
        let padded_row = unpadded_row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let rows = self.height.max(1) * self.depth.max(1);

        let staging = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tenview texture readback"),
            size: (padded_row * rows) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let mut encoder =
            self.gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("tenview texture readback encoder"),
                });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: self.raw_wgpu()?,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(self.height.max(1)),
                },
            },
            wgpu::Extent3d {
                width: self.width.max(1),
                height: self.height.max(1),
                depth_or_array_layers: self.depth.max(1),
            },
        );
        self.gpu.submit_wait(encoder)?;

        let padded = self.gpu.read_buffer(&staging, staging.size())?;
        let mut bytes = Vec::with_capacity((unpadded_row * rows) as usize);
        for row in 0..rows {
            let start = (row * padded_row) as usize;
            bytes.extend_from_slice(&padded[start..start + unpadded_row as usize]);
        }
        let bytes = if self.channels == 3 {
            strip_rgba_to_rgb(&bytes, self.dtype)
        } else {
            bytes
        };

        let mut shape = Vec::new();
        match self.target {
            TexTarget::D1 => shape.push(self.width as usize),
            TexTarget::D2 | TexTarget::Rectangle => {
                shape.extend([self.height as usize, self.width as usize])
            }
            TexTarget::D3 => shape.extend([
                self.depth as usize,
                self.height as usize,
                self.width as usize,
            ]),
        }
        if self.channels > 1 {
            shape.push(self.channels);
        }
        Ok(Tensor::from_bytes(self.dtype, &shape, bytes))
    }

    /// Reads the texture back, optionally keeping the result on the GPU.
    pub fn to_tensor_on(&self, device: Device) -> Result<Tensor> {
        let host = self.to_tensor()?;
        match device {
            Device::Host => Ok(host),
            Device::Gpu => {
                let bytes = host.host_bytes()?;
                let raw = self.gpu.upload_bytes(&bytes, wgpu::BufferUsages::COPY_SRC);
                Ok(Tensor::from_gpu_raw(
                    host.dtype(),
                    host.shape(),
                    raw,
                    self.gpu.clone(),
                ))
            }
        }
    }
}

fn pad_rgb_to_rgba(bytes: &[u8], dtype: DType) -> Vec<u8> {
    let elem = dtype.size_of();
    let texels = bytes.len() / (3 * elem);
    let mut out = Vec::with_capacity(texels * 4 * elem);
    let one: Vec<u8> = match dtype {
        DType::Uint8 => vec![255],
        DType::Float32 => 1.0f32.to_le_bytes().to_vec(),
        DType::Int32 => 1i32.to_le_bytes().to_vec(),
        DType::Float64 | DType::Int64 => vec![0; elem],
    };
    for texel in bytes.chunks_exact(3 * elem) {
        out.extend_from_slice(texel);
        out.extend_from_slice(&one);
    }
    out
}

fn strip_rgba_to_rgb(bytes: &[u8], dtype: DType) -> Vec<u8> {
    let elem = dtype.size_of();
    let mut out = Vec::with_capacity(bytes.len() / 4 * 3);
    for texel in bytes.chunks_exact(4 * elem) {
        out.extend_from_slice(&texel[..3 * elem]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    #[test]
    fn test_2d_round_trip() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();

        let data: Vec<u8> = (0..4 * 5 * 4).map(|v| v as u8).collect();
        let tensor = Tensor::from_vec(data.clone(), &[4, 5, 4]).unwrap();
        let texture = Texture::from_tensor(&ctx, &tensor).unwrap();
        {
            let texture = texture.borrow();
            assert_eq!(texture.width(), 5);
            assert_eq!(texture.height(), 4);
            assert_eq!(texture.channels(), 4);
        }
        let back = texture.borrow().to_tensor().unwrap();
        assert_eq!(back.shape(), &[4, 5, 4]);
        assert_eq!(back.to_vec::<u8>().unwrap(), data);
    }

    #[test]
    fn test_rgb_padding_round_trip() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();

        let data: Vec<u8> = (0..6 * 3).map(|v| v as u8).collect();
        let tensor = Tensor::from_vec(data.clone(), &[2, 3, 3]).unwrap();
        let texture = Texture::from_tensor(&ctx, &tensor).unwrap();
        let back = texture.borrow().to_tensor().unwrap();
        assert_eq!(back.shape(), &[2, 3, 3]);
        assert_eq!(back.to_vec::<u8>().unwrap(), data);
    }

    #[test]
    fn test_single_channel_float() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();

        let data: Vec<f32> = (0..8).map(|v| v as f32 * 0.5).collect();
        let tensor = Tensor::from_vec(data.clone(), &[2, 4]).unwrap();
        let texture = Texture::from_tensor(&ctx, &tensor).unwrap();
        let back = texture.borrow().to_tensor().unwrap();
        assert_eq!(back.shape(), &[2, 4]);
        assert_eq!(back.to_vec::<f32>().unwrap(), data);
    }

    #[test]
    fn test_unsupported_dtype() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();
        let tensor = Tensor::zeros(DType::Int64, &[2, 2]);
        assert!(matches!(
            Texture::from_tensor(&ctx, &tensor).map(|_| ()),
            Err(Error::UnsupportedType { .. })
        ));
    }
}
