//! GPU vertex and element buffers backed by tensors.
//!
//! Buffers are created from host or GPU tensors by copy; the caller keeps
//! ownership of its memory. Contents can be read back as tensors, edited
//! in place through a mapped scope, or patched row-wise with integer index
//! tensors. Every operation requires the owning context to be current.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::context::{Context, GpuState};
use crate::error::{Error, Result};
use crate::tensor::{DType, Device, Tensor};

/// What the buffer binds as during a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTarget {
    /// Per-vertex attribute data.
    Array,
    /// Face/element indices.
    Element,
}

/// Update-frequency hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Static,
    Dynamic,
}

/// Shared handle to a [`Buffer`] as stored in draw programs.
pub type BufferRef = Rc<RefCell<Buffer>>;

/// A GPU buffer with tensor-shaped contents (`rows` x `cols`, where a
/// `cols` of 0 marks a rank-1 array of scalars).
pub struct Buffer {
    gpu: Arc<GpuState>,
    target: BufferTarget,
    usage: BufferUsage,
    dtype: DType,
    rows: usize,
    cols: usize,
    normalize: bool,
    integer_attrib: bool,
    raw: Option<wgpu::Buffer>,
}

impl Buffer {
    /// Creates a dynamic array buffer holding a copy of `data`.
    pub fn from_tensor(ctx: &Context, data: &Tensor) -> Result<BufferRef> {
        Buffer::from_tensor_with(ctx, data, BufferTarget::Array, BufferUsage::Dynamic)
    }

    /// Creates a buffer with explicit target and usage.
    pub fn from_tensor_with(
        ctx: &Context,
        data: &Tensor,
        target: BufferTarget,
        usage: BufferUsage,
    ) -> Result<BufferRef> {
        let mut buffer = Buffer::unallocated(ctx.gpu(), target, usage);
        buffer.gpu.ensure_current()?;
        buffer.upload(data)?;
        Ok(Rc::new(RefCell::new(buffer)))
    }

    /// Allocates a zero-filled buffer of the given shape.
    pub fn empty(
        ctx: &Context,
        dtype: DType,
        rows: usize,
        cols: usize,
        target: BufferTarget,
        usage: BufferUsage,
    ) -> Result<BufferRef> {
        let shape: Vec<usize> = if cols == 0 { vec![rows] } else { vec![rows, cols] };
        Buffer::from_tensor_with(ctx, &Tensor::zeros(dtype, &shape), target, usage)
    }

    pub(crate) fn unallocated(
        gpu: Arc<GpuState>,
        target: BufferTarget,
        usage: BufferUsage,
    ) -> Buffer {
        Buffer {
            gpu,
            target,
            usage,
            dtype: DType::Float32,
            rows: 0,
            cols: 0,
            normalize: false,
            integer_attrib: false,
            raw: None,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Second dimension, 0 for rank-1 contents.
    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn target(&self) -> BufferTarget {
        self.target
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Whether integer attribute data is exposed to shaders as normalized
    /// floats in [0, 1].
    pub fn set_normalize(&mut self, normalize: bool) {
        self.normalize = normalize;
    }

    pub fn normalize(&self) -> bool {
        self.normalize
    }

    /// Whether integer attribute data keeps its integer type in shaders
    /// instead of being converted to float.
    pub fn set_integer_attrib(&mut self, integer_attrib: bool) {
        self.integer_attrib = integer_attrib;
    }

    pub fn integer_attrib(&self) -> bool {
        self.integer_attrib
    }

    fn wgpu_usage(&self) -> wgpu::BufferUsages {
        let base = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
        match self.target {
            BufferTarget::Array => base | wgpu::BufferUsages::VERTEX,
            BufferTarget::Element => base | wgpu::BufferUsages::INDEX,
        }
    }

    /// Replaces the buffer contents with a copy of `data`, reallocating
    /// when the byte size changes.
    pub fn upload(&mut self, data: &Tensor) -> Result<()> {
        self.gpu.ensure_current()?;
        if data.rank() > 2 {
            return Err(Error::Shape(format!(
                "buffers take rank 1 or 2 tensors, got shape {:?}",
                data.shape()
            )));
        }
        let bytes = data.host_bytes()?;
        let realloc = match &self.raw {
            Some(raw) => crate::context::pad4(bytes.len().max(4)) as u64 != raw.size(),
            None => true,
        };
        if realloc {
            self.raw = Some(self.gpu.upload_bytes(&bytes, self.wgpu_usage()));
        } else if let Some(raw) = &self.raw {
            self.gpu.write_bytes(raw, &bytes);
        }
        self.dtype = data.dtype();
        self.rows = data.rows();
        self.cols = data.cols();
        Ok(())
    }

    fn shape(&self) -> Vec<usize> {
        if self.cols == 0 {
            vec![self.rows]
        } else {
            vec![self.rows, self.cols]
        }
    }

    pub fn byte_len(&self) -> usize {
        self.rows * self.cols.max(1) * self.dtype.size_of()
    }

    pub(crate) fn row_byte_len(&self) -> usize {
        self.cols.max(1) * self.dtype.size_of()
    }

    fn raw(&self) -> Result<&wgpu::Buffer> {
        self.raw
            .as_ref()
            .ok_or_else(|| Error::Gpu("buffer was never uploaded".into()))
    }

    pub(crate) fn raw_wgpu(&self) -> Result<&wgpu::Buffer> {
        self.raw()
    }

    fn download(&self) -> Result<Vec<u8>> {
        self.gpu.ensure_current()?;
        let raw = self.raw()?;
        let mut bytes = self.gpu.read_buffer(raw, raw.size())?;
        bytes.truncate(self.byte_len());
        Ok(bytes)
    }

    /// Copies the whole buffer into a tensor on the requested device.
    pub fn to_tensor(&self, device: Device) -> Result<Tensor> {
        let bytes = self.download()?;
        match device {
            Device::Host => Ok(Tensor::from_bytes(self.dtype, &self.shape(), bytes)),
            Device::Gpu => {
                let raw = self.gpu.upload_bytes(&bytes, wgpu::BufferUsages::COPY_SRC);
                Ok(Tensor::from_gpu_raw(
                    self.dtype,
                    &self.shape(),
                    raw,
                    self.gpu.clone(),
                ))
            }
        }
    }

    /// Opens a mapped scope over the buffer contents. The returned guard
    /// exposes a host tensor for reading and writing; changes are written
    /// back to the GPU when the guard drops (or [`MappedTensor::unmap`] is
    /// called) and are visible to subsequent draws.
    pub fn as_tensor(&mut self) -> Result<MappedTensor<'_>> {
        let bytes = self.download()?;
        let tensor = Tensor::from_bytes(self.dtype, &self.shape(), bytes);
        Ok(MappedTensor {
            buffer: self,
            tensor,
        })
    }

    /// Gathers the given rows into a new tensor. `indices` must be a
    /// rank-1 Int32/Int64 tensor, host- or GPU-resident.
    pub fn read_rows(&self, indices: &Tensor, device: Device) -> Result<Tensor> {
        let indices = indices.index_values()?;
        let bytes = self.download()?;
        let row_len = self.row_byte_len();

        let mut out = Vec::with_capacity(indices.len() * row_len);
        for &row in &indices {
            if row >= self.rows {
                return Err(Error::Shape(format!(
                    "row index {} out of range for buffer with {} rows",
                    row, self.rows
                )));
            }
            out.extend_from_slice(&bytes[row * row_len..(row + 1) * row_len]);
        }

        let shape: Vec<usize> = if self.cols == 0 {
            vec![indices.len()]
        } else {
            vec![indices.len(), self.cols]
        };
        match device {
            Device::Host => Ok(Tensor::from_bytes(self.dtype, &shape, out)),
            Device::Gpu => {
                let raw = self.gpu.upload_bytes(&out, wgpu::BufferUsages::COPY_SRC);
                Ok(Tensor::from_gpu_raw(self.dtype, &shape, raw, self.gpu.clone()))
            }
        }
    }

    /// Scatters `values` rows into the buffer at the given row indices.
    pub fn write_rows(&mut self, indices: &Tensor, values: &Tensor) -> Result<()> {
        let indices = indices.index_values()?;
        if values.dtype() != self.dtype {
            return Err(Error::unsupported(
                values.dtype(),
                format!("buffer holds {:?}", self.dtype),
            ));
        }
        if values.rows() != indices.len() || values.cols() != self.cols {
            return Err(Error::Shape(format!(
                "expected {} rows of {} columns, got shape {:?}",
                indices.len(),
                self.cols,
                values.shape()
            )));
        }

        let mut bytes = self.download()?;
        let value_bytes = values.host_bytes()?;
        let row_len = self.row_byte_len();
        for (i, &row) in indices.iter().enumerate() {
            if row >= self.rows {
                return Err(Error::Shape(format!(
                    "row index {} out of range for buffer with {} rows",
                    row, self.rows
                )));
            }
            bytes[row * row_len..(row + 1) * row_len]
                .copy_from_slice(&value_bytes[i * row_len..(i + 1) * row_len]);
        }
        self.gpu.write_bytes(self.raw()?, &bytes);
        Ok(())
    }

    /// Vertex format for binding this buffer as the attribute the shader
    /// declares. Fails for dtypes wgpu cannot express as vertex input.
    pub(crate) fn vertex_format(&self) -> Result<wgpu::VertexFormat> {
        let cols = self.cols.max(1);
        let format = match (self.dtype, cols) {
            (DType::Float32, 1) => wgpu::VertexFormat::Float32,
            (DType::Float32, 2) => wgpu::VertexFormat::Float32x2,
            (DType::Float32, 3) => wgpu::VertexFormat::Float32x3,
            (DType::Float32, 4) => wgpu::VertexFormat::Float32x4,
            (DType::Int32, 1) => wgpu::VertexFormat::Sint32,
            (DType::Int32, 2) => wgpu::VertexFormat::Sint32x2,
            (DType::Int32, 3) => wgpu::VertexFormat::Sint32x3,
            (DType::Int32, 4) => wgpu::VertexFormat::Sint32x4,
            (DType::Uint8, 2) if self.normalize => wgpu::VertexFormat::Unorm8x2,
            (DType::Uint8, 4) if self.normalize => wgpu::VertexFormat::Unorm8x4,
            (DType::Uint8, 2) => wgpu::VertexFormat::Uint8x2,
            (DType::Uint8, 4) => wgpu::VertexFormat::Uint8x4,
            (DType::Uint8, n) => {
                return Err(Error::unsupported(
                    DType::Uint8,
                    format!("{n}-component u8 attributes must be padded to 2 or 4"),
                ))
            }
            (dtype, _) => {
                return Err(Error::unsupported(
                    dtype,
                    "no vertex attribute format for this dtype",
                ))
            }
        };
        Ok(format)
    }
}

/// Mapped-scope guard returned by [`Buffer::as_tensor`].
pub struct MappedTensor<'a> {
    buffer: &'a mut Buffer,
    tensor: Tensor,
}

impl MappedTensor<'_> {
    pub fn tensor(&mut self) -> &mut Tensor {
        &mut self.tensor
    }

    pub fn as_slice<T: crate::tensor::Element>(&self) -> Result<&[T]> {
        self.tensor.as_slice()
    }

    pub fn as_slice_mut<T: crate::tensor::Element>(&mut self) -> Result<&mut [T]> {
        self.tensor.as_slice_mut()
    }

    /// Writes changes back and closes the scope. Dropping the guard has
    /// the same effect.
    pub fn unmap(self) {}
}

impl Drop for MappedTensor<'_> {
    fn drop(&mut self) {
        if let (Ok(bytes), Some(raw)) = (self.tensor.host_bytes(), self.buffer.raw.as_ref()) {
            self.buffer.gpu.write_bytes(raw, &bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    #[test]
    fn test_tensor_round_trip() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();

        let data = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]).unwrap();
        let buffer = Buffer::from_tensor(&ctx, &data).unwrap();
        let buffer = buffer.borrow();
        assert_eq!(buffer.rows(), 3);
        assert_eq!(buffer.cols(), 2);
        assert_eq!(buffer.dtype(), DType::Float32);

        let back = buffer.to_tensor(Device::Host).unwrap();
        assert_eq!(back.shape(), &[3, 2]);
        assert_eq!(back.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let gpu_back = buffer.to_tensor(Device::Gpu).unwrap();
        assert_eq!(gpu_back.device(), Device::Gpu);
        assert_eq!(gpu_back.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_rank1_round_trip() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();

        let data = Tensor::from_vec(vec![7u8, 8, 9], &[3]).unwrap();
        let buffer = Buffer::from_tensor(&ctx, &data).unwrap();
        let back = buffer.borrow().to_tensor(Device::Host).unwrap();
        assert_eq!(back.shape(), &[3]);
        assert_eq!(back.to_vec::<u8>().unwrap(), vec![7, 8, 9]);
    }

    #[test]
    fn test_rejects_rank3() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();
        let data = Tensor::zeros(DType::Float32, &[2, 2, 2]);
        assert!(matches!(
            Buffer::from_tensor(&ctx, &data).map(|_| ()),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn test_requires_current() {
        let Some(ctx) = test_context() else { return };
        let data = Tensor::zeros(DType::Float32, &[4, 3]);
        assert!(matches!(
            Buffer::from_tensor(&ctx, &data).map(|_| ()),
            Err(Error::NotCurrent)
        ));
    }

    #[test]
    fn test_mapped_scope_writes_back() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();

        let data = Tensor::from_vec(vec![0.0f32; 6], &[3, 2]).unwrap();
        let buffer = Buffer::from_tensor(&ctx, &data).unwrap();
        {
            let mut buffer = buffer.borrow_mut();
            let mut mapped = buffer.as_tensor().unwrap();
            let slice = mapped.as_slice_mut::<f32>().unwrap();
            for (i, v) in slice.iter_mut().enumerate() {
                *v = i as f32;
            }
        }
        let back = buffer.borrow().to_tensor(Device::Host).unwrap();
        assert_eq!(back.to_vec::<f32>().unwrap(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_indexed_read_write() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();

        let data =
            Tensor::from_vec((0..12).map(|v| v as f32).collect::<Vec<_>>(), &[4, 3]).unwrap();
        let buffer = Buffer::from_tensor(&ctx, &data).unwrap();

        let indices = Tensor::from_vec(vec![3i64, 0], &[2]).unwrap();
        let picked = buffer.borrow().read_rows(&indices, Device::Host).unwrap();
        assert_eq!(picked.shape(), &[2, 3]);
        assert_eq!(
            picked.to_vec::<f32>().unwrap(),
            vec![9.0, 10.0, 11.0, 0.0, 1.0, 2.0]
        );

        let gpu_indices = indices.to_device(&ctx, Device::Gpu).unwrap();
        let values = Tensor::from_vec(vec![-1.0f32; 6], &[2, 3]).unwrap();
        buffer.borrow_mut().write_rows(&gpu_indices, &values).unwrap();

        let back = buffer.borrow().to_tensor(Device::Host).unwrap();
        let v = back.to_vec::<f32>().unwrap();
        assert_eq!(&v[9..12], &[-1.0, -1.0, -1.0]);
        assert_eq!(&v[0..3], &[-1.0, -1.0, -1.0]);
        assert_eq!(&v[3..6], &[3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_out_of_range_index() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();

        let data = Tensor::zeros(DType::Float32, &[2, 3]);
        let buffer = Buffer::from_tensor(&ctx, &data).unwrap();
        let indices = Tensor::from_vec(vec![5i32], &[1]).unwrap();
        assert!(matches!(
            buffer.borrow().read_rows(&indices, Device::Host),
            Err(Error::Shape(_))
        ));
    }
}
