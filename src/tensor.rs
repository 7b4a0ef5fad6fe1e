//! Externally owned numeric arrays shared with the GPU layer.
//!
//! A [`Tensor`] is the interop boundary of the crate: typed, contiguous
//! memory with a known shape that either lives on the host (a plain byte
//! vector) or on the GPU (a `wgpu::Buffer` owned by a context). Buffers
//! and textures are created *from* tensors (copy-on-upload, never taking
//! ownership of caller memory) and read back *into* tensors.

use std::sync::Arc;

use crate::context::{Context, GpuState};
use crate::error::{Error, Result};

/// Element types accepted at the interop boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Float32,
    Float64,
    Uint8,
    Int32,
    Int64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_of(self) -> usize {
        match self {
            DType::Uint8 => 1,
            DType::Float32 | DType::Int32 => 4,
            DType::Float64 | DType::Int64 => 8,
        }
    }
}

/// Where tensor memory resides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Host,
    Gpu,
}

/// Rust scalar types that map onto a [`DType`].
pub trait Element: bytemuck::Pod {
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::Float32;
}
impl Element for f64 {
    const DTYPE: DType = DType::Float64;
}
impl Element for u8 {
    const DTYPE: DType = DType::Uint8;
}
impl Element for i32 {
    const DTYPE: DType = DType::Int32;
}
impl Element for i64 {
    const DTYPE: DType = DType::Int64;
}

enum Storage {
    Host(Vec<u8>),
    Gpu {
        raw: wgpu::Buffer,
        gpu: Arc<GpuState>,
    },
}

/// A typed, contiguous numeric array on the host or the GPU.
///
/// Rank is at most 2 for buffer interop and at most 3 for texture
/// interop; the checks live at the operation that consumes the tensor.
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    storage: Storage,
}

impl Tensor {
    /// Wraps a host vector as a tensor of the given shape.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Result<Tensor> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(Error::Shape(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                numel,
                data.len()
            )));
        }
        Ok(Tensor {
            dtype: T::DTYPE,
            shape: shape.to_vec(),
            storage: Storage::Host(bytemuck::cast_slice(&data).to_vec()),
        })
    }

    /// Copies a host slice into a new tensor.
    pub fn from_slice<T: Element>(data: &[T], shape: &[usize]) -> Result<Tensor> {
        Tensor::from_vec(data.to_vec(), shape)
    }

    /// Allocates a zero-filled host tensor.
    pub fn zeros(dtype: DType, shape: &[usize]) -> Tensor {
        let numel: usize = shape.iter().product();
        Tensor {
            dtype,
            shape: shape.to_vec(),
            storage: Storage::Host(vec![0u8; numel * dtype.size_of()]),
        }
    }

    pub(crate) fn from_bytes(dtype: DType, shape: &[usize], bytes: Vec<u8>) -> Tensor {
        let numel: usize = shape.iter().product();
        debug_assert_eq!(numel * dtype.size_of(), bytes.len());
        Tensor {
            dtype,
            shape: shape.to_vec(),
            storage: Storage::Host(bytes),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Length of the leading dimension, or 1 for rank-0 tensors.
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Length of the second dimension, or 0 for scalar (rank-1) arrays.
    pub fn cols(&self) -> usize {
        self.shape.get(1).copied().unwrap_or(0)
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.numel() * self.dtype.size_of()
    }

    pub fn device(&self) -> Device {
        match self.storage {
            Storage::Host(_) => Device::Host,
            Storage::Gpu { .. } => Device::Gpu,
        }
    }

    /// Borrows host memory as a typed slice. Fails on GPU residency or a
    /// dtype mismatch.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        if self.dtype != T::DTYPE {
            return Err(Error::unsupported(
                self.dtype,
                format!("tensor holds {:?}", self.dtype),
            ));
        }
        match &self.storage {
            Storage::Host(bytes) => Ok(bytemuck::cast_slice(bytes)),
            Storage::Gpu { .. } => Err(Error::Shape(
                "cannot borrow a GPU-resident tensor; copy it to the host first".into(),
            )),
        }
    }

    /// Mutable variant of [`Tensor::as_slice`].
    pub fn as_slice_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        if self.dtype != T::DTYPE {
            return Err(Error::unsupported(
                self.dtype,
                format!("tensor holds {:?}", self.dtype),
            ));
        }
        match &mut self.storage {
            Storage::Host(bytes) => Ok(bytemuck::cast_slice_mut(bytes)),
            Storage::Gpu { .. } => Err(Error::Shape(
                "cannot borrow a GPU-resident tensor; copy it to the host first".into(),
            )),
        }
    }

    /// Copies the contents out as a host vector, downloading from the GPU
    /// when necessary (which requires the owning context to be current).
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if self.dtype != T::DTYPE {
            return Err(Error::unsupported(
                self.dtype,
                format!("tensor holds {:?}", self.dtype),
            ));
        }
        let bytes = self.host_bytes()?;
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }

    /// Raw bytes of the tensor on the host side, downloaded if GPU-resident.
    pub(crate) fn host_bytes(&self) -> Result<Vec<u8>> {
        match &self.storage {
            Storage::Host(bytes) => Ok(bytes.clone()),
            Storage::Gpu { raw, gpu } => {
                gpu.ensure_current()?;
                let mut bytes = gpu.read_buffer(raw, raw.size())?;
                bytes.truncate(self.byte_len());
                Ok(bytes)
            }
        }
    }

    pub(crate) fn from_gpu_raw(
        dtype: DType,
        shape: &[usize],
        raw: wgpu::Buffer,
        gpu: Arc<GpuState>,
    ) -> Tensor {
        Tensor {
            dtype,
            shape: shape.to_vec(),
            storage: Storage::Gpu { raw, gpu },
        }
    }

    pub(crate) fn raw_gpu(&self) -> Option<&wgpu::Buffer> {
        match &self.storage {
            Storage::Gpu { raw, .. } => Some(raw),
            Storage::Host(_) => None,
        }
    }

    /// Copies this tensor to the requested device. Uploads and downloads
    /// both require `ctx` to be current.
    pub fn to_device(&self, ctx: &Context, device: Device) -> Result<Tensor> {
        match device {
            Device::Host => Ok(Tensor::from_bytes(
                self.dtype,
                &self.shape,
                self.host_bytes()?,
            )),
            Device::Gpu => {
                let gpu = ctx.gpu();
                gpu.ensure_current()?;
                let bytes = self.host_bytes()?;
                let raw = gpu.upload_bytes(&bytes, wgpu::BufferUsages::COPY_SRC);
                Ok(Tensor {
                    dtype: self.dtype,
                    shape: self.shape.clone(),
                    storage: Storage::Gpu { raw, gpu },
                })
            }
        }
    }

    /// Reads the indices of a rank-1 integer tensor as `usize` values.
    /// Accepts Int32 and Int64, host- or GPU-resident.
    pub(crate) fn index_values(&self) -> Result<Vec<usize>> {
        if self.rank() != 1 {
            return Err(Error::Shape(format!(
                "index tensor must be rank 1, got shape {:?}",
                self.shape
            )));
        }
        let bytes = self.host_bytes()?;
        match self.dtype {
            DType::Int32 => Ok(bytemuck::pod_collect_to_vec::<u8, i32>(&bytes)
                .iter()
                .map(|&v| v as usize)
                .collect()),
            DType::Int64 => Ok(bytemuck::pod_collect_to_vec::<u8, i64>(&bytes)
                .iter()
                .map(|&v| v as usize)
                .collect()),
            other => Err(Error::unsupported(other, "index tensors must be Int32 or Int64")),
        }
    }

    /// Reads a tensor of at most 4 numeric components as f32 values,
    /// coercing from any supported dtype.
    pub(crate) fn to_f32_components(&self) -> Result<Vec<f32>> {
        let bytes = self.host_bytes()?;
        let values = match self.dtype {
            DType::Float32 => bytemuck::pod_collect_to_vec::<u8, f32>(&bytes),
            DType::Float64 => bytemuck::pod_collect_to_vec::<u8, f64>(&bytes)
                .iter()
                .map(|&v| v as f32)
                .collect(),
            DType::Uint8 => bytes.iter().map(|&v| v as f32).collect(),
            DType::Int32 => bytemuck::pod_collect_to_vec::<u8, i32>(&bytes)
                .iter()
                .map(|&v| v as f32)
                .collect(),
            DType::Int64 => bytemuck::pod_collect_to_vec::<u8, i64>(&bytes)
                .iter()
                .map(|&v| v as f32)
                .collect(),
        };
        Ok(values)
    }
}

impl Clone for Tensor {
    /// Clones the host copy of the tensor; GPU-resident tensors are
    /// downloaded first.
    ///
    /// # Panics
    ///
    /// Cloning a GPU-resident tensor requires the owning context to be
    /// current and panics otherwise. [`Tensor::to_device`] is the
    /// fallible way to copy in that situation.
    fn clone(&self) -> Self {
        Tensor::from_bytes(
            self.dtype,
            &self.shape,
            self.host_bytes().expect("tensor clone: download failed"),
        )
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("device", &self.device())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_round_trip() {
        let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        assert_eq!(t.dtype(), DType::Float32);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.rows(), 2);
        assert_eq!(t.cols(), 3);
        assert_eq!(t.device(), Device::Host);
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_shape_mismatch() {
        let err = Tensor::from_vec(vec![1i32, 2, 3], &[2, 2]).unwrap_err();
        assert!(matches!(err, crate::error::Error::Shape(_)));
    }

    #[test]
    fn test_dtype_mismatch() {
        let t = Tensor::from_vec(vec![1u8, 2, 3], &[3]).unwrap();
        assert!(t.as_slice::<f32>().is_err());
        assert_eq!(t.as_slice::<u8>().unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn test_scalar_array_has_zero_cols() {
        let t = Tensor::zeros(DType::Int64, &[7]);
        assert_eq!(t.cols(), 0);
        assert_eq!(t.rows(), 7);
        assert_eq!(t.byte_len(), 7 * 8);
    }

    #[test]
    fn test_clone_host_needs_no_context() {
        let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0], &[3]).unwrap();
        let c = t.clone();
        assert_eq!(c.shape(), t.shape());
        assert_eq!(c.device(), Device::Host);
        assert_eq!(c.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_f32_component_coercion() {
        let t = Tensor::from_vec(vec![1u8, 0, 1, 1], &[4]).unwrap();
        assert_eq!(t.to_f32_components().unwrap(), vec![1.0, 0.0, 1.0, 1.0]);
        let t = Tensor::from_vec(vec![1i64, 0, 1, 1], &[4]).unwrap();
        assert_eq!(t.to_f32_components().unwrap(), vec![1.0, 0.0, 1.0, 1.0]);
    }
}
