//! Device tensor with zero-copy sub-slice views.
//!
//! The decoder carves per-slot views out of the joint decoding tensors along
//! dimension 0. Views share the backing allocation via `Arc`; kernels write
//! through raw device addresses, so a write through a slot view is visible
//! in the joint tensor without any copy. Host-side mutation goes through the
//! same raw-address path (stream-ordered memsets and copies).

#![allow(clippy::cast_possible_truncation, clippy::missing_panics_doc)]

use std::sync::Arc;

use cudarc::driver::{CudaSlice, CudaView, DevicePtr, DeviceRepr, DeviceSlice, ValidAsZeroBits};

use crate::cuda::CudaContext;
use crate::dtype::TensorDType;
use crate::Result;

/// A tensor stored on a CUDA GPU.
///
/// Owns its GPU memory via `Arc`, enabling zero-copy reshape and sub-slice
/// views. The element type is encoded in the type parameter, preventing
/// accidental mixing of f32 and f16 tensors.
pub struct CudaTensor<T: TensorDType> {
    data: Arc<CudaSlice<T>>,
    /// Offset into `data` where this tensor's elements begin, in elements.
    offset: usize,
    shape: Vec<usize>,
    ctx: CudaContext,
}

impl<T: TensorDType> Clone for CudaTensor<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            offset: self.offset,
            shape: self.shape.clone(),
            ctx: self.ctx.clone(),
        }
    }
}

impl<T: TensorDType + DeviceRepr> CudaTensor<T> {
    /// Create a new tensor on the GPU from host data
    ///
    /// # Errors
    /// Returns an error if GPU memory allocation or copy fails
    pub fn from_slice(ctx: &CudaContext, shape: &[usize], data: &[T]) -> Result<Self> {
        let numel: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            numel,
            "Data length {} doesn't match shape {:?} (numel={})",
            data.len(),
            shape,
            numel
        );

        let data = ctx.device().htod_sync_copy(data)?;
        Ok(Self {
            data: Arc::new(data),
            offset: 0,
            shape: shape.to_vec(),
            ctx: ctx.clone(),
        })
    }

    /// Create an uninitialized tensor on the GPU
    ///
    /// # Safety
    /// The tensor contents are uninitialized. Reading before writing is
    /// undefined behavior.
    ///
    /// # Errors
    /// Returns an error if GPU memory allocation fails
    pub unsafe fn uninit(ctx: &CudaContext, shape: &[usize]) -> Result<Self> {
        let numel: usize = shape.iter().product();
        let data = ctx.device().alloc::<T>(numel)?;
        Ok(Self {
            data: Arc::new(data),
            offset: 0,
            shape: shape.to_vec(),
            ctx: ctx.clone(),
        })
    }

    /// Create a tensor filled with zeros
    ///
    /// # Errors
    /// Returns an error if GPU memory allocation fails
    pub fn zeros(ctx: &CudaContext, shape: &[usize]) -> Result<Self>
    where
        T: ValidAsZeroBits,
    {
        let numel: usize = shape.iter().product();
        let data = ctx.device().alloc_zeros::<T>(numel)?;
        Ok(Self {
            data: Arc::new(data),
            offset: 0,
            shape: shape.to_vec(),
            ctx: ctx.clone(),
        })
    }

    /// Copy tensor data back to the host
    ///
    /// # Errors
    /// Returns an error if the device-to-host copy fails
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let view = self.data.slice(self.offset..self.offset + self.numel());
        let data = self.ctx.device().dtoh_sync_copy(&view)?;
        Ok(data)
    }

    /// Get the CUDA context this tensor belongs to
    #[must_use]
    pub fn context(&self) -> &CudaContext {
        &self.ctx
    }

    /// Shape of the tensor
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total number of elements
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// The underlying CUDA view for this tensor's region (zero-cost).
    #[must_use]
    pub fn cuda_slice(&self) -> CudaView<'_, T> {
        self.data.slice(self.offset..self.offset + self.numel())
    }

    /// Mutable reference to the underlying CUDA slice.
    ///
    /// Only valid for tensors that exclusively own their full allocation
    /// (scratch buffers). Joint/slot views share storage and must be written
    /// through raw device addresses instead.
    ///
    /// # Panics
    /// Panics if the tensor is a shared or offset view.
    pub fn cuda_slice_mut(&mut self) -> &mut CudaSlice<T> {
        assert_eq!(self.offset, 0, "mutable access requires a full-allocation tensor");
        Arc::get_mut(&mut self.data)
            .expect("mutable access requires exclusive ownership of the allocation")
    }

    /// Raw device address of the first element.
    ///
    /// Writes through this address alias every view sharing the allocation;
    /// the caller is responsible for stream ordering.
    #[must_use]
    pub fn device_ptr(&self) -> u64 {
        let view = self.data.slice(self.offset..self.offset + self.numel());
        *view.device_ptr()
    }

    /// Raw device address of element `offset_elems` past the start.
    ///
    /// # Panics
    /// Panics if the offset is out of bounds.
    #[must_use]
    pub fn device_ptr_at(&self, offset_elems: usize) -> u64 {
        assert!(
            offset_elems <= self.numel(),
            "offset {offset_elems} out of bounds for {} elements",
            self.numel()
        );
        self.device_ptr() + (offset_elems * std::mem::size_of::<T>()) as u64
    }

    /// Reshape the tensor to a new shape with the same number of elements.
    ///
    /// Zero-copy — the returned tensor shares the same GPU memory via `Arc`.
    ///
    /// # Panics
    /// Panics if the new shape has a different number of elements
    #[must_use]
    pub fn reshape(&self, new_shape: &[usize]) -> Self {
        let new_numel: usize = new_shape.iter().product();
        assert_eq!(
            self.numel(),
            new_numel,
            "Cannot reshape tensor of {} elements to shape {:?} ({} elements)",
            self.numel(),
            new_shape,
            new_numel
        );

        Self {
            data: Arc::clone(&self.data),
            offset: self.offset,
            shape: new_shape.to_vec(),
            ctx: self.ctx.clone(),
        }
    }

    /// Create a zero-copy sub-slice view of this tensor.
    ///
    /// The returned tensor shares the same GPU allocation and starts at
    /// element `offset_elems` with the given `shape`.
    ///
    /// # Panics
    /// Panics if `offset_elems + numel(shape)` exceeds the backing allocation.
    #[must_use]
    pub fn slice_view(&self, offset_elems: usize, shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();
        let new_offset = self.offset + offset_elems;
        assert!(
            new_offset + numel <= self.data.len(),
            "slice_view out of bounds: offset {} + numel {} > allocation {}",
            new_offset,
            numel,
            self.data.len(),
        );

        Self {
            data: Arc::clone(&self.data),
            offset: new_offset,
            shape: shape.to_vec(),
            ctx: self.ctx.clone(),
        }
    }

    /// View of row `idx` along dimension 0 (shape loses the leading dim).
    ///
    /// This is how per-slot views are carved out of the joint tensors: the
    /// slices for distinct `idx` never overlap.
    ///
    /// # Panics
    /// Panics if `idx` is out of bounds or the tensor is 0-dimensional.
    #[must_use]
    pub fn index_dim0(&self, idx: usize) -> Self {
        assert!(!self.shape.is_empty(), "cannot index a 0-d tensor");
        assert!(
            idx < self.shape[0],
            "index {idx} out of bounds for dim 0 of size {}",
            self.shape[0]
        );
        let inner: usize = self.shape[1..].iter().product();
        self.slice_view(idx * inner, &self.shape[1..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cuda::CudaContext;

    #[test]
    fn test_from_slice_roundtrip() {
        let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
        let t = CudaTensor::from_slice(&ctx, &[2, 3], &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.numel(), 6);
        assert_eq!(t.to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_index_dim0_is_disjoint() {
        let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
        let t = CudaTensor::from_slice(&ctx, &[2, 3], &[0i32, 1, 2, 10, 11, 12]).unwrap();

        let row0 = t.index_dim0(0);
        let row1 = t.index_dim0(1);
        assert_eq!(row0.shape(), &[3]);
        assert_eq!(row0.to_vec().unwrap(), vec![0, 1, 2]);
        assert_eq!(row1.to_vec().unwrap(), vec![10, 11, 12]);
        assert_eq!(
            row1.device_ptr() - row0.device_ptr(),
            3 * std::mem::size_of::<i32>() as u64
        );
    }

    #[test]
    fn test_view_aliases_parent() {
        use crate::cuda::stream::{default_stream, memset_d32_async};

        let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
        let t = CudaTensor::<i32>::zeros(&ctx, &[4]).unwrap();
        let view = t.slice_view(2, &[2]);

        memset_d32_async(view.device_ptr(), 9, 2, default_stream(ctx.device())).unwrap();
        ctx.synchronize().unwrap();
        assert_eq!(t.to_vec().unwrap(), vec![0, 0, 9, 9]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_slice_view_out_of_bounds_panics() {
        let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
        let t = CudaTensor::<f32>::zeros(&ctx, &[4]).unwrap();
        let _ = t.slice_view(2, &[4]);
    }
}
