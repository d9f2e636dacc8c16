//! Stream and event primitives for cross-stream ordering.
//!
//! The decoder batch runs every slot on its own stream and joins them back
//! onto the main stream with events. cudarc's safe API covers stream
//! creation and kernel launch; event record/wait, stream-ordered memcpy and
//! memset, and pinned host memory go through the raw driver API with the
//! same `check()` wrapper used for graph capture.

#![allow(clippy::missing_panics_doc)]

use std::ptr;
use std::sync::Arc;

use cudarc::driver::sys::{self, CUevent, CUstream};
use cudarc::driver::{CudaDevice, CudaStream};

use crate::error::Error;
use crate::Result;

/// Check a raw CUDA driver result, converting non-success to our error type.
pub(crate) fn check(result: sys::CUresult, op: &str) -> Result<()> {
    if result == sys::cudaError_enum::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(Error::Driver(format!("{op} failed: {result:?}")))
    }
}

/// Raw stream handle of a forked cudarc stream.
#[must_use]
pub fn raw_stream(stream: &CudaStream) -> CUstream {
    stream.stream
}

/// Raw handle of the device's default stream.
#[must_use]
pub fn default_stream(device: &Arc<CudaDevice>) -> CUstream {
    *device.cu_stream()
}

/// A CUDA event used for cross-stream ordering and the per-step join barrier.
///
/// Created with timing disabled; the decoder only needs ordering semantics.
pub struct CudaEvent {
    event: CUevent,
    _device: Arc<CudaDevice>,
}

impl CudaEvent {
    /// Create a new event on the given device.
    ///
    /// # Errors
    /// Returns an error if event creation fails.
    pub fn new(device: &Arc<CudaDevice>) -> Result<Self> {
        let lib = unsafe { sys::lib() };
        let mut event: CUevent = ptr::null_mut();
        check(
            unsafe {
                lib.cuEventCreate(
                    &raw mut event,
                    sys::CUevent_flags::CU_EVENT_DISABLE_TIMING as u32,
                )
            },
            "cuEventCreate",
        )?;
        Ok(Self {
            event,
            _device: Arc::clone(device),
        })
    }

    /// Record this event on `stream`.
    ///
    /// # Errors
    /// Returns an error if the record fails.
    pub fn record(&self, stream: CUstream) -> Result<()> {
        let lib = unsafe { sys::lib() };
        check(
            unsafe { lib.cuEventRecord(self.event, stream) },
            "cuEventRecord",
        )
    }

    /// Make `stream` wait until this event's last recorded work completes.
    ///
    /// # Errors
    /// Returns an error if the wait enqueue fails.
    pub fn wait(&self, stream: CUstream) -> Result<()> {
        let lib = unsafe { sys::lib() };
        check(
            unsafe { lib.cuStreamWaitEvent(stream, self.event, 0) },
            "cuStreamWaitEvent",
        )
    }

    /// Block the host until this event's last recorded work completes.
    ///
    /// This is the only permitted host suspension point inside a decode step.
    ///
    /// # Errors
    /// Returns an error if synchronization fails.
    pub fn synchronize(&self) -> Result<()> {
        let lib = unsafe { sys::lib() };
        check(
            unsafe { lib.cuEventSynchronize(self.event) },
            "cuEventSynchronize",
        )
    }
}

impl Drop for CudaEvent {
    fn drop(&mut self) {
        let lib = unsafe { sys::lib() };
        unsafe { lib.cuEventDestroy_v2(self.event) };
    }
}

// Events are opaque handles tied to the device, not to a thread.
unsafe impl Send for CudaEvent {}
unsafe impl Sync for CudaEvent {}

/// Asynchronous device-to-device copy on a specific stream.
///
/// `dst` and `src` are raw device addresses; `bytes` is the copy size.
///
/// # Errors
/// Returns an error if the copy enqueue fails.
pub fn memcpy_dtod_async(dst: u64, src: u64, bytes: usize, stream: CUstream) -> Result<()> {
    let lib = unsafe { sys::lib() };
    check(
        unsafe { lib.cuMemcpyDtoDAsync_v2(dst, src, bytes, stream) },
        "cuMemcpyDtoDAsync_v2",
    )
}

/// Asynchronous 32-bit fill on a specific stream.
///
/// Fills `count` 32-bit elements starting at device address `dst` with the
/// bit pattern `value`. Used for end-id fills, length fills, and the
/// negative-infinity fill of beam log-probabilities.
///
/// # Errors
/// Returns an error if the memset enqueue fails.
pub fn memset_d32_async(dst: u64, value: u32, count: usize, stream: CUstream) -> Result<()> {
    let lib = unsafe { sys::lib() };
    check(
        unsafe { lib.cuMemsetD32Async(dst, value, count, stream) },
        "cuMemsetD32Async",
    )
}

/// Asynchronous byte fill on a specific stream.
///
/// # Errors
/// Returns an error if the memset enqueue fails.
pub fn memset_d8_async(dst: u64, value: u8, bytes: usize, stream: CUstream) -> Result<()> {
    let lib = unsafe { sys::lib() };
    check(
        unsafe { lib.cuMemsetD8Async(dst, value, bytes, stream) },
        "cuMemsetD8Async",
    )
}

/// Page-locked host memory that is also mapped into the device address space.
///
/// The finished-beam counters live here: slot-stream kernels write through
/// the device mapping, and after the stop-event synchronise the host reads
/// the values directly without a device-to-host copy.
pub struct PinnedBuffer<T: Copy + Default> {
    host_ptr: *mut T,
    device_ptr: u64,
    len: usize,
    _device: Arc<CudaDevice>,
}

impl<T: Copy + Default> PinnedBuffer<T> {
    /// Allocate `len` elements of device-mapped pinned host memory, zeroed.
    ///
    /// # Errors
    /// Returns an error if the allocation or device mapping fails.
    pub fn new(device: &Arc<CudaDevice>, len: usize) -> Result<Self> {
        let lib = unsafe { sys::lib() };
        let bytes = len * std::mem::size_of::<T>();
        let mut host_ptr: *mut std::ffi::c_void = ptr::null_mut();
        check(
            unsafe {
                lib.cuMemHostAlloc(
                    &raw mut host_ptr,
                    bytes,
                    sys::CU_MEMHOSTALLOC_DEVICEMAP | sys::CU_MEMHOSTALLOC_PORTABLE,
                )
            },
            "cuMemHostAlloc",
        )?;
        let mut device_ptr: sys::CUdeviceptr = 0;
        check(
            unsafe { lib.cuMemHostGetDevicePointer_v2(&raw mut device_ptr, host_ptr, 0) },
            "cuMemHostGetDevicePointer_v2",
        )?;

        let host_ptr = host_ptr.cast::<T>();
        for i in 0..len {
            unsafe { host_ptr.add(i).write(T::default()) };
        }

        Ok(Self {
            host_ptr,
            device_ptr,
            len,
            _device: Arc::clone(device),
        })
    }

    /// Device address of the mapping (kernels write through this).
    #[must_use]
    pub fn device_ptr(&self) -> u64 {
        self.device_ptr
    }

    /// Device address of element `idx`.
    ///
    /// # Panics
    /// Panics if `idx >= len`.
    #[must_use]
    pub fn device_ptr_at(&self, idx: usize) -> u64 {
        assert!(idx < self.len, "pinned index {idx} out of bounds {}", self.len);
        self.device_ptr + (idx * std::mem::size_of::<T>()) as u64
    }

    /// Read element `idx` on the host.
    ///
    /// Only valid after the work writing it has been synchronised (the
    /// decoder's stop event).
    ///
    /// # Panics
    /// Panics if `idx >= len`.
    #[must_use]
    pub fn read(&self, idx: usize) -> T {
        assert!(idx < self.len, "pinned index {idx} out of bounds {}", self.len);
        unsafe { self.host_ptr.add(idx).read_volatile() }
    }

    /// Write element `idx` from the host.
    ///
    /// # Panics
    /// Panics if `idx >= len`.
    pub fn write(&mut self, idx: usize, value: T) {
        assert!(idx < self.len, "pinned index {idx} out of bounds {}", self.len);
        unsafe { self.host_ptr.add(idx).write_volatile(value) };
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T: Copy + Default> Drop for PinnedBuffer<T> {
    fn drop(&mut self) {
        let lib = unsafe { sys::lib() };
        unsafe { lib.cuMemFreeHost(self.host_ptr.cast()) };
    }
}

unsafe impl<T: Copy + Default> Send for PinnedBuffer<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cuda::CudaContext;

    #[test]
    fn test_event_record_wait_synchronize() {
        let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
        let device = ctx.device();
        let event = CudaEvent::new(device).unwrap();

        let main = default_stream(device);
        event.record(main).unwrap();
        event.synchronize().unwrap();

        let side = device.fork_default_stream().unwrap();
        event.wait(raw_stream(&side)).unwrap();
        ctx.synchronize().unwrap();
    }

    #[test]
    fn test_pinned_buffer_host_roundtrip() {
        let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
        let mut buf = PinnedBuffer::<i32>::new(ctx.device(), 4).unwrap();

        assert_eq!(buf.len(), 4);
        for i in 0..4 {
            assert_eq!(buf.read(i), 0);
        }
        buf.write(2, 7);
        assert_eq!(buf.read(2), 7);
        assert_ne!(buf.device_ptr_at(1), buf.device_ptr_at(0));
    }

    #[test]
    fn test_memset_d32_fills_tensor() {
        use crate::cuda::CudaTensor;
        use cudarc::driver::DevicePtr;

        let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
        let t = CudaTensor::<i32>::zeros(&ctx, &[8]).unwrap();
        let addr = *t.cuda_slice().device_ptr();
        memset_d32_async(addr, 50256, 8, default_stream(ctx.device())).unwrap();
        ctx.synchronize().unwrap();
        assert_eq!(t.to_vec().unwrap(), vec![50256; 8]);
    }
}
