//! CUDA context management

use cudarc::cublas::CudaBlas;
use cudarc::driver::CudaDevice;
use std::sync::Arc;

use crate::Result;

/// Manages the CUDA device and associated resources (cuBLAS handle, etc.)
#[derive(Clone)]
pub struct CudaContext {
    device: Arc<CudaDevice>,
    blas: Arc<CudaBlas>,
    sm_version: i32,
}

impl CudaContext {
    /// Create a new CUDA context for the specified device ordinal
    ///
    /// # Errors
    /// Returns an error if CUDA device initialization fails
    pub fn new(ordinal: usize) -> Result<Self> {
        let device = CudaDevice::new(ordinal)?;
        let blas = CudaBlas::new(device.clone())?;
        let major = device.attribute(
            cudarc::driver::sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
        )?;
        let minor = device.attribute(
            cudarc::driver::sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
        )?;
        Ok(Self {
            device,
            blas: Arc::new(blas),
            sm_version: major * 10 + minor,
        })
    }

    /// Get a reference to the underlying CUDA device
    #[must_use]
    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    /// Get a reference to the cuBLAS handle
    #[must_use]
    pub fn blas(&self) -> &Arc<CudaBlas> {
        &self.blas
    }

    /// SM version of the device, e.g. 80 for A100, 89 for L4.
    #[must_use]
    pub fn sm_version(&self) -> i32 {
        self.sm_version
    }

    /// Number of streaming multiprocessors on the device.
    ///
    /// # Errors
    /// Returns an error if the attribute query fails
    pub fn multi_processor_count(&self) -> Result<i32> {
        Ok(self.device.attribute(
            cudarc::driver::sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT,
        )?)
    }

    /// Synchronize the CUDA device (wait for all operations to complete)
    ///
    /// # Errors
    /// Returns an error if synchronization fails
    pub fn synchronize(&self) -> Result<()> {
        self.device.synchronize()?;
        Ok(())
    }
}
