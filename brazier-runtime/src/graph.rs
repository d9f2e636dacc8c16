//! CUDA graph capture and replay for the decode step.
//!
//! Captures the GPU work of one engine generation step into a graph, then
//! replays it with near-zero CPU launch overhead. The graph is re-captured
//! each step (kernel parameters like the KV length change) but the existing
//! executable is updated in-place via `cuGraphExecUpdate_v2`, which is much
//! cheaper than full re-instantiation when the topology is unchanged. The
//! session keeps two executors and ping-pongs between them across steps.

#![allow(clippy::missing_panics_doc)]

use std::ptr;
use std::sync::Arc;

use cudarc::driver::sys::{
    self, CUgraph, CUgraphExec, CUgraphExecUpdateResult, CUgraphExecUpdateResultInfo,
    CUstreamCaptureMode,
};
use cudarc::driver::CudaDevice;

use brazier::error::Error;
use brazier::Result;

/// Check a raw CUDA driver result, converting non-success to our error type.
fn check(result: sys::CUresult, op: &str) -> Result<()> {
    if result == sys::cudaError_enum::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(Error::Driver(format!("{op} failed: {result:?}")))
    }
}

/// One capture/replay executor.
///
/// 1. [`begin_capture`](Self::begin_capture) starts recording on the
///    device's main stream.
/// 2. Run the engine step (all GPU ops are recorded, not executed).
/// 3. [`end_capture`](Self::end_capture) finalises the graph: first call
///    instantiates, later calls update in place, falling back to full
///    re-instantiation when the topology changed.
/// 4. [`launch`](Self::launch) replays the captured work.
pub struct CudaGraphExecutor {
    device: Arc<CudaDevice>,
    exec: Option<CUgraphExec>,
}

impl CudaGraphExecutor {
    /// Create an executor for the given device.
    #[must_use]
    pub fn new(device: &Arc<CudaDevice>) -> Self {
        Self {
            device: Arc::clone(device),
            exec: None,
        }
    }

    /// Whether an executable graph has been instantiated.
    #[must_use]
    pub fn has_instance(&self) -> bool {
        self.exec.is_some()
    }

    /// Begin capturing GPU work on the device's main stream.
    ///
    /// # Errors
    /// Returns an error if stream capture fails to start.
    pub fn begin_capture(&self) -> Result<()> {
        let stream = *self.device.cu_stream();
        let lib = unsafe { sys::lib() };
        check(
            unsafe {
                lib.cuStreamBeginCapture_v2(
                    stream,
                    CUstreamCaptureMode::CU_STREAM_CAPTURE_MODE_THREAD_LOCAL,
                )
            },
            "cuStreamBeginCapture_v2",
        )
    }

    /// End capture and instantiate or update the executable graph.
    ///
    /// # Errors
    /// Returns an error if capture, instantiation, or update fails.
    pub fn end_capture(&mut self) -> Result<()> {
        let stream = *self.device.cu_stream();
        let lib = unsafe { sys::lib() };

        let mut graph: CUgraph = ptr::null_mut();
        check(
            unsafe { lib.cuStreamEndCapture(stream, &raw mut graph) },
            "cuStreamEndCapture",
        )?;

        if let Some(exec) = self.exec {
            let mut info = CUgraphExecUpdateResultInfo {
                result: CUgraphExecUpdateResult::CU_GRAPH_EXEC_UPDATE_SUCCESS,
                errorFromNode: ptr::null_mut(),
                errorNode: ptr::null_mut(),
            };
            let result = unsafe { lib.cuGraphExecUpdate_v2(exec, graph, &raw mut info) };

            if result == sys::cudaError_enum::CUDA_SUCCESS
                && info.result == CUgraphExecUpdateResult::CU_GRAPH_EXEC_UPDATE_SUCCESS
            {
                unsafe { lib.cuGraphDestroy(graph) };
                return Ok(());
            }

            // Topology changed: drop the old executable and re-instantiate.
            unsafe { lib.cuGraphExecDestroy(exec) };
            self.exec = None;
        }

        let mut exec: CUgraphExec = ptr::null_mut();
        check(
            unsafe { lib.cuGraphInstantiateWithFlags(&raw mut exec, graph, 0) },
            "cuGraphInstantiateWithFlags",
        )?;
        unsafe { lib.cuGraphDestroy(graph) };
        self.exec = Some(exec);
        Ok(())
    }

    /// Replay the captured graph on the main stream.
    ///
    /// # Errors
    /// Returns an error if no graph has been captured or the launch fails.
    pub fn launch(&self) -> Result<()> {
        let exec = self
            .exec
            .ok_or_else(|| Error::Driver("no graph instantiated".into()))?;
        let stream = *self.device.cu_stream();
        let lib = unsafe { sys::lib() };
        check(unsafe { lib.cuGraphLaunch(exec, stream) }, "cuGraphLaunch")
    }
}

impl Drop for CudaGraphExecutor {
    fn drop(&mut self) {
        if let Some(exec) = self.exec.take() {
            let lib = unsafe { sys::lib() };
            unsafe { lib.cuGraphExecDestroy(exec) };
        }
    }
}
