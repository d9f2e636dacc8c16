//! Kernel launch wrappers and the cuBLAS strided-batched GEMM wrapper.
//!
//! Pointer-heavy kernels take a single by-value parameter block whose layout
//! is mirrored between the `.cu` source and a `#[repr(C)]` struct here;
//! device addresses travel as `u64`.

mod beam;
mod context;
mod decoding;
mod gemm;
mod generation;

pub use beam::{beam_search_step, gather_tree, BeamStepParams, GatherTreeParams, MAX_BEAM_WIDTH};
pub use context::{
    add_qkv_bias_rope, build_attention_mask, build_decoder_info, context_fmha, masked_softmax,
    write_kv_cache, ContextFmhaParams, KvWriteParams, QkvBiasRopeParams, FMHA_MAX_CONTEXT,
};
pub use decoding::{logit_prep, sample_top_kp, stop_criteria, LogitPrepParams, SampleParams};
pub use gemm::{
    AlgoCache, GemmAlgo, GemmKey, GemmScalar, MatmulWrapper, MatrixLayout, Op, StridedBatchedDesc,
};
pub use generation::{masked_mha, MaskedMhaParams};

use cudarc::driver::CudaDevice;
use cudarc::nvrtc::Ptx;
use std::sync::Arc;

use crate::dtype::DType;
use crate::Result;

/// Kernel name suffix for the activation dtype.
///
/// # Panics
/// Panics for dtypes no kernel is compiled for.
#[must_use]
pub(crate) fn kernel_suffix(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "f32",
        DType::F16 => "f16",
        DType::BF16 => "bf16",
        _ => panic!("No kernels compiled for dtype {dtype}"),
    }
}

/// Load a PTX module on first use and return the named function.
pub(crate) fn get_kernel(
    device: &Arc<CudaDevice>,
    ptx: &'static str,
    module: &'static str,
    names: &'static [&'static str],
    name: &str,
) -> Result<cudarc::driver::CudaFunction> {
    if !device.has_func(module, name) {
        device.load_ptx(Ptx::from_src(ptx), module, names)?;
    }
    Ok(device
        .get_func(module, name)
        .expect("function registered by load_ptx"))
}
