//! Launch wrappers for the beam-search step and the final tree gather.

#![allow(clippy::cast_possible_truncation, clippy::missing_panics_doc)]

use cudarc::driver::{CudaStream, DeviceRepr, LaunchAsync, LaunchConfig};

use super::{get_kernel, kernel_suffix};
use crate::cuda::CudaContext;
use crate::dtype::TensorDType;
use crate::Result;

const PTX: &str = include_str!(concat!(env!("OUT_DIR"), "/kernels/beam.ptx"));
const MODULE: &str = "beam";
const KERNEL_NAMES: &[&str] = &[
    "beam_search_step_f32",
    "beam_search_step_f16",
    "beam_search_step_bf16",
    "gather_tree",
];

/// Widest beam the kernels are sized for (`MAX_BEAMS` in `beam.cu`).
pub const MAX_BEAM_WIDTH: usize = 8;

/// Parameter block mirroring `BeamStepParams` in `beam.cu`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BeamStepParams {
    pub logits: u64,
    pub ids: u64,
    pub parent_ids: u64,
    pub new_tokens: u64,
    pub lengths: u64,
    pub finished: u64,
    pub cum_log_probs: u64,
    pub src_cache_indir: u64,
    pub tgt_cache_indir: u64,
    pub hyp_parent: u64,
    pub hyp_pos: u64,
    pub hyp_score: u64,
    pub hyp_count: u64,
    pub step: i32,
    pub input_length: i32,
    pub beam_width: i32,
    pub end_id: i32,
    pub diversity_rate: f32,
    pub length_penalty: f32,
    pub vocab_size: i32,
    pub vocab_size_padded: i32,
    pub max_seq_len: i32,
}

unsafe impl DeviceRepr for BeamStepParams {}

/// Parameter block mirroring `GatherTreeParams` in `beam.cu`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct GatherTreeParams {
    pub final_ids: u64,
    pub ids: u64,
    pub parent_ids: u64,
    pub lengths: u64,
    pub cum_log_probs: u64,
    pub hyp_parent: u64,
    pub hyp_pos: u64,
    pub hyp_score: u64,
    pub hyp_count: u64,
    pub input_length: i32,
    pub beam_width: i32,
    pub end_id: i32,
    pub length_penalty: f32,
    pub max_seq_len: i32,
}

unsafe impl DeviceRepr for GatherTreeParams {}

/// Launch one beam-search step for one slot on its stream. Single block.
///
/// # Errors
/// Returns an error if the launch fails.
pub fn beam_search_step<T: TensorDType>(
    ctx: &CudaContext,
    stream: &CudaStream,
    params: BeamStepParams,
) -> Result<()> {
    assert!(
        params.beam_width as usize <= MAX_BEAM_WIDTH,
        "beam width {} exceeds kernel limit {MAX_BEAM_WIDTH}",
        params.beam_width
    );
    let name = format!("beam_search_step_{}", kernel_suffix(T::DTYPE));
    let func = get_kernel(ctx.device(), PTX, MODULE, KERNEL_NAMES, &name)?;

    // 128 threads: the shared candidate pool holds a full top list per thread.
    let cfg = LaunchConfig {
        grid_dim: (1, 1, 1),
        block_dim: (128, 1, 1),
        shared_mem_bytes: 0,
    };
    unsafe {
        func.launch_on_stream(stream, cfg, (params,))?;
    }
    Ok(())
}

/// Launch the final best-beam reconstruction for one slot on its stream.
///
/// # Errors
/// Returns an error if the launch fails.
pub fn gather_tree(ctx: &CudaContext, stream: &CudaStream, params: GatherTreeParams) -> Result<()> {
    let func = get_kernel(ctx.device(), PTX, MODULE, KERNEL_NAMES, "gather_tree")?;

    let cfg = LaunchConfig {
        grid_dim: (1, 1, 1),
        block_dim: (32, 1, 1),
        shared_mem_bytes: 0,
    };
    unsafe {
        func.launch_on_stream(stream, cfg, (params,))?;
    }
    Ok(())
}
