//! Launch wrappers for the per-slot decode kernels.
//!
//! All launches go onto the slot's stream; nothing here blocks the host.

#![allow(clippy::cast_possible_truncation, clippy::missing_panics_doc)]

use cudarc::driver::{CudaStream, DeviceRepr, LaunchAsync, LaunchConfig};

use super::{get_kernel, kernel_suffix};
use crate::cuda::CudaContext;
use crate::dtype::TensorDType;
use crate::Result;

const PTX: &str = include_str!(concat!(env!("OUT_DIR"), "/kernels/decode_step.ptx"));
const MODULE: &str = "decode_step";
const KERNEL_NAMES: &[&str] = &[
    "logit_prep_f32",
    "logit_prep_f16",
    "logit_prep_bf16",
    "sample_top_kp_f32",
    "sample_top_kp_f16",
    "sample_top_kp_bf16",
    "stop_criteria",
];

/// Parameter block for the logit-preparation kernel. Field order and types
/// mirror `LogitPrepParams` in `decode_step.cu`; device addresses are `u64`
/// (0 for absent optional buffers).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LogitPrepParams {
    pub logits: u64,
    pub ids: u64,
    pub lengths: u64,
    pub embedding_bias: u64,
    pub bad_words: u64,
    pub finished: u64,
    pub bad_words_len: i32,
    pub step: i32,
    pub min_length: i32,
    pub end_id: i32,
    pub temperature: f32,
    pub repetition_penalty: f32,
    pub presence_penalty: f32,
    pub vocab_size: i32,
    pub vocab_size_padded: i32,
    pub max_seq_len: i32,
}

unsafe impl DeviceRepr for LogitPrepParams {}

/// Parameter block for the top-k/top-p sampling kernel; mirrors
/// `SampleParams` in `decode_step.cu`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SampleParams {
    pub logits: u64,
    pub ids: u64,
    pub new_tokens: u64,
    pub lengths: u64,
    pub finished: u64,
    pub cum_log_probs: u64,
    pub runtime_top_p: u64,
    pub rng_state: u64,
    pub top_k: i32,
    pub top_p_initial: f32,
    pub top_p_decay: f32,
    pub top_p_min: f32,
    pub top_p_reset_id: i32,
    pub end_id: i32,
    pub vocab_size: i32,
    pub vocab_size_padded: i32,
    pub max_seq_len: i32,
}

unsafe impl DeviceRepr for SampleParams {}

/// Launch logit preparation for one slot on its stream.
///
/// # Errors
/// Returns an error if the launch fails.
pub fn logit_prep<T: TensorDType>(
    ctx: &CudaContext,
    stream: &CudaStream,
    params: LogitPrepParams,
    beam_width: usize,
) -> Result<()> {
    let name = format!("logit_prep_{}", kernel_suffix(T::DTYPE));
    let func = get_kernel(ctx.device(), PTX, MODULE, KERNEL_NAMES, &name)?;

    let threads = 256;
    let blocks = (params.vocab_size_padded as usize).div_ceil(threads);
    let cfg = LaunchConfig {
        grid_dim: (blocks as u32, beam_width as u32, 1),
        block_dim: (threads as u32, 1, 1),
        shared_mem_bytes: 0,
    };
    unsafe {
        func.launch_on_stream(stream, cfg, (params,))?;
    }
    Ok(())
}

/// Launch top-k/top-p sampling for one slot on its stream. Single block;
/// advances the slot's RNG exactly once.
///
/// # Errors
/// Returns an error if the launch fails.
pub fn sample_top_kp<T: TensorDType>(
    ctx: &CudaContext,
    stream: &CudaStream,
    params: SampleParams,
) -> Result<()> {
    let name = format!("sample_top_kp_{}", kernel_suffix(T::DTYPE));
    let func = get_kernel(ctx.device(), PTX, MODULE, KERNEL_NAMES, &name)?;

    let cfg = LaunchConfig {
        grid_dim: (1, 1, 1),
        block_dim: (256, 1, 1),
        shared_mem_bytes: 0,
    };
    unsafe {
        func.launch_on_stream(stream, cfg, (params,))?;
    }
    Ok(())
}

/// Launch the termination-criteria kernel for one slot on its stream.
///
/// `finished_sum` is the device mapping of the slot's pinned counter.
///
/// # Errors
/// Returns an error if the launch fails.
#[allow(clippy::too_many_arguments)]
pub fn stop_criteria(
    ctx: &CudaContext,
    stream: &CudaStream,
    ids: u64,
    new_tokens: u64,
    lengths: u64,
    finished: u64,
    finished_sum: u64,
    stop_words: u64,
    stop_words_len: i32,
    sequence_limit: u64,
    end_id: i32,
    beam_width: i32,
    max_seq_len: i32,
) -> Result<()> {
    let func = get_kernel(ctx.device(), PTX, MODULE, KERNEL_NAMES, "stop_criteria")?;

    let cfg = LaunchConfig {
        grid_dim: (1, 1, 1),
        block_dim: (32, 1, 1),
        shared_mem_bytes: 0,
    };
    unsafe {
        func.launch_on_stream(
            stream,
            cfg,
            (
                ids,
                new_tokens,
                lengths,
                finished,
                finished_sum,
                stop_words,
                stop_words_len,
                sequence_limit,
                end_id,
                beam_width,
                max_seq_len,
            ),
        )?;
    }
    Ok(())
}
