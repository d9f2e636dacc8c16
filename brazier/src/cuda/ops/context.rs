//! Launch wrappers for the context-phase (prefill) attention kernels.
//!
//! These run on the device's main stream, inside engine execution.

#![allow(clippy::cast_possible_truncation, clippy::missing_panics_doc)]

use cudarc::driver::{DeviceRepr, LaunchAsync, LaunchConfig};

use super::{get_kernel, kernel_suffix};
use crate::cuda::CudaContext;
use crate::dtype::TensorDType;
use crate::Result;

const INFO_PTX: &str = include_str!(concat!(env!("OUT_DIR"), "/kernels/decoder_info.ptx"));
const INFO_MODULE: &str = "decoder_info";
const INFO_NAMES: &[&str] = &[
    "build_decoder_info",
    "build_attention_mask_f32",
    "build_attention_mask_f16",
    "build_attention_mask_bf16",
];

const QKV_PTX: &str = include_str!(concat!(env!("OUT_DIR"), "/kernels/qkv_ops.ptx"));
const QKV_MODULE: &str = "qkv_ops";
const QKV_NAMES: &[&str] = &[
    "add_qkv_bias_rope_f32",
    "add_qkv_bias_rope_f16",
    "add_qkv_bias_rope_bf16",
    "transpose_attention_out_f32",
    "transpose_attention_out_f16",
    "transpose_attention_out_bf16",
];

const KV_PTX: &str = include_str!(concat!(env!("OUT_DIR"), "/kernels/kv_write.ptx"));
const KV_MODULE: &str = "kv_write";
const KV_NAMES: &[&str] = &[
    "write_kv_cache_f32",
    "write_kv_cache_f16",
    "write_kv_cache_bf16",
];

const SOFTMAX_PTX: &str = include_str!(concat!(env!("OUT_DIR"), "/kernels/softmax.ptx"));
const SOFTMAX_MODULE: &str = "softmax";
const SOFTMAX_NAMES: &[&str] = &[
    "masked_softmax_f32",
    "masked_softmax_f16",
    "masked_softmax_bf16",
];

const FMHA_PTX: &str = include_str!(concat!(env!("OUT_DIR"), "/kernels/fmha.ptx"));
const FMHA_MODULE: &str = "fmha";
const FMHA_NAMES: &[&str] = &["context_fmha_f16", "context_fmha_bf16"];

/// Longest context the fused kernel stages in shared memory
/// (`FMHA_MAX_CONTEXT` in `fmha.cu`).
pub const FMHA_MAX_CONTEXT: usize = 4096;

/// Parameter block mirroring `QkvBiasRopeParams` in `qkv_ops.cu`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct QkvBiasRopeParams {
    pub q_out: u64,
    pub k_out: u64,
    pub v_out: u64,
    pub qkv: u64,
    pub qkv_bias: u64,
    pub cu_seqlens: u64,
    pub padding_offset: u64,
    pub batch: i32,
    pub seq_len: i32,
    pub num_tokens: i32,
    pub head_num: i32,
    pub kv_head_num: i32,
    pub size_per_head: i32,
    pub rotary_dim: i32,
    pub rope_style: i32,
    pub rope_base: f32,
}

unsafe impl DeviceRepr for QkvBiasRopeParams {}

/// Parameter block mirroring `KvWriteParams` in `kv_write.cu`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct KvWriteParams {
    pub k_src: u64,
    pub v_src: u64,
    pub seq_lengths: u64,
    pub base_or_pool: u64,
    pub block_table: u64,
    pub scale_orig_quant: u64,
    pub paged: i32,
    pub tokens_per_block: i32,
    pub max_blocks_per_seq: i32,
    pub max_seq: i32,
    pub quant_mode: i32,
    pub elem_size: i32,
    pub batch: i32,
    pub seq_len: i32,
    pub kv_heads: i32,
    pub size_per_head: i32,
}

unsafe impl DeviceRepr for KvWriteParams {}

/// Parameter block mirroring `ContextFmhaParams` in `fmha.cu`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ContextFmhaParams {
    pub out: u64,
    pub q_buf: u64,
    pub k_buf: u64,
    pub v_buf: u64,
    pub cu_seqlens: u64,
    pub padding_offset: u64,
    pub alibi_slopes: u64,
    pub seq_len: i32,
    pub head_num: i32,
    pub kv_head_num: i32,
    pub size_per_head: i32,
    pub qk_scale: f32,
    pub fp32_acc: i32,
}

unsafe impl DeviceRepr for ContextFmhaParams {}

/// Build `cu_seqlens` and the packed-input padding-offset map. Single block.
///
/// # Errors
/// Returns an error if the launch fails.
pub fn build_decoder_info(
    ctx: &CudaContext,
    cu_seqlens: u64,
    padding_offset: u64,
    seq_lengths: u64,
    batch: i32,
    max_seq_len: i32,
) -> Result<()> {
    let func = get_kernel(ctx.device(), INFO_PTX, INFO_MODULE, INFO_NAMES, "build_decoder_info")?;
    let cfg = LaunchConfig {
        grid_dim: (1, 1, 1),
        block_dim: (256, 1, 1),
        shared_mem_bytes: 0,
    };
    unsafe {
        func.launch(cfg, (cu_seqlens, padding_offset, seq_lengths, batch, max_seq_len))?;
    }
    Ok(())
}

/// Build the dense causal attention mask for the unfused context path.
///
/// # Errors
/// Returns an error if the launch fails.
pub fn build_attention_mask<T: TensorDType>(
    ctx: &CudaContext,
    mask: u64,
    seq_lengths: u64,
    batch: i32,
    seq_len: i32,
) -> Result<()> {
    let name = format!("build_attention_mask_{}", kernel_suffix(T::DTYPE));
    let func = get_kernel(ctx.device(), INFO_PTX, INFO_MODULE, INFO_NAMES, &name)?;
    let threads = 256usize;
    let blocks = (seq_len as usize * seq_len as usize).div_ceil(threads);
    let cfg = LaunchConfig {
        grid_dim: (blocks as u32, batch as u32, 1),
        block_dim: (threads as u32, 1, 1),
        shared_mem_bytes: 0,
    };
    unsafe {
        func.launch(cfg, (mask, seq_lengths, batch, seq_len))?;
    }
    Ok(())
}

/// Split fused QKV into head-major Q/K/V with bias and rotary embedding.
///
/// # Errors
/// Returns an error if the launch fails.
pub fn add_qkv_bias_rope<T: TensorDType>(ctx: &CudaContext, params: QkvBiasRopeParams) -> Result<()> {
    let name = format!("add_qkv_bias_rope_{}", kernel_suffix(T::DTYPE));
    let func = get_kernel(ctx.device(), QKV_PTX, QKV_MODULE, QKV_NAMES, &name)?;
    let stride =
        (params.head_num + 2 * params.kv_head_num) as usize * params.size_per_head as usize;
    let total = params.num_tokens as usize * stride;
    let threads = 256usize;
    let cfg = LaunchConfig {
        grid_dim: (total.div_ceil(threads).min(65535) as u32, 1, 1),
        block_dim: (threads as u32, 1, 1),
        shared_mem_bytes: 0,
    };
    unsafe {
        func.launch(cfg, (params,))?;
    }
    Ok(())
}

/// Transpose the attention output back to token-major layout, re-packing to
/// the padding-removed layout when `padding_offset` is non-null.
///
/// # Errors
/// Returns an error if the launch fails.
#[allow(clippy::too_many_arguments)]
pub fn transpose_attention_out<T: TensorDType>(
    ctx: &CudaContext,
    dst: u64,
    src: u64,
    cu_seqlens: u64,
    padding_offset: u64,
    batch: i32,
    seq_len: i32,
    num_tokens: i32,
    head_num: i32,
    size_per_head: i32,
) -> Result<()> {
    let name = format!("transpose_attention_out_{}", kernel_suffix(T::DTYPE));
    let func = get_kernel(ctx.device(), QKV_PTX, QKV_MODULE, QKV_NAMES, &name)?;
    let rows = if padding_offset == 0 {
        batch as usize * seq_len as usize
    } else {
        num_tokens as usize
    };
    let total = rows * head_num as usize * size_per_head as usize;
    let threads = 256usize;
    let cfg = LaunchConfig {
        grid_dim: (total.div_ceil(threads).min(65535) as u32, 1, 1),
        block_dim: (threads as u32, 1, 1),
        shared_mem_bytes: 0,
    };
    unsafe {
        func.launch(
            cfg,
            (
                dst,
                src,
                cu_seqlens,
                padding_offset,
                batch,
                seq_len,
                num_tokens,
                head_num,
                size_per_head,
            ),
        )?;
    }
    Ok(())
}

/// Write the context-phase K/V into the cache view, quantising if required.
///
/// # Errors
/// Returns an error if the launch fails.
pub fn write_kv_cache<T: TensorDType>(ctx: &CudaContext, params: KvWriteParams) -> Result<()> {
    let name = format!("write_kv_cache_{}", kernel_suffix(T::DTYPE));
    let func = get_kernel(ctx.device(), KV_PTX, KV_MODULE, KV_NAMES, &name)?;
    let total = params.batch as usize
        * 2
        * params.seq_len as usize
        * params.kv_heads as usize
        * params.size_per_head as usize;
    let threads = 256usize;
    let cfg = LaunchConfig {
        grid_dim: (total.div_ceil(threads).min(65535) as u32, 1, 1),
        block_dim: (threads as u32, 1, 1),
        shared_mem_bytes: 0,
    };
    unsafe {
        func.launch(cfg, (params,))?;
    }
    Ok(())
}

/// Masked softmax over the attention scores, in place.
///
/// # Errors
/// Returns an error if the launch fails.
#[allow(clippy::too_many_arguments)]
pub fn masked_softmax<T: TensorDType>(
    ctx: &CudaContext,
    qk: u64,
    mask: u64,
    alibi_slopes: u64,
    batch: i32,
    head_num: i32,
    s_q: i32,
    s_k: i32,
    qk_scale: f32,
) -> Result<()> {
    let name = format!("masked_softmax_{}", kernel_suffix(T::DTYPE));
    let func = get_kernel(ctx.device(), SOFTMAX_PTX, SOFTMAX_MODULE, SOFTMAX_NAMES, &name)?;
    let cfg = LaunchConfig {
        grid_dim: (s_q as u32, head_num as u32, batch as u32),
        block_dim: (256, 1, 1),
        shared_mem_bytes: 0,
    };
    unsafe {
        func.launch(cfg, (qk, mask, alibi_slopes, s_q, s_k, qk_scale))?;
    }
    Ok(())
}

/// Fused context attention (16-bit dtypes only).
///
/// # Errors
/// Returns an error if the launch fails.
pub fn context_fmha<T: TensorDType>(
    ctx: &CudaContext,
    params: ContextFmhaParams,
    batch: i32,
) -> Result<()> {
    assert!(
        params.seq_len as usize <= FMHA_MAX_CONTEXT,
        "context length {} exceeds fused-kernel limit {FMHA_MAX_CONTEXT}",
        params.seq_len
    );
    let name = format!("context_fmha_{}", kernel_suffix(T::DTYPE));
    let func = get_kernel(ctx.device(), FMHA_PTX, FMHA_MODULE, FMHA_NAMES, &name)?;
    let cfg = LaunchConfig {
        grid_dim: (params.seq_len as u32, params.head_num as u32, batch as u32),
        block_dim: (256, 1, 1),
        shared_mem_bytes: 0,
    };
    unsafe {
        func.launch(cfg, (params,))?;
    }
    Ok(())
}
