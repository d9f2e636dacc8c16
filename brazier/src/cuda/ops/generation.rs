//! Launch wrapper for the generation-phase fused masked multi-head
//! attention kernel.

#![allow(clippy::cast_possible_truncation, clippy::missing_panics_doc)]

use cudarc::driver::{DeviceRepr, LaunchAsync, LaunchConfig};

use super::{get_kernel, kernel_suffix};
use crate::cuda::CudaContext;
use crate::dtype::TensorDType;
use crate::Result;

const PTX: &str = include_str!(concat!(env!("OUT_DIR"), "/kernels/mha_decode.ptx"));
const MODULE: &str = "mha_decode";
const KERNEL_NAMES: &[&str] = &["masked_mha_f32", "masked_mha_f16", "masked_mha_bf16"];

/// Parameter block mirroring `MaskedMhaParams` in `mha_decode.cu`.
///
/// `timestep` does not appear here: per-lane past lengths come from
/// `sequence_lengths`, and the tile count is chosen by the caller.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MaskedMhaParams {
    pub out: u64,
    pub qkv: u64,
    pub qkv_bias: u64,
    pub sequence_lengths: u64,
    pub cache_indir: u64,
    pub base_or_pool: u64,
    pub block_table: u64,
    pub scale_orig_quant: u64,
    pub scale_quant_orig: u64,
    pub alibi_slopes: u64,
    pub partial_out: u64,
    pub partial_sum: u64,
    pub partial_max: u64,
    pub block_counter: u64,
    pub paged: i32,
    pub tokens_per_block: i32,
    pub max_blocks_per_seq: i32,
    pub max_seq: i32,
    pub quant_mode: i32,
    pub elem_size: i32,
    pub beam_width: i32,
    pub head_num: i32,
    pub kv_head_num: i32,
    pub size_per_head: i32,
    pub rotary_dim: i32,
    pub rope_style: i32,
    pub rope_base: f32,
    pub inv_sqrt_dh: f32,
    pub multi_block: i32,
    pub tile_size: i32,
    pub max_indir_seq: i32,
}

unsafe impl DeviceRepr for MaskedMhaParams {}

/// Launch one generation-attention step for `batch_beam` lanes.
///
/// `num_tiles` must be 1 unless `multi_block` is set, in which case it
/// covers `timestep + 1` keys in `tile_size` chunks.
///
/// # Errors
/// Returns an error if the launch fails.
pub fn masked_mha<T: TensorDType>(
    ctx: &CudaContext,
    params: MaskedMhaParams,
    batch_beam: i32,
    num_tiles: i32,
) -> Result<()> {
    assert!(
        params.multi_block != 0 || num_tiles == 1,
        "multiple tiles require multi-block mode"
    );
    let name = format!("masked_mha_{}", kernel_suffix(T::DTYPE));
    let func = get_kernel(ctx.device(), PTX, MODULE, KERNEL_NAMES, &name)?;
    let cfg = LaunchConfig {
        grid_dim: (params.head_num as u32, batch_beam as u32, num_tiles as u32),
        block_dim: (256, 1, 1),
        shared_mem_bytes: 0,
    };
    unsafe {
        func.launch(cfg, (params,))?;
    }
    Ok(())
}
