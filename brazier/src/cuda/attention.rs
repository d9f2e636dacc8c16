//! Attention step dispatch: context (prefill) and generation (decode)
//! kernel orchestration over a rolling KV cache.
//!
//! The dispatcher picks an algorithmic variant per call: fused context
//! attention for 16-bit dtypes when enabled, otherwise batched GEMMs in one
//! of three head-sharing regimes (single KV head, full multi-head, grouped),
//! followed by masked softmax and the attention-times-V GEMMs. Generation
//! steps assemble a parameter block for the fused masked multi-head
//! attention kernel, which appends to the cache and attends in one launch.

#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::missing_panics_doc)]

use cudarc::driver::DeviceSlice;

use crate::cuda::kv_cache::KvCacheView;
use crate::cuda::ops::{
    self, AlgoCache, ContextFmhaParams, KvWriteParams, MaskedMhaParams, MatmulWrapper, Op,
    QkvBiasRopeParams, StridedBatchedDesc, FMHA_MAX_CONTEXT,
};
use crate::cuda::{CudaContext, CudaTensor};
use crate::dtype::{CacheQuant, DType, TensorDType};
use crate::error::Error;
use crate::Result;

/// Keys per tile in multi-block generation attention.
const MULTI_BLOCK_TILE: usize = 1024;

/// Position encoding applied inside attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionEmbedding {
    #[default]
    None,
    /// Rotary on interleaved pairs.
    RopeGptJ,
    /// Rotary on split halves.
    RopeNeox,
    /// Linear bias on attention logits, per-head slopes.
    Alibi,
}

impl PositionEmbedding {
    fn rope_style(self) -> i32 {
        match self {
            Self::RopeGptJ => 1,
            Self::RopeNeox => 2,
            Self::None | Self::Alibi => 0,
        }
    }

    /// Whether this is one of the rotary styles.
    #[must_use]
    pub fn is_rope(self) -> bool {
        matches!(self, Self::RopeGptJ | Self::RopeNeox)
    }
}

/// Static attention configuration, fixed per model.
#[derive(Debug, Clone)]
pub struct AttentionConfig {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub q_scaling: f32,
    pub rotary_dim: usize,
    pub rope_base: f32,
    pub position_embedding: PositionEmbedding,
    /// Enable the fused context kernel (16-bit dtypes only).
    pub context_fmha: bool,
    /// Keep fused-kernel score accumulation in f32.
    pub fmha_force_fp32_acc: bool,
    /// Split long generation histories across thread blocks.
    pub multi_block: bool,
    pub cache_quant: CacheQuant,
    /// Input is packed variable-length rather than padded.
    pub packed_input: bool,
    pub dtype: DType,
    pub max_context_length: usize,
}

impl AttentionConfig {
    /// Validate the configuration against the device.
    ///
    /// # Errors
    /// Returns `ConfigConflict` on an unsupported combination.
    pub fn validate(&self, ctx: &CudaContext) -> Result<()> {
        if self.num_kv_heads == 0 || self.num_heads % self.num_kv_heads != 0 {
            return Err(Error::ConfigConflict(format!(
                "num_heads ({}) must be a multiple of num_kv_heads ({})",
                self.num_heads, self.num_kv_heads
            )));
        }
        if self.position_embedding.is_rope() != (self.rotary_dim != 0) {
            return Err(Error::ConfigConflict(format!(
                "rotary_dim ({}) inconsistent with position embedding {:?}",
                self.rotary_dim, self.position_embedding
            )));
        }
        if self.dtype == DType::BF16 && ctx.sm_version() < 80 {
            return Err(Error::ConfigConflict(
                "pre-SM80 GPUs do not support bfloat16".into(),
            ));
        }
        Ok(())
    }
}

/// Inputs for one context (prefill) dispatch.
pub struct ContextParams<'a, T: TensorDType> {
    /// Fused QKV activation: `[num_tokens, (h + 2*kv) * d]` packed or
    /// `[batch, seq, (h + 2*kv) * d]` dense.
    pub qkv: &'a CudaTensor<T>,
    pub qkv_bias: Option<&'a CudaTensor<T>>,
    /// Per-sequence prompt lengths, `[batch]`.
    pub seq_lengths: &'a CudaTensor<i32>,
    pub batch_size: usize,
    /// Padded sequence length (max prompt length).
    pub input_seq_len: usize,
    /// Total real tokens (packed mode); `batch * input_seq_len` for dense.
    pub num_tokens: usize,
    pub alibi_slopes: Option<&'a CudaTensor<f32>>,
    pub kv_scale_orig_quant: Option<&'a CudaTensor<f32>>,
    /// Context output, same token layout as `qkv` with `h * d` columns.
    pub output: &'a CudaTensor<T>,
    pub cache: KvCacheView,
}

/// Inputs for one generation (decode) dispatch.
pub struct GenerationParams<'a, T: TensorDType> {
    /// Fused QKV for the current token, `[batch*beam, (h + 2*kv) * d]`.
    pub qkv: &'a CudaTensor<T>,
    pub qkv_bias: Option<&'a CudaTensor<T>>,
    /// Past KV length per lane, `[batch*beam]`.
    pub sequence_lengths: &'a CudaTensor<i32>,
    /// Beam cache indirection `[batch, beam, max_seq]`, beam search only.
    pub cache_indirection: Option<&'a CudaTensor<i32>>,
    pub num_requests: usize,
    pub beam_width: usize,
    /// Largest past KV length in the batch this step.
    pub past_kv_length: usize,
    pub alibi_slopes: Option<&'a CudaTensor<f32>>,
    pub kv_scale_orig_quant: Option<&'a CudaTensor<f32>>,
    pub kv_scale_quant_orig: Option<&'a CudaTensor<f32>>,
    /// Attention output, `[batch*beam, h * d]`.
    pub output: &'a CudaTensor<T>,
    pub cache: KvCacheView,
}

/// Scratch for multi-block generation attention: per-tile partial outputs,
/// softmax statistics, and the tile completion counter.
pub struct MultiBlockWorkspace<T: TensorDType> {
    partial_out: CudaTensor<T>,
    partial_sum: CudaTensor<f32>,
    partial_max: CudaTensor<f32>,
    block_counter: CudaTensor<i32>,
    max_tiles: usize,
}

impl<T: TensorDType + cudarc::driver::DeviceRepr + cudarc::driver::ValidAsZeroBits>
    MultiBlockWorkspace<T>
{
    /// Allocate for up to `max_batch_beam` lanes and `max_seq` keys.
    ///
    /// # Errors
    /// Returns an error if GPU allocation fails.
    pub fn new(
        ctx: &CudaContext,
        cfg: &AttentionConfig,
        max_batch_beam: usize,
        max_seq: usize,
    ) -> Result<Self> {
        let max_tiles = max_seq.div_ceil(MULTI_BLOCK_TILE).max(1);
        let lanes = max_batch_beam * cfg.num_heads;
        Ok(Self {
            partial_out: CudaTensor::zeros(ctx, &[lanes, max_tiles, cfg.head_size])?,
            partial_sum: CudaTensor::zeros(ctx, &[lanes, max_tiles])?,
            partial_max: CudaTensor::zeros(ctx, &[lanes, max_tiles])?,
            block_counter: CudaTensor::zeros(ctx, &[lanes])?,
            max_tiles,
        })
    }
}

/// The per-model attention dispatcher, instantiated per KV storage variant
/// through the view passed at each call.
pub struct AttentionDispatcher<T: TensorDType> {
    ctx: CudaContext,
    cfg: AttentionConfig,
    wrapper: MatmulWrapper,
    /// Effective fused-context flag: requested AND dtype is 16-bit.
    fmha_enabled: bool,
    _marker: std::marker::PhantomData<T>,
}

impl<T> AttentionDispatcher<T>
where
    T: TensorDType
        + cudarc::driver::DeviceRepr
        + cudarc::driver::ValidAsZeroBits
        + ops::GemmScalar,
    cudarc::cublas::CudaBlas: cudarc::cublas::Gemm<T>,
{
    /// Create a dispatcher; validates the configuration against the device.
    ///
    /// # Errors
    /// Returns `ConfigConflict` on unsupported dtype/device combinations.
    pub fn new(ctx: &CudaContext, cfg: AttentionConfig, algo_cache: AlgoCache) -> Result<Self> {
        assert_eq!(cfg.dtype, T::DTYPE, "config dtype must match instantiation");
        cfg.validate(ctx)?;
        let fmha_enabled = cfg.context_fmha && cfg.dtype.is_half();
        Ok(Self {
            ctx: ctx.clone(),
            wrapper: MatmulWrapper::new(ctx, algo_cache),
            cfg,
            fmha_enabled,
            _marker: std::marker::PhantomData,
        })
    }

    /// Attention configuration.
    #[must_use]
    pub fn config(&self) -> &AttentionConfig {
        &self.cfg
    }

    /// Whether context calls take the fused path.
    #[must_use]
    pub fn fmha_enabled(&self) -> bool {
        self.fmha_enabled
    }

    fn quant_mode(&self) -> i32 {
        match self.cfg.cache_quant {
            CacheQuant::None => 0,
            CacheQuant::Int8 => 1,
            CacheQuant::Fp8 => 2,
        }
    }

    fn qk_scale(&self) -> f32 {
        1.0 / ((self.cfg.head_size as f32).sqrt() * self.cfg.q_scaling)
    }

    /// Context attention: process the whole prompt of every sequence in one
    /// call, writing K/V into the cache at positions `[0, len)`.
    ///
    /// # Errors
    /// Returns an error on kernel launch or GEMM failure.
    pub fn context(&self, p: &ContextParams<'_, T>) -> Result<()> {
        let h = self.cfg.num_heads;
        let kv = self.cfg.num_kv_heads;
        let d = self.cfg.head_size;
        let b = p.batch_size;
        let s = p.input_seq_len;
        assert!(
            s <= self.cfg.max_context_length,
            "input length {s} exceeds max context length {}",
            self.cfg.max_context_length
        );
        let rows = if self.cfg.packed_input { p.num_tokens } else { b * s };

        // Sequence metadata and, on the unfused path, the dense mask.
        let cu_seqlens = CudaTensor::<i32>::zeros(&self.ctx, &[b + 1])?;
        let padding_offset = CudaTensor::<i32>::zeros(&self.ctx, &[rows.max(1)])?;
        ops::build_decoder_info(
            &self.ctx,
            cu_seqlens.device_ptr(),
            padding_offset.device_ptr(),
            p.seq_lengths.device_ptr(),
            b as i32,
            s as i32,
        )?;
        let padding_offset_ptr = if self.cfg.packed_input {
            padding_offset.device_ptr()
        } else {
            0
        };

        // Split fused QKV into head-major scratch; padding rows stay zero.
        let q_buf = CudaTensor::<T>::zeros(&self.ctx, &[b, h, s, d])?;
        let k_buf = CudaTensor::<T>::zeros(&self.ctx, &[b, kv, s, d])?;
        let v_buf = CudaTensor::<T>::zeros(&self.ctx, &[b, kv, s, d])?;
        ops::add_qkv_bias_rope::<T>(
            &self.ctx,
            QkvBiasRopeParams {
                q_out: q_buf.device_ptr(),
                k_out: k_buf.device_ptr(),
                v_out: v_buf.device_ptr(),
                qkv: p.qkv.device_ptr(),
                qkv_bias: p.qkv_bias.map_or(0, CudaTensor::device_ptr),
                cu_seqlens: cu_seqlens.device_ptr(),
                padding_offset: padding_offset_ptr,
                batch: b as i32,
                seq_len: s as i32,
                num_tokens: rows as i32,
                head_num: h as i32,
                kv_head_num: kv as i32,
                size_per_head: d as i32,
                rotary_dim: self.cfg.rotary_dim as i32,
                rope_style: self.cfg.position_embedding.rope_style(),
                rope_base: self.cfg.rope_base,
            },
        )?;

        // K/V into the cache at [0, len), quantising if configured.
        let (paged, base_or_pool, block_table, tokens_per_block, max_blocks, max_seq) =
            p.cache.kernel_args();
        ops::write_kv_cache::<T>(
            &self.ctx,
            KvWriteParams {
                k_src: k_buf.device_ptr(),
                v_src: v_buf.device_ptr(),
                seq_lengths: p.seq_lengths.device_ptr(),
                base_or_pool,
                block_table,
                scale_orig_quant: p.kv_scale_orig_quant.map_or(0, CudaTensor::device_ptr),
                paged,
                tokens_per_block,
                max_blocks_per_seq: max_blocks,
                max_seq,
                quant_mode: self.quant_mode(),
                elem_size: p.cache.element_size() as i32,
                batch: b as i32,
                seq_len: s as i32,
                kv_heads: kv as i32,
                size_per_head: d as i32,
            },
        )?;

        let alibi = match self.cfg.position_embedding {
            PositionEmbedding::Alibi => p.alibi_slopes.map_or(0, CudaTensor::device_ptr),
            _ => 0,
        };

        if self.fmha_enabled && s <= FMHA_MAX_CONTEXT {
            ops::context_fmha::<T>(
                &self.ctx,
                ContextFmhaParams {
                    out: p.output.device_ptr(),
                    q_buf: q_buf.device_ptr(),
                    k_buf: k_buf.device_ptr(),
                    v_buf: v_buf.device_ptr(),
                    cu_seqlens: cu_seqlens.device_ptr(),
                    padding_offset: padding_offset_ptr,
                    alibi_slopes: alibi,
                    seq_len: s as i32,
                    head_num: h as i32,
                    kv_head_num: kv as i32,
                    size_per_head: d as i32,
                    qk_scale: self.qk_scale(),
                    fp32_acc: i32::from(self.cfg.fmha_force_fp32_acc || T::DTYPE == DType::BF16),
                },
                b as i32,
            )?;
            return Ok(());
        }

        // Unfused path: QK^T, masked softmax, attn @ V, transpose.
        let mask = CudaTensor::<T>::zeros(&self.ctx, &[b, s, s])?;
        ops::build_attention_mask::<T>(
            &self.ctx,
            mask.device_ptr(),
            p.seq_lengths.device_ptr(),
            b as i32,
            s as i32,
        )?;

        let mut qk_buf = unsafe { CudaTensor::<T>::uninit(&self.ctx, &[b, h, s, s])? };
        self.qk_gemm(&q_buf, &k_buf, &mut qk_buf, b, s)?;

        ops::masked_softmax::<T>(
            &self.ctx,
            qk_buf.device_ptr(),
            mask.device_ptr(),
            alibi,
            b as i32,
            h as i32,
            s as i32,
            s as i32,
            self.qk_scale(),
        )?;

        let mut ctx_buf = unsafe { CudaTensor::<T>::uninit(&self.ctx, &[b, h, s, d])? };
        self.av_gemm(&qk_buf, &v_buf, &mut ctx_buf, b, s)?;

        ops::transpose_attention_out::<T>(
            &self.ctx,
            p.output.device_ptr(),
            ctx_buf.device_ptr(),
            cu_seqlens.device_ptr(),
            padding_offset_ptr,
            b as i32,
            s as i32,
            rows as i32,
            h as i32,
            d as i32,
        )?;
        Ok(())
    }

    /// `QK^T` in the regime picked by the head-sharing layout.
    fn qk_gemm(
        &self,
        q_buf: &CudaTensor<T>,
        k_buf: &CudaTensor<T>,
        qk_buf: &mut CudaTensor<T>,
        b: usize,
        s: usize,
    ) -> Result<()> {
        let h = self.cfg.num_heads as i32;
        let kv = self.cfg.num_kv_heads as i32;
        let d = self.cfg.head_size as i32;
        let si = s as i32;

        if kv == 1 {
            // Single KV head: one gemm, heads folded into the m rows.
            let desc = StridedBatchedDesc {
                transa: Op::T,
                transb: Op::N,
                m: si,
                n: si * h,
                k: d,
                lda: d,
                stride_a: i64::from(si * d),
                ldb: d,
                stride_b: i64::from(h * si * d),
                ldc: si,
                stride_c: i64::from(h * si * si),
                batch: b as i32,
                alpha: 1.0,
                beta: 0.0,
            };
            let a = k_buf.cuda_slice();
            let bview = q_buf.cuda_slice();
            self.wrapper
                .gemm_strided_batched(&desc, &a, &bview, qk_buf.cuda_slice_mut())
        } else if kv == h {
            // Full multi-head: one gemm, batch folds batch*heads.
            let desc = StridedBatchedDesc {
                transa: Op::T,
                transb: Op::N,
                m: si,
                n: si,
                k: d,
                lda: d,
                stride_a: i64::from(si * d),
                ldb: d,
                stride_b: i64::from(si * d),
                ldc: si,
                stride_c: i64::from(si * si),
                batch: b as i32 * h,
                alpha: 1.0,
                beta: 0.0,
            };
            let a = k_buf.cuda_slice();
            let bview = q_buf.cuda_slice();
            self.wrapper
                .gemm_strided_batched(&desc, &a, &bview, qk_buf.cuda_slice_mut())
        } else {
            // Grouped: one gemm per KV head, folding the group into m rows.
            let g = h / kv;
            for ki in 0..kv {
                let desc = StridedBatchedDesc {
                    transa: Op::T,
                    transb: Op::N,
                    m: si,
                    n: si * g,
                    k: d,
                    lda: d,
                    stride_a: i64::from(kv * si * d),
                    ldb: d,
                    stride_b: i64::from(h * si * d),
                    ldc: si,
                    stride_c: i64::from(h * si * si),
                    batch: b as i32,
                    alpha: 1.0,
                    beta: 0.0,
                };
                let a_off = (ki * si * d) as usize;
                let b_off = (ki * g * si * d) as usize;
                let c_off = (ki * g * si * si) as usize;
                let a_view = k_buf.slice_view(a_off, &[k_buf.numel() - a_off]);
                let b_view = q_buf.slice_view(b_off, &[q_buf.numel() - b_off]);
                let a = a_view.cuda_slice();
                let bview = b_view.cuda_slice();
                let c_full = qk_buf.cuda_slice_mut();
                let len = c_full.len();
                let mut c = c_full.slice_mut(c_off..len);
                self.wrapper.gemm_strided_batched(&desc, &a, &bview, &mut c)?;
            }
            Ok(())
        }
    }

    /// `attn @ V` with the same three stride patterns.
    fn av_gemm(
        &self,
        qk_buf: &CudaTensor<T>,
        v_buf: &CudaTensor<T>,
        ctx_buf: &mut CudaTensor<T>,
        b: usize,
        s: usize,
    ) -> Result<()> {
        let h = self.cfg.num_heads as i32;
        let kv = self.cfg.num_kv_heads as i32;
        let d = self.cfg.head_size as i32;
        let si = s as i32;

        if kv == 1 {
            let desc = StridedBatchedDesc {
                transa: Op::N,
                transb: Op::N,
                m: d,
                n: h * si,
                k: si,
                lda: d,
                stride_a: i64::from(d * si),
                ldb: si,
                stride_b: i64::from(si * h * si),
                ldc: d,
                stride_c: i64::from(d * h * si),
                batch: b as i32,
                alpha: 1.0,
                beta: 0.0,
            };
            let a = v_buf.cuda_slice();
            let bview = qk_buf.cuda_slice();
            self.wrapper
                .gemm_strided_batched(&desc, &a, &bview, ctx_buf.cuda_slice_mut())
        } else if kv == h {
            let desc = StridedBatchedDesc {
                transa: Op::N,
                transb: Op::N,
                m: d,
                n: si,
                k: si,
                lda: d,
                stride_a: i64::from(si * d),
                ldb: si,
                stride_b: i64::from(si * si),
                ldc: d,
                stride_c: i64::from(si * d),
                batch: b as i32 * h,
                alpha: 1.0,
                beta: 0.0,
            };
            let a = v_buf.cuda_slice();
            let bview = qk_buf.cuda_slice();
            self.wrapper
                .gemm_strided_batched(&desc, &a, &bview, ctx_buf.cuda_slice_mut())
        } else {
            let g = h / kv;
            for ki in 0..kv {
                let desc = StridedBatchedDesc {
                    transa: Op::N,
                    transb: Op::N,
                    m: d,
                    n: g * si,
                    k: si,
                    lda: d,
                    stride_a: i64::from(kv * d * si),
                    ldb: si,
                    stride_b: i64::from(si * h * si),
                    ldc: d,
                    stride_c: i64::from(d * h * si),
                    batch: b as i32,
                    alpha: 1.0,
                    beta: 0.0,
                };
                let a_off = (ki * si * d) as usize;
                let b_off = (ki * g * si * si) as usize;
                let c_off = (ki * g * si * d) as usize;
                let a_view = v_buf.slice_view(a_off, &[v_buf.numel() - a_off]);
                let b_view = qk_buf.slice_view(b_off, &[qk_buf.numel() - b_off]);
                let a = a_view.cuda_slice();
                let bview = b_view.cuda_slice();
                let c_full = ctx_buf.cuda_slice_mut();
                let len = c_full.len();
                let mut c = c_full.slice_mut(c_off..len);
                self.wrapper.gemm_strided_batched(&desc, &a, &bview, &mut c)?;
            }
            Ok(())
        }
    }

    /// Generation attention: one decode step for every lane, appending at
    /// `timestep` and attending over `[0, timestep]`.
    ///
    /// # Errors
    /// Returns an error on kernel launch failure.
    pub fn generation(
        &self,
        p: &GenerationParams<'_, T>,
        workspace: Option<&MultiBlockWorkspace<T>>,
    ) -> Result<()> {
        let batch_beam = (p.num_requests * p.beam_width) as i32;
        let total_keys = p.past_kv_length + 1;

        let (num_tiles, tile_size) = if self.cfg.multi_block {
            let ws = workspace.expect("multi-block mode requires a workspace");
            let tiles = total_keys.div_ceil(MULTI_BLOCK_TILE).clamp(1, ws.max_tiles);
            (tiles, total_keys.div_ceil(tiles))
        } else {
            (1, total_keys)
        };

        let (paged, base_or_pool, block_table, tokens_per_block, max_blocks, max_seq) =
            p.cache.kernel_args();

        let params = MaskedMhaParams {
            out: p.output.device_ptr(),
            qkv: p.qkv.device_ptr(),
            qkv_bias: p.qkv_bias.map_or(0, CudaTensor::device_ptr),
            sequence_lengths: p.sequence_lengths.device_ptr(),
            cache_indir: p.cache_indirection.map_or(0, CudaTensor::device_ptr),
            base_or_pool,
            block_table,
            scale_orig_quant: p.kv_scale_orig_quant.map_or(0, CudaTensor::device_ptr),
            scale_quant_orig: p.kv_scale_quant_orig.map_or(0, CudaTensor::device_ptr),
            alibi_slopes: match self.cfg.position_embedding {
                PositionEmbedding::Alibi => p.alibi_slopes.map_or(0, CudaTensor::device_ptr),
                _ => 0,
            },
            partial_out: workspace.map_or(0, |w| w.partial_out.device_ptr()),
            partial_sum: workspace.map_or(0, |w| w.partial_sum.device_ptr()),
            partial_max: workspace.map_or(0, |w| w.partial_max.device_ptr()),
            block_counter: workspace.map_or(0, |w| w.block_counter.device_ptr()),
            paged,
            tokens_per_block,
            max_blocks_per_seq: max_blocks,
            max_seq,
            quant_mode: self.quant_mode(),
            elem_size: p.cache.element_size() as i32,
            beam_width: p.beam_width as i32,
            head_num: self.cfg.num_heads as i32,
            kv_head_num: self.cfg.num_kv_heads as i32,
            size_per_head: self.cfg.head_size as i32,
            rotary_dim: self.cfg.rotary_dim as i32,
            rope_style: self.cfg.position_embedding.rope_style(),
            rope_base: self.cfg.rope_base,
            inv_sqrt_dh: self.qk_scale(),
            multi_block: i32::from(self.cfg.multi_block),
            tile_size: tile_size as i32,
            max_indir_seq: p
                .cache_indirection
                .map_or(0, |t| *t.shape().last().unwrap_or(&0) as i32),
        };

        ops::masked_mha::<T>(&self.ctx, params, batch_beam, num_tiles as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AttentionConfig {
        AttentionConfig {
            num_heads: 8,
            num_kv_heads: 8,
            head_size: 32,
            q_scaling: 1.0,
            rotary_dim: 0,
            rope_base: 10000.0,
            position_embedding: PositionEmbedding::None,
            context_fmha: false,
            fmha_force_fp32_acc: false,
            multi_block: false,
            cache_quant: CacheQuant::None,
            packed_input: false,
            dtype: DType::F32,
            max_context_length: 1024,
        }
    }

    #[test]
    fn config_rejects_ragged_head_grouping() {
        let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
        let mut cfg = base_config();
        cfg.num_kv_heads = 3;
        assert!(matches!(cfg.validate(&ctx), Err(Error::ConfigConflict(_))));
    }

    #[test]
    fn config_rejects_rope_without_rotary_dim() {
        let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
        let mut cfg = base_config();
        cfg.position_embedding = PositionEmbedding::RopeNeox;
        cfg.rotary_dim = 0;
        assert!(matches!(cfg.validate(&ctx), Err(Error::ConfigConflict(_))));

        cfg.rotary_dim = 32;
        assert!(cfg.validate(&ctx).is_ok());
    }

    #[test]
    fn fmha_only_for_half_dtypes() {
        let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
        let cache = AlgoCache::default();
        let mut cfg = base_config();
        cfg.context_fmha = true;
        let disp = AttentionDispatcher::<f32>::new(&ctx, cfg, cache).unwrap();
        assert!(!disp.fmha_enabled());
    }

    mod gpu {
        use super::*;
        use crate::cuda::kv_cache::{CacheShape, KvCacheManager};

        // Uniform V and a single head: attention output must equal V's value
        // regardless of the score distribution. Exercises the full unfused
        // context path end to end.
        #[test]
        fn context_unfused_uniform_value() {
            let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
            let mut cfg = base_config();
            cfg.num_heads = 1;
            cfg.num_kv_heads = 1;
            cfg.head_size = 4;
            cfg.max_context_length = 8;
            let disp =
                AttentionDispatcher::<f32>::new(&ctx, cfg.clone(), AlgoCache::default()).unwrap();

            let b = 1;
            let s = 3;
            let stride = (cfg.num_heads + 2 * cfg.num_kv_heads) * cfg.head_size;
            // Q and K arbitrary, V constant 2.0.
            let mut host = vec![0.0f32; b * s * stride];
            for t in 0..s {
                for c in 0..stride {
                    let col = c;
                    host[t * stride + col] = if col < 2 * cfg.head_size {
                        (t as f32 + 1.0) * 0.1
                    } else {
                        2.0
                    };
                }
            }
            let qkv = CudaTensor::from_slice(&ctx, &[b, s, stride], &host).unwrap();
            let seq_lengths = CudaTensor::from_slice(&ctx, &[b], &[s as i32]).unwrap();
            let output = CudaTensor::<f32>::zeros(&ctx, &[b, s, cfg.num_heads * cfg.head_size])
                .unwrap();

            let shape = CacheShape::new(cfg.num_kv_heads, cfg.head_size, DType::F32, CacheQuant::None);
            let mgr = KvCacheManager::linear(&ctx, 1, b, 8, shape).unwrap();

            disp.context(&ContextParams {
                qkv: &qkv,
                qkv_bias: None,
                seq_lengths: &seq_lengths,
                batch_size: b,
                input_seq_len: s,
                num_tokens: b * s,
                alibi_slopes: None,
                kv_scale_orig_quant: None,
                output: &output,
                cache: mgr.layer_view(0),
            })
            .unwrap();
            ctx.synchronize().unwrap();

            let out = output.to_vec().unwrap();
            for (i, v) in out.iter().enumerate() {
                assert!((v - 2.0).abs() < 1e-4, "output[{i}] = {v}, expected 2.0");
            }
        }
    }
}
