//! One decoding slot: a decoder bound to its own stream.
//!
//! `forward_async` launches the step's kernels on the slot stream and
//! returns immediately; cross-stream ordering is the scheduler's job.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::missing_panics_doc)]

use cudarc::driver::CudaStream;

use crate::cuda::ops::{
    beam_search_step, gather_tree, logit_prep, sample_top_kp, stop_criteria, BeamStepParams,
    GatherTreeParams, LogitPrepParams, SampleParams,
};
use crate::cuda::stream::{memcpy_dtod_async, raw_stream};
use crate::cuda::{CudaContext, CudaTensor};
use crate::decoder::io::SlotViews;
use crate::dtype::TensorDType;
use crate::sampling::SamplingConfig;
use crate::Result;

/// Per-step inputs for one slot.
pub struct SlotStepInput<'a, T: TensorDType> {
    /// This slot's logits view, `[beam_width, vocab_size_padded]`.
    pub logits: CudaTensor<T>,
    /// Generation step (tokens produced so far).
    pub step: usize,
    pub input_length: usize,
    pub max_seq_len: usize,
    pub end_id: i32,
    pub embedding_bias: Option<&'a CudaTensor<f32>>,
    /// `[2, len]` encoding: row 0 flattened tokens, row 1 inclusive prefix
    /// offsets, -1 padding.
    pub bad_words: Option<&'a CudaTensor<i32>>,
    pub stop_words: Option<&'a CudaTensor<i32>>,
    /// Slot view `[beam_width, indir_seq]` of the step's source / target
    /// cache indirection (beam search only).
    pub src_cache_indirection: Option<CudaTensor<i32>>,
    pub tgt_cache_indirection: Option<CudaTensor<i32>>,
}

/// Decoder for a single slot, bound to a dedicated stream for its lifetime.
pub struct SlotDecoder<T: TensorDType> {
    ctx: CudaContext,
    stream: CudaStream,
    vocab_size: usize,
    vocab_size_padded: usize,
    config: SamplingConfig,
    _marker: std::marker::PhantomData<T>,
}

impl<T: TensorDType> SlotDecoder<T> {
    /// Create a decoder on a freshly forked stream.
    ///
    /// # Errors
    /// Returns an error if stream creation fails.
    pub fn new(ctx: &CudaContext, vocab_size: usize, vocab_size_padded: usize) -> Result<Self> {
        let stream = ctx.device().fork_default_stream()?;
        Ok(Self {
            ctx: ctx.clone(),
            stream,
            vocab_size,
            vocab_size_padded,
            config: SamplingConfig::default(),
            _marker: std::marker::PhantomData,
        })
    }

    /// The slot's stream.
    #[must_use]
    pub fn stream(&self) -> &CudaStream {
        &self.stream
    }

    /// The slot-local sampling configuration.
    #[must_use]
    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Bind a slot-local sampling configuration. RNG and top-p state are
    /// seeded by the caller's slot initialisation.
    pub fn setup(&mut self, config: SamplingConfig) {
        self.config = config;
    }

    /// Run one decode step on the slot stream: logit preparation, then
    /// sampling or beam search, then the termination criteria.
    ///
    /// Non-blocking on the host.
    ///
    /// # Errors
    /// Returns an error if a kernel launch fails.
    pub fn forward_async(&self, views: &SlotViews, input: &SlotStepInput<'_, T>) -> Result<()> {
        let cfg = &self.config;
        let w = cfg.beam_width;

        logit_prep::<T>(
            &self.ctx,
            &self.stream,
            LogitPrepParams {
                logits: input.logits.device_ptr(),
                ids: views.ids.device_ptr(),
                lengths: views.lengths.device_ptr(),
                embedding_bias: input.embedding_bias.map_or(0, CudaTensor::device_ptr),
                bad_words: input.bad_words.map_or(0, CudaTensor::device_ptr),
                finished: views.finished.device_ptr(),
                bad_words_len: input.bad_words.map_or(0, |t| t.shape()[1] as i32),
                step: input.step as i32,
                min_length: cfg.min_length_value() as i32,
                end_id: input.end_id,
                temperature: cfg.temperature_value().max(f32::MIN_POSITIVE),
                repetition_penalty: cfg.repetition_penalty_value(),
                presence_penalty: cfg.presence_penalty_value(),
                vocab_size: self.vocab_size as i32,
                vocab_size_padded: self.vocab_size_padded as i32,
                max_seq_len: input.max_seq_len as i32,
            },
            w,
        )?;

        if w == 1 {
            sample_top_kp::<T>(
                &self.ctx,
                &self.stream,
                SampleParams {
                    logits: input.logits.device_ptr(),
                    ids: views.ids.device_ptr(),
                    new_tokens: views.new_tokens.device_ptr(),
                    lengths: views.lengths.device_ptr(),
                    finished: views.finished.device_ptr(),
                    cum_log_probs: views.cum_log_probs.device_ptr(),
                    runtime_top_p: views.runtime_top_p.device_ptr(),
                    rng_state: views.rng_state.device_ptr(),
                    top_k: cfg.top_k_value() as i32,
                    top_p_initial: cfg.top_p_value(),
                    top_p_decay: cfg.top_p_decay_value(),
                    top_p_min: cfg.top_p_min_value(),
                    top_p_reset_id: cfg.top_p_reset_id_value(),
                    end_id: input.end_id,
                    vocab_size: self.vocab_size as i32,
                    vocab_size_padded: self.vocab_size_padded as i32,
                    max_seq_len: input.max_seq_len as i32,
                },
            )?;
        } else {
            beam_search_step::<T>(
                &self.ctx,
                &self.stream,
                BeamStepParams {
                    logits: input.logits.device_ptr(),
                    ids: views.ids.device_ptr(),
                    parent_ids: views.parent_ids.device_ptr(),
                    new_tokens: views.new_tokens.device_ptr(),
                    lengths: views.lengths.device_ptr(),
                    finished: views.finished.device_ptr(),
                    cum_log_probs: views.cum_log_probs.device_ptr(),
                    src_cache_indir: input
                        .src_cache_indirection
                        .as_ref()
                        .map_or(0, CudaTensor::device_ptr),
                    tgt_cache_indir: input
                        .tgt_cache_indirection
                        .as_ref()
                        .map_or(0, CudaTensor::device_ptr),
                    hyp_parent: views.hyp_parent.device_ptr(),
                    hyp_pos: views.hyp_pos.device_ptr(),
                    hyp_score: views.hyp_score.device_ptr(),
                    hyp_count: views.hyp_count.device_ptr(),
                    step: input.step as i32,
                    input_length: input.input_length as i32,
                    beam_width: w as i32,
                    end_id: input.end_id,
                    diversity_rate: cfg.diversity_rate_value(),
                    length_penalty: cfg.length_penalty_value(),
                    vocab_size: self.vocab_size as i32,
                    vocab_size_padded: self.vocab_size_padded as i32,
                    max_seq_len: input.max_seq_len as i32,
                },
            )?;
        }

        stop_criteria(
            &self.ctx,
            &self.stream,
            views.ids.device_ptr(),
            views.new_tokens.device_ptr(),
            views.lengths.device_ptr(),
            views.finished.device_ptr(),
            views.finished_sum_dev,
            input.stop_words.map_or(0, CudaTensor::device_ptr),
            input.stop_words.map_or(0, |t| t.shape()[1] as i32),
            views.sequence_limit.device_ptr(),
            input.end_id,
            w as i32,
            input.max_seq_len as i32,
        )
    }

    /// Reconstruct best-first sequences from the beam tree and rewrite the
    /// slot's ids in place. Greedy slots already hold their final ids.
    ///
    /// # Errors
    /// Returns an error if the launch or copy enqueue fails.
    pub fn gather_tree_async(
        &self,
        views: &SlotViews,
        input_length: usize,
        max_seq_len: usize,
        end_id: i32,
    ) -> Result<()> {
        let w = self.config.beam_width;
        if w == 1 {
            return Ok(());
        }
        gather_tree(
            &self.ctx,
            &self.stream,
            GatherTreeParams {
                final_ids: views.final_ids.device_ptr(),
                ids: views.ids.device_ptr(),
                parent_ids: views.parent_ids.device_ptr(),
                lengths: views.lengths.device_ptr(),
                cum_log_probs: views.cum_log_probs.device_ptr(),
                hyp_parent: views.hyp_parent.device_ptr(),
                hyp_pos: views.hyp_pos.device_ptr(),
                hyp_score: views.hyp_score.device_ptr(),
                hyp_count: views.hyp_count.device_ptr(),
                input_length: input_length as i32,
                beam_width: w as i32,
                end_id,
                length_penalty: self.config.length_penalty_value(),
                max_seq_len: max_seq_len as i32,
            },
        )?;
        memcpy_dtod_async(
            views.ids.device_ptr(),
            views.final_ids.device_ptr(),
            w * max_seq_len * std::mem::size_of::<i32>(),
            raw_stream(&self.stream),
        )
    }
}
