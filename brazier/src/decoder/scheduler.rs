//! Batched decoding over a fixed pool of slots, one stream per slot.
//!
//! Each `forward` records a start event on the main stream, fans the active
//! slots out onto their own streams, joins each one back with its completion
//! event, and suspends the host exactly once on the stop event to read the
//! pinned finished counters. Slots are visited in ascending index order, so
//! a step is deterministic for a given input.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::missing_panics_doc)]

use tracing::debug;

use crate::cuda::stream::{default_stream, raw_stream, CudaEvent};
use crate::cuda::{CudaContext, CudaTensor};
use crate::decoder::io::JointBuffers;
use crate::decoder::slot::{SlotDecoder, SlotStepInput};
use crate::dtype::TensorDType;
use crate::error::Error;
use crate::sampling::SamplingConfig;
use crate::Result;

/// One decoding request bound to a slot.
pub struct Request {
    /// Prompt token ids, `[input_length]`, on the device.
    pub ids: CudaTensor<i32>,
    /// Defaults to `max_seq_len - input_length`.
    pub max_new_tokens: Option<usize>,
    /// Defaults to `vocab_size - 1`.
    pub end_id: Option<i32>,
    /// Defaults to `vocab_size - 1`.
    pub pad_id: Option<i32>,
    pub embedding_bias: Option<CudaTensor<f32>>,
    /// `[2, len]` token-sequence encoding.
    pub bad_words: Option<CudaTensor<i32>>,
    pub stop_words: Option<CudaTensor<i32>>,
}

impl Request {
    /// Request with only a prompt and a token budget.
    #[must_use]
    pub fn new(ids: CudaTensor<i32>, max_new_tokens: usize) -> Self {
        Self {
            ids,
            max_new_tokens: Some(max_new_tokens),
            end_id: None,
            pad_id: None,
            embedding_bias: None,
            bad_words: None,
            stop_words: None,
        }
    }
}

/// A whole generation batch, split into per-slot requests by `new_batch`.
pub struct BatchInput {
    /// `[batch, max_input_len]` dense, or `[1, sum(lengths)]` packed.
    pub ids: CudaTensor<i32>,
    /// Host-side input lengths, one per sequence.
    pub lengths: Vec<usize>,
    pub packed: bool,
    pub max_new_tokens: Option<usize>,
    pub end_id: Option<i32>,
    pub pad_id: Option<i32>,
    pub embedding_bias: Option<CudaTensor<f32>>,
    pub bad_words: Option<CudaTensor<i32>>,
    pub stop_words: Option<CudaTensor<i32>>,
}

/// Per-step input to `forward`.
pub struct ForwardInput<'a, T: TensorDType> {
    /// `[actual_batch, max_beam_width, vocab_size_padded]`.
    pub logits: &'a CudaTensor<T>,
    /// Per-slot active mask; `None` means all active. An inactive slot is
    /// neither driven nor joined this step.
    pub active: Option<&'a [bool]>,
    /// `[actual_batch, max_beam_width, max_seq]`, beam search only.
    pub src_cache_indirection: Option<&'a CudaTensor<i32>>,
}

/// Per-step output of `forward`.
pub struct ForwardOutput<'a> {
    /// `[actual_batch, max_beam_width, max_seq]`, beam search only.
    pub tgt_cache_indirection: Option<&'a CudaTensor<i32>>,
}

/// Slot lifecycle. `Finished` slots are skipped by `forward` until re-armed
/// by `new_request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotPhase {
    Idle,
    Running,
    Finished,
}

struct SlotState {
    phase: SlotPhase,
    beam_width: usize,
    step: usize,
    input_length: usize,
    max_new_tokens: usize,
    end_id: i32,
    #[allow(dead_code)]
    pad_id: i32,
    embedding_bias: Option<CudaTensor<f32>>,
    bad_words: Option<CudaTensor<i32>>,
    stop_words: Option<CudaTensor<i32>>,
}

impl SlotState {
    fn idle() -> Self {
        Self {
            phase: SlotPhase::Idle,
            beam_width: 0,
            step: 0,
            input_length: 0,
            max_new_tokens: 0,
            end_id: 0,
            pad_id: 0,
            embedding_bias: None,
            bad_words: None,
            stop_words: None,
        }
    }
}

/// The decoder batch: joint buffers, one decoder and one event per slot,
/// and the start/stop events bracketing each step.
pub struct DecoderBatch<T: TensorDType> {
    ctx: CudaContext,
    vocab_size: usize,
    vocab_size_padded: usize,
    max_beam_width: usize,
    max_seq_len: usize,
    actual_batch_size: usize,
    joint: JointBuffers,
    decoders: Vec<SlotDecoder<T>>,
    events: Vec<CudaEvent>,
    event_start: CudaEvent,
    event_stop: CudaEvent,
    slots: Vec<SlotState>,
    poisoned: Option<String>,
}

impl<T: TensorDType> DecoderBatch<T> {
    /// Allocate the joint tensors, `max_batch_size` streams, events, and
    /// decoders. All slots start idle with step 0.
    ///
    /// # Errors
    /// Returns `PreconditionViolation` on zero sizes and propagates
    /// allocation failures.
    pub fn setup(
        ctx: &CudaContext,
        vocab_size: usize,
        vocab_size_padded: usize,
        max_batch_size: usize,
        max_beam_width: usize,
        max_seq_len: usize,
    ) -> Result<Self> {
        if max_batch_size == 0 || max_beam_width == 0 || max_seq_len == 0 {
            return Err(Error::PreconditionViolation(
                "setup sizes must be positive".into(),
            ));
        }
        if max_beam_width > crate::cuda::ops::MAX_BEAM_WIDTH {
            return Err(Error::PreconditionViolation(format!(
                "max beam width {max_beam_width} exceeds supported {}",
                crate::cuda::ops::MAX_BEAM_WIDTH
            )));
        }

        let joint = JointBuffers::new(ctx, max_batch_size, max_beam_width, max_seq_len)?;
        let mut decoders = Vec::with_capacity(max_batch_size);
        let mut events = Vec::with_capacity(max_batch_size);
        for _ in 0..max_batch_size {
            decoders.push(SlotDecoder::new(ctx, vocab_size, vocab_size_padded)?);
            events.push(CudaEvent::new(ctx.device())?);
        }

        Ok(Self {
            ctx: ctx.clone(),
            vocab_size,
            vocab_size_padded,
            max_beam_width,
            max_seq_len,
            actual_batch_size: max_batch_size,
            joint,
            decoders,
            events,
            event_start: CudaEvent::new(ctx.device())?,
            event_stop: CudaEvent::new(ctx.device())?,
            slots: (0..max_batch_size).map(|_| SlotState::idle()).collect(),
            poisoned: None,
        })
    }

    /// Maximum number of slots.
    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        self.slots.len()
    }

    /// Batch size of the current generation.
    #[must_use]
    pub fn actual_batch_size(&self) -> usize {
        self.actual_batch_size
    }

    /// Maximum beam width.
    #[must_use]
    pub fn max_beam_width(&self) -> usize {
        self.max_beam_width
    }

    /// Maximum sequence length.
    #[must_use]
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Joint output ids, `[max_batch, max_beam, max_seq]`.
    #[must_use]
    pub fn output_ids(&self) -> &CudaTensor<i32> {
        &self.joint.ids
    }

    /// Joint sequence lengths, `[max_batch, max_beam]`.
    #[must_use]
    pub fn lengths(&self) -> &CudaTensor<i32> {
        &self.joint.lengths
    }

    /// Joint parent ids, `[max_batch, max_beam, max_seq]` (beam search).
    #[must_use]
    pub fn parent_ids(&self) -> &CudaTensor<i32> {
        &self.joint.parent_ids
    }

    /// Joint cumulative log-probabilities, `[max_batch, max_beam]`.
    #[must_use]
    pub fn cum_log_probs(&self) -> &CudaTensor<f32> {
        &self.joint.cum_log_probs
    }

    /// Tokens produced this step, `[max_batch, max_beam]`.
    #[must_use]
    pub fn new_tokens(&self) -> &CudaTensor<i32> {
        &self.joint.new_tokens
    }

    /// Per-slot finished flags (true for idle slots as well).
    #[must_use]
    pub fn finished(&self) -> Vec<bool> {
        self.slots.iter().map(|s| s.phase != SlotPhase::Running).collect()
    }

    /// Whether every slot in the current batch has finished.
    #[must_use]
    pub fn all_finished(&self) -> bool {
        self.slots[..self.actual_batch_size]
            .iter()
            .all(|s| s.phase != SlotPhase::Running)
    }

    /// Generation step count of slot `batch_idx`.
    #[must_use]
    pub fn step(&self, batch_idx: usize) -> usize {
        self.slots[batch_idx].step
    }

    fn check_poisoned(&self) -> Result<()> {
        match &self.poisoned {
            Some(msg) => Err(Error::SessionPoisoned(msg.clone())),
            None => Ok(()),
        }
    }

    /// Arm slot `batch_idx` with a new request.
    ///
    /// # Errors
    /// Returns `PreconditionViolation` when the slot index, beam width, or
    /// length budget is out of range; `SessionPoisoned` after a device fault.
    pub fn new_request(
        &mut self,
        batch_idx: usize,
        request: &Request,
        sampling_config: &SamplingConfig,
    ) -> Result<()> {
        debug!(batch_idx, "decoder batch new_request");
        self.check_poisoned()?;

        if batch_idx >= self.slots.len() {
            return Err(Error::PreconditionViolation(format!(
                "batch index {batch_idx} out of range ({} slots)",
                self.slots.len()
            )));
        }
        let beam_width = sampling_config.beam_width;
        if beam_width == 0 || beam_width > self.max_beam_width {
            return Err(Error::PreconditionViolation(format!(
                "beam width {beam_width} must be in [1, {}]",
                self.max_beam_width
            )));
        }
        let input_length = request.ids.numel();
        let max_new_tokens = request
            .max_new_tokens
            .unwrap_or(self.max_seq_len.saturating_sub(input_length));
        if input_length + max_new_tokens > self.max_seq_len {
            return Err(Error::PreconditionViolation(format!(
                "input length ({input_length}) + max new tokens ({max_new_tokens}) must not \
                 exceed max sequence length ({})",
                self.max_seq_len
            )));
        }

        let end_id = request.end_id.unwrap_or(self.vocab_size as i32 - 1);
        let pad_id = request.pad_id.unwrap_or(self.vocab_size as i32 - 1);

        let decoder = &mut self.decoders[batch_idx];
        decoder.setup(sampling_config.clone());
        self.joint.init_slot(
            batch_idx,
            raw_stream(decoder.stream()),
            beam_width,
            input_length,
            max_new_tokens,
            end_id,
            sampling_config.random_seed_value(),
            sampling_config.top_p_value(),
            &request.ids,
        )?;

        self.slots[batch_idx] = SlotState {
            phase: SlotPhase::Running,
            beam_width,
            step: 0,
            input_length,
            max_new_tokens,
            end_id,
            pad_id,
            embedding_bias: request.embedding_bias.clone(),
            bad_words: request.bad_words.clone(),
            stop_words: request.stop_words.clone(),
        };
        Ok(())
    }

    /// Split a dense or packed batch into per-slot requests.
    ///
    /// # Errors
    /// Propagates `new_request` failures; rejects oversized batches.
    pub fn new_batch(&mut self, inputs: &BatchInput, sampling_config: &SamplingConfig) -> Result<()> {
        self.check_poisoned()?;
        let batch_size = inputs.lengths.len();
        if batch_size > self.slots.len() {
            return Err(Error::PreconditionViolation(format!(
                "batch size {batch_size} exceeds max batch size {}",
                self.slots.len()
            )));
        }
        self.actual_batch_size = batch_size;

        let mut input_offset = 0usize;
        for batch_idx in 0..batch_size {
            let input_length = inputs.lengths[batch_idx];
            let ids_view = if inputs.packed {
                let view = inputs.ids.slice_view(input_offset, &[input_length]);
                input_offset += input_length;
                view
            } else {
                inputs.ids.index_dim0(batch_idx).slice_view(0, &[input_length])
            };
            let request = Request {
                ids: ids_view,
                max_new_tokens: inputs.max_new_tokens,
                end_id: inputs.end_id,
                pad_id: inputs.pad_id,
                embedding_bias: inputs.embedding_bias.clone(),
                bad_words: inputs.bad_words.clone(),
                stop_words: inputs.stop_words.clone(),
            };
            self.new_request(batch_idx, &request, &sampling_config.extract(batch_idx))?;
        }
        Ok(())
    }

    /// Run one decoding step for every active, unfinished slot.
    ///
    /// The host suspends exactly once, on the stop event, to read the
    /// finished counters and update the slot lifecycle.
    ///
    /// # Errors
    /// `PreconditionViolation` on shape or indirection mismatches (before
    /// any launch); `SessionPoisoned` after an earlier device fault; any
    /// launch failure poisons the decoder and is returned.
    pub fn forward(
        &mut self,
        output: &ForwardOutput<'_>,
        input: &ForwardInput<'_, T>,
    ) -> Result<()> {
        debug!(actual_batch_size = self.actual_batch_size, "decoder batch forward");
        self.check_poisoned()?;

        let logits_shape = input.logits.shape();
        let expected = [
            self.actual_batch_size,
            self.max_beam_width,
            self.vocab_size_padded,
        ];
        if logits_shape != expected {
            return Err(Error::PreconditionViolation(format!(
                "logits shape {logits_shape:?} does not match expected {expected:?}"
            )));
        }
        if input.src_cache_indirection.is_some() != output.tgt_cache_indirection.is_some() {
            return Err(Error::PreconditionViolation(
                "specify both source and target cache indirection or neither".into(),
            ));
        }
        if let Some(active) = input.active {
            if active.len() != self.actual_batch_size {
                return Err(Error::PreconditionViolation(format!(
                    "active mask length {} does not match batch size {}",
                    active.len(),
                    self.actual_batch_size
                )));
            }
        }

        match self.forward_unchecked(output, input) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.poisoned = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn forward_unchecked(
        &mut self,
        output: &ForwardOutput<'_>,
        input: &ForwardInput<'_, T>,
    ) -> Result<()> {
        let main = default_stream(self.ctx.device());
        self.event_start.record(main)?;

        for i in 0..self.actual_batch_size {
            let slot = &self.slots[i];
            if slot.phase != SlotPhase::Running {
                continue;
            }
            if let Some(active) = input.active {
                if !active[i] {
                    continue;
                }
            }
            let beam_width = slot.beam_width;
            let decoder = &self.decoders[i];
            let stream = raw_stream(decoder.stream());
            self.event_start.wait(stream)?;

            let logits_view = input
                .logits
                .index_dim0(i)
                .slice_view(0, &[beam_width, self.vocab_size_padded]);
            let indir_rows = |t: &CudaTensor<i32>| {
                let inner = *t.shape().last().expect("indirection is 3-d");
                t.index_dim0(i).slice_view(0, &[beam_width, inner])
            };
            let step_input = SlotStepInput {
                logits: logits_view,
                step: slot.step,
                input_length: slot.input_length,
                max_seq_len: self.max_seq_len,
                end_id: slot.end_id,
                embedding_bias: slot.embedding_bias.as_ref(),
                bad_words: slot.bad_words.as_ref(),
                stop_words: slot.stop_words.as_ref(),
                src_cache_indirection: input.src_cache_indirection.map(&indir_rows),
                tgt_cache_indirection: output.tgt_cache_indirection.map(&indir_rows),
            };

            let views = self.joint.slot_views(i);
            decoder.forward_async(&views, &step_input)?;

            self.events[i].record(stream)?;
            self.events[i].wait(main)?;
            self.slots[i].step += 1;
        }

        self.event_stop.record(main)?;
        // The single host suspension point of the step.
        self.event_stop.synchronize()?;

        for i in 0..self.actual_batch_size {
            let slot = &mut self.slots[i];
            if slot.phase != SlotPhase::Running {
                continue;
            }
            if let Some(active) = input.active {
                if !active[i] {
                    continue;
                }
            }
            let finished_beams = self.joint.finished_sum.read(i);
            if slot.step >= slot.max_new_tokens || finished_beams as usize == slot.beam_width {
                slot.phase = SlotPhase::Finished;
            }
        }
        Ok(())
    }

    /// Finalise slot `batch_idx`: reconstruct the best beams and rewrite the
    /// slot's output ids in place.
    ///
    /// # Errors
    /// Returns an error if a launch fails; `SessionPoisoned` after a fault.
    pub fn post_process_request(&mut self, batch_idx: usize) -> Result<()> {
        debug!(batch_idx, "decoder batch post_process_request");
        self.check_poisoned()?;
        let slot = &self.slots[batch_idx];
        if slot.phase == SlotPhase::Idle {
            return Ok(());
        }

        let main = default_stream(self.ctx.device());
        let decoder = &self.decoders[batch_idx];
        let stream = raw_stream(decoder.stream());
        self.event_start.wait(stream)?;

        let views = self.joint.slot_views(batch_idx);
        decoder.gather_tree_async(&views, slot.input_length, self.max_seq_len, slot.end_id)?;

        self.events[batch_idx].record(stream)?;
        self.events[batch_idx].wait(main)?;
        Ok(())
    }

    /// Post-process every slot of the batch and return the final output ids
    /// view, `[actual_batch, max_beam, max_seq]`.
    ///
    /// # Errors
    /// Propagates `post_process_request` failures.
    pub fn get_final_output_ids(&mut self) -> Result<CudaTensor<i32>> {
        for batch_idx in 0..self.actual_batch_size {
            self.post_process_request(batch_idx)?;
        }
        Ok(self.joint.ids.slice_view(
            0,
            &[self.actual_batch_size, self.max_beam_width, self.max_seq_len],
        ))
    }
}
