//! Joint decoding tensors and their per-slot views.
//!
//! Everything a decode step reads or writes lives in tensors allocated once
//! at setup with `[max_batch, max_beam, max_seq]` capacity. A slot's views
//! are non-overlapping contiguous slices along dimension 0, so slot-stream
//! writes land in the joint tensors without a copy-back.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::missing_panics_doc)]

use cudarc::driver::sys::CUstream;

use crate::cuda::stream::{memcpy_dtod_async, memset_d32_async, memset_d8_async, PinnedBuffer};
use crate::cuda::{CudaContext, CudaTensor};
use crate::Result;

/// Cumulative log-probability fill for non-primary beams, so the first
/// beam-search step never prefers an empty beam.
pub const NEG_INFINITY_FILL: f32 = f32::NEG_INFINITY;

/// The joint decoding state, owned by the scheduler.
pub struct JointBuffers {
    /// Output token ids, `[max_batch, max_beam, max_seq]`.
    pub ids: CudaTensor<i32>,
    /// Beam parent indices, same shape as `ids` (beam search only).
    pub parent_ids: CudaTensor<i32>,
    /// Token produced this step, `[max_batch, max_beam]`.
    pub new_tokens: CudaTensor<i32>,
    /// Current sequence length per beam, `[max_batch, max_beam]`.
    pub lengths: CudaTensor<i32>,
    /// Per-beam finished flags, `[max_batch, max_beam]`.
    pub finished: CudaTensor<u8>,
    /// Cumulative log-probabilities, `[max_batch, max_beam]`.
    pub cum_log_probs: CudaTensor<f32>,
    /// End-of-sequence token per beam, `[max_batch, max_beam]`.
    pub end_ids: CudaTensor<i32>,
    /// `input_length + max_new_tokens` per slot, `[max_batch]`.
    pub sequence_limits: CudaTensor<i32>,
    /// Finished-beam counters in device-mapped pinned memory, `[max_batch]`.
    pub finished_sum: PinnedBuffer<i32>,
    /// Beam hypotheses ring: parent beam, end position, normalised score,
    /// and per-slot count.
    pub hyp_parent: CudaTensor<i32>,
    pub hyp_pos: CudaTensor<i32>,
    pub hyp_score: CudaTensor<f32>,
    pub hyp_count: CudaTensor<i32>,
    /// Per-slot sampling state.
    pub rng_states: CudaTensor<u64>,
    pub runtime_top_p: CudaTensor<f32>,
    /// Gather-tree scratch, `[max_batch, max_beam, max_seq]`.
    pub final_ids: CudaTensor<i32>,

    max_batch_size: usize,
    max_beam_width: usize,
    max_seq_len: usize,
}

/// Non-owning views of one slot's state (dimension-0 slices of the joint
/// tensors).
pub struct SlotViews {
    pub ids: CudaTensor<i32>,
    pub parent_ids: CudaTensor<i32>,
    pub new_tokens: CudaTensor<i32>,
    pub lengths: CudaTensor<i32>,
    pub finished: CudaTensor<u8>,
    pub cum_log_probs: CudaTensor<f32>,
    pub end_ids: CudaTensor<i32>,
    pub sequence_limit: CudaTensor<i32>,
    pub finished_sum_dev: u64,
    pub hyp_parent: CudaTensor<i32>,
    pub hyp_pos: CudaTensor<i32>,
    pub hyp_score: CudaTensor<f32>,
    pub hyp_count: CudaTensor<i32>,
    pub rng_state: CudaTensor<u64>,
    pub runtime_top_p: CudaTensor<f32>,
    pub final_ids: CudaTensor<i32>,
}

impl JointBuffers {
    /// Allocate all joint tensors at full capacity, zeroed.
    ///
    /// # Errors
    /// Returns an error if GPU or pinned allocation fails.
    pub fn new(
        ctx: &CudaContext,
        max_batch_size: usize,
        max_beam_width: usize,
        max_seq_len: usize,
    ) -> Result<Self> {
        let b = max_batch_size;
        let w = max_beam_width;
        let s = max_seq_len;
        Ok(Self {
            ids: CudaTensor::zeros(ctx, &[b, w, s])?,
            parent_ids: CudaTensor::zeros(ctx, &[b, w, s])?,
            new_tokens: CudaTensor::zeros(ctx, &[b, w])?,
            lengths: CudaTensor::zeros(ctx, &[b, w])?,
            finished: CudaTensor::zeros(ctx, &[b, w])?,
            cum_log_probs: CudaTensor::zeros(ctx, &[b, w])?,
            end_ids: CudaTensor::zeros(ctx, &[b, w])?,
            sequence_limits: CudaTensor::zeros(ctx, &[b])?,
            finished_sum: PinnedBuffer::new(ctx.device(), b)?,
            hyp_parent: CudaTensor::zeros(ctx, &[b, w])?,
            hyp_pos: CudaTensor::zeros(ctx, &[b, w])?,
            hyp_score: CudaTensor::zeros(ctx, &[b, w])?,
            hyp_count: CudaTensor::zeros(ctx, &[b])?,
            rng_states: CudaTensor::zeros(ctx, &[b])?,
            runtime_top_p: CudaTensor::zeros(ctx, &[b])?,
            final_ids: CudaTensor::zeros(ctx, &[b, w, s])?,
            max_batch_size: b,
            max_beam_width: w,
            max_seq_len: s,
        })
    }

    /// Maximum batch size the buffers were sized for.
    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Maximum beam width the buffers were sized for.
    #[must_use]
    pub fn max_beam_width(&self) -> usize {
        self.max_beam_width
    }

    /// Maximum sequence length the buffers were sized for.
    #[must_use]
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Carve out slot `batch_idx`'s views.
    ///
    /// # Panics
    /// Panics if `batch_idx` is out of range.
    #[must_use]
    pub fn slot_views(&self, batch_idx: usize) -> SlotViews {
        SlotViews {
            ids: self.ids.index_dim0(batch_idx),
            parent_ids: self.parent_ids.index_dim0(batch_idx),
            new_tokens: self.new_tokens.index_dim0(batch_idx),
            lengths: self.lengths.index_dim0(batch_idx),
            finished: self.finished.index_dim0(batch_idx),
            cum_log_probs: self.cum_log_probs.index_dim0(batch_idx),
            end_ids: self.end_ids.index_dim0(batch_idx),
            sequence_limit: self.sequence_limits.slice_view(batch_idx, &[1]),
            finished_sum_dev: self.finished_sum.device_ptr_at(batch_idx),
            hyp_parent: self.hyp_parent.index_dim0(batch_idx),
            hyp_pos: self.hyp_pos.index_dim0(batch_idx),
            hyp_score: self.hyp_score.index_dim0(batch_idx),
            hyp_count: self.hyp_count.slice_view(batch_idx, &[1]),
            rng_state: self.rng_states.slice_view(batch_idx, &[1]),
            runtime_top_p: self.runtime_top_p.slice_view(batch_idx, &[1]),
            final_ids: self.final_ids.index_dim0(batch_idx),
        }
    }

    /// Apply the slot fill policy for a new request, entirely on `stream`.
    ///
    /// End ids and output ids are filled with the end token, the sequence
    /// limit with `input_length + max_new_tokens`, lengths with the input
    /// length, finished flags and hypotheses are cleared, the first beam's
    /// cumulative log-probability is zeroed and the rest set to `-inf`, and
    /// the prompt is tiled across `beam_width` copies.
    ///
    /// # Errors
    /// Returns an error if a fill or copy enqueue fails.
    #[allow(clippy::too_many_arguments)]
    pub fn init_slot(
        &mut self,
        batch_idx: usize,
        stream: CUstream,
        beam_width: usize,
        input_length: usize,
        max_new_tokens: usize,
        end_id: i32,
        seed: u64,
        top_p: f32,
        prompt: &CudaTensor<i32>,
    ) -> Result<()> {
        let views = self.slot_views(batch_idx);
        let w = beam_width;
        let s = self.max_seq_len;

        memset_d32_async(views.end_ids.device_ptr(), end_id as u32, self.max_beam_width, stream)?;
        memset_d32_async(
            views.sequence_limit.device_ptr(),
            (input_length + max_new_tokens) as u32,
            1,
            stream,
        )?;
        memset_d32_async(
            views.lengths.device_ptr(),
            input_length as u32,
            self.max_beam_width,
            stream,
        )?;
        memset_d8_async(views.finished.device_ptr(), 0, self.max_beam_width, stream)?;
        memset_d32_async(views.new_tokens.device_ptr(), 0, self.max_beam_width, stream)?;

        // First beam starts live, the rest at -inf.
        memset_d32_async(views.cum_log_probs.device_ptr(), 0f32.to_bits(), 1, stream)?;
        if w > 1 {
            memset_d32_async(
                views.cum_log_probs.device_ptr_at(1),
                NEG_INFINITY_FILL.to_bits(),
                w - 1,
                stream,
            )?;
        }

        memset_d32_async(views.hyp_count.device_ptr(), 0, 1, stream)?;
        memset_d32_async(views.parent_ids.device_ptr(), 0, w * s, stream)?;

        // RNG seed (two 32-bit halves) and the initial runtime top-p.
        memset_d32_async(views.rng_state.device_ptr(), (seed & 0xffff_ffff) as u32, 1, stream)?;
        memset_d32_async(views.rng_state.device_ptr() + 4, (seed >> 32) as u32, 1, stream)?;
        memset_d32_async(views.runtime_top_p.device_ptr(), top_p.to_bits(), 1, stream)?;

        // Output ids: end-token fill, then the prompt tiled across beams.
        memset_d32_async(views.ids.device_ptr(), end_id as u32, w * s, stream)?;
        let prompt_bytes = input_length * std::mem::size_of::<i32>();
        for beam in 0..w {
            memcpy_dtod_async(
                views.ids.device_ptr_at(beam * s),
                prompt.device_ptr(),
                prompt_bytes,
                stream,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cuda::stream::default_stream;

    #[test]
    fn slot_views_are_disjoint_dim0_slices() {
        let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
        let joint = JointBuffers::new(&ctx, 3, 2, 16).unwrap();

        let v0 = joint.slot_views(0);
        let v1 = joint.slot_views(1);
        assert_eq!(v0.ids.shape(), &[2, 16]);
        assert_eq!(
            v1.ids.device_ptr() - v0.ids.device_ptr(),
            (2 * 16 * std::mem::size_of::<i32>()) as u64
        );
        assert_ne!(v0.finished_sum_dev, v1.finished_sum_dev);
    }

    #[test]
    fn init_slot_fill_policy() {
        let ctx = CudaContext::new(0).expect("Failed to create CUDA context");
        let mut joint = JointBuffers::new(&ctx, 2, 2, 8).unwrap();
        let stream = default_stream(ctx.device());

        let prompt = CudaTensor::from_slice(&ctx, &[3], &[11i32, 12, 13]).unwrap();
        joint
            .init_slot(1, stream, 2, 3, 4, 50256, 42, 0.9, &prompt)
            .unwrap();
        ctx.synchronize().unwrap();

        let views = joint.slot_views(1);
        // Prompt tiled across both beams, end-token fill beyond.
        assert_eq!(
            views.ids.to_vec().unwrap(),
            vec![
                11, 12, 13, 50256, 50256, 50256, 50256, 50256, //
                11, 12, 13, 50256, 50256, 50256, 50256, 50256,
            ]
        );
        assert_eq!(views.lengths.to_vec().unwrap(), vec![3, 3]);
        assert_eq!(views.sequence_limit.to_vec().unwrap(), vec![7]);
        assert_eq!(views.end_ids.to_vec().unwrap(), vec![50256, 50256]);
        assert_eq!(views.finished.to_vec().unwrap(), vec![0, 0]);

        let clp = views.cum_log_probs.to_vec().unwrap();
        assert_eq!(clp[0], 0.0);
        assert_eq!(clp[1], f32::NEG_INFINITY);

        // Slot 0 untouched.
        let other = joint.slot_views(0);
        assert_eq!(other.lengths.to_vec().unwrap(), vec![0, 0]);
    }
}
