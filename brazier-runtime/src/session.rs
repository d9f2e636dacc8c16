//! Session driver: binds a compiled engine to the decoder batch.
//!
//! `generate` runs the outer loop: engine execution produces logits, the
//! decoder batch advances every slot one token, the per-token callback
//! fires, and the loop stops when all slots are finished. Optionally each
//! generation step is captured into a CUDA graph and replayed, ping-ponging
//! between two executors so the previous instance stays launchable while
//! the next is updated.

#![allow(clippy::cast_possible_truncation, clippy::missing_panics_doc)]

use tracing::debug;

use brazier::cuda::stream::{default_stream, memset_d8_async};
use brazier::cuda::{CacheShape, KvCacheManager};
use brazier::decoder::{BatchInput, DecoderBatch, ForwardInput, ForwardOutput};
use brazier::error::Error;
use brazier::{CacheQuant, CudaContext, CudaTensor, Result, SamplingConfig, TensorDType};

use crate::engine::{ContextStepInput, Engine, GenerationStepInput};
use crate::graph::CudaGraphExecutor;

/// Sizing and mode switches for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_batch_size: usize,
    pub max_beam_width: usize,
    pub max_seq_length: usize,
    pub cache_quant: CacheQuant,
    /// Capture and replay each decode step as a CUDA graph. The engine must
    /// keep its bindings at fixed addresses across steps.
    pub cuda_graph_mode: bool,
    /// Paged-pool size override; defaults to full capacity for every lane.
    pub kv_cache_blocks: Option<usize>,
}

/// Per-step callback: `(output_ids, step, all_finished)`.
pub type TokenCallback<'a> = dyn FnMut(&CudaTensor<i32>, usize, bool) + 'a;

/// A generation session over one engine.
pub struct Session<T: TensorDType, E: Engine<T>> {
    ctx: CudaContext,
    engine: E,
    config: SessionConfig,
    decoder: DecoderBatch<T>,
    kv_cache: KvCacheManager,
    /// Ping-pong cache indirection, `[max_batch, max_beam, max_seq]` each.
    cache_indirection: [CudaTensor<i32>; 2],
    graphs: [CudaGraphExecutor; 2],
}

impl<T: TensorDType, E: Engine<T>> Session<T, E> {
    /// Build the session: decoder batch, KV cache manager, indirection
    /// buffers, and graph executors, sized from the engine descriptor.
    ///
    /// # Errors
    /// Returns `PreconditionViolation`/`ConfigConflict` on bad sizing and
    /// propagates allocation failures.
    pub fn setup(ctx: &CudaContext, engine: E, config: SessionConfig) -> Result<Self> {
        let ec = engine.config().clone();
        let decoder = DecoderBatch::setup(
            ctx,
            ec.vocab_size,
            ec.vocab_size_padded,
            config.max_batch_size,
            config.max_beam_width,
            config.max_seq_length,
        )?;

        // One cache lane per (request, beam).
        let lanes = config.max_batch_size * config.max_beam_width;
        let shape = CacheShape::new(ec.num_kv_heads, ec.head_size, ec.dtype, config.cache_quant);
        let kv_cache = if ec.paged_kv_cache {
            if ec.tokens_per_block == 0 {
                return Err(Error::ConfigConflict(
                    "paged KV cache requires tokens_per_block > 0".into(),
                ));
            }
            let max_blocks_per_seq = config.max_seq_length.div_ceil(ec.tokens_per_block);
            let num_blocks = config
                .kv_cache_blocks
                .unwrap_or(2 * lanes * max_blocks_per_seq);
            KvCacheManager::paged(
                ctx,
                ec.num_layers,
                lanes,
                ec.tokens_per_block,
                num_blocks,
                max_blocks_per_seq,
                shape,
            )?
        } else {
            KvCacheManager::linear(ctx, ec.num_layers, lanes, config.max_seq_length, shape)?
        };

        let indir_shape = [
            config.max_batch_size,
            config.max_beam_width,
            config.max_seq_length,
        ];
        Ok(Self {
            ctx: ctx.clone(),
            engine,
            decoder,
            kv_cache,
            cache_indirection: [
                CudaTensor::zeros(ctx, &indir_shape)?,
                CudaTensor::zeros(ctx, &indir_shape)?,
            ],
            graphs: [
                CudaGraphExecutor::new(ctx.device()),
                CudaGraphExecutor::new(ctx.device()),
            ],
            config,
        })
    }

    /// The underlying engine.
    #[must_use]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The decoder batch (accessors for lengths, log-probs, parent ids).
    #[must_use]
    pub fn decoder(&self) -> &DecoderBatch<T> {
        &self.decoder
    }

    /// Run a full generation: context phase, then one decode step per token
    /// until every slot finishes, then the final gather.
    ///
    /// Returns the final output ids, `[batch, max_beam, max_seq]`. The
    /// callback, when given, fires once per step after the decoder join.
    ///
    /// # Errors
    /// Propagates decoder preconditions, engine failures, and device
    /// faults; after a fault the session fails fast.
    pub fn generate(
        &mut self,
        inputs: &BatchInput,
        sampling_config: &SamplingConfig,
        mut callback: Option<&mut TokenCallback<'_>>,
    ) -> Result<CudaTensor<i32>> {
        let batch_size = inputs.lengths.len();
        debug!(batch_size, beam_width = sampling_config.beam_width, "session generate");
        let beam_width = sampling_config.beam_width;
        let use_indirection = beam_width > 1;

        // Reserve cache room for every lane up to its sequence limit.
        for (i, &len) in inputs.lengths.iter().enumerate() {
            let limit = len + inputs
                .max_new_tokens
                .unwrap_or(self.config.max_seq_length.saturating_sub(len));
            for beam in 0..self.config.max_beam_width {
                self.kv_cache
                    .begin_sequence(i * self.config.max_beam_width + beam, limit)?;
            }
        }

        self.decoder.new_batch(inputs, sampling_config)?;

        let main = default_stream(self.ctx.device());
        for indir in &self.cache_indirection {
            memset_d8_async(
                indir.device_ptr(),
                0,
                indir.numel() * std::mem::size_of::<i32>(),
                main,
            )?;
        }

        let lengths_dev = CudaTensor::from_slice(
            &self.ctx,
            &[batch_size],
            &inputs.lengths.iter().map(|&l| l as i32).collect::<Vec<_>>(),
        )?;

        let mut logits = self.engine.context_step(
            &ContextStepInput {
                ids: &inputs.ids,
                lengths: &lengths_dev,
                host_lengths: &inputs.lengths,
                beam_width: self.config.max_beam_width,
            },
            &mut self.kv_cache,
        )?;

        for step in 0..self.config.max_seq_length {
            let src = &self.cache_indirection[step % 2];
            let tgt = &self.cache_indirection[(step + 1) % 2];

            self.decoder.forward(
                &ForwardOutput {
                    tgt_cache_indirection: use_indirection.then_some(tgt),
                },
                &ForwardInput {
                    logits: &logits,
                    active: None,
                    src_cache_indirection: use_indirection.then_some(src),
                },
            )?;

            let done = self.decoder.all_finished();
            if let Some(cb) = callback.as_deref_mut() {
                cb(self.decoder.output_ids(), step, done);
            }
            if done {
                break;
            }

            let new_tokens = self
                .decoder
                .new_tokens()
                .slice_view(0, &[batch_size, self.config.max_beam_width]);
            let sequence_lengths = self
                .decoder
                .lengths()
                .slice_view(0, &[batch_size, self.config.max_beam_width]);
            let gen_input = GenerationStepInput {
                new_tokens: &new_tokens,
                sequence_lengths: &sequence_lengths,
                cache_indirection: tgt,
                step,
            };

            logits = if self.config.cuda_graph_mode {
                let graph = &mut self.graphs[step % 2];
                graph.begin_capture()?;
                let out = self.engine.generation_step(&gen_input, &mut self.kv_cache);
                match out {
                    Ok(out) => {
                        graph.end_capture()?;
                        graph.launch()?;
                        out
                    }
                    Err(e) => return Err(e),
                }
            } else {
                self.engine.generation_step(&gen_input, &mut self.kv_cache)?
            };
        }

        let final_ids = self.decoder.get_final_output_ids()?;
        self.ctx.synchronize()?;

        for i in 0..batch_size {
            for beam in 0..self.config.max_beam_width {
                self.kv_cache
                    .end_sequence(i * self.config.max_beam_width + beam);
            }
        }
        Ok(final_ids)
    }
}
