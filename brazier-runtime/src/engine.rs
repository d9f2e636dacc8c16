//! The compiled-engine boundary.
//!
//! The session consumes an engine as a blob behind this trait: a descriptor
//! naming the model geometry and feature flags, plus one method per phase
//! that runs the compiled graph on the main stream and returns the logits
//! tensor. Everything inside the engine (kernels, weights, graph layout) is
//! opaque to the runtime.

use brazier::cuda::KvCacheManager;
use brazier::{CudaTensor, DType, Result, TensorDType};
use serde::{Deserialize, Serialize};

/// Engine descriptor: model geometry and feature flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub num_layers: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub vocab_size: usize,
    pub vocab_size_padded: usize,
    pub dtype: DType,
    /// The engine was built with the fused attention plugin.
    pub attention_plugin: bool,
    /// Inputs are packed variable-length rather than padded.
    pub packed_input: bool,
    /// KV cache uses paged storage.
    pub paged_kv_cache: bool,
    /// Tokens per block when paged.
    pub tokens_per_block: usize,
}

impl EngineConfig {
    /// Parse a descriptor from its JSON form.
    ///
    /// # Errors
    /// Returns an error if the JSON does not match the descriptor.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Inputs to the context (prefill) execution.
pub struct ContextStepInput<'a> {
    /// `[batch, max_input_len]` dense or `[1, sum(lengths)]` packed.
    pub ids: &'a CudaTensor<i32>,
    /// `[batch]` device copy of the input lengths.
    pub lengths: &'a CudaTensor<i32>,
    /// Host copy of the input lengths.
    pub host_lengths: &'a [usize],
    pub beam_width: usize,
}

/// Inputs to one generation-step execution.
pub struct GenerationStepInput<'a> {
    /// Tokens sampled last step, `[batch, beam]`.
    pub new_tokens: &'a CudaTensor<i32>,
    /// Current sequence length per lane, `[batch, beam]`.
    pub sequence_lengths: &'a CudaTensor<i32>,
    /// Per-beam cache indirection, `[batch, beam, max_seq]`.
    pub cache_indirection: &'a CudaTensor<i32>,
    /// Generation step index (0 for the first generated token).
    pub step: usize,
}

/// A compiled engine execution context.
///
/// Both methods run asynchronously on the main stream and return logits of
/// shape `[batch, beam, vocab_size_padded]`.
pub trait Engine<T: TensorDType> {
    /// The engine descriptor.
    fn config(&self) -> &EngineConfig;

    /// Run the context phase over the whole prompt batch.
    ///
    /// # Errors
    /// Returns an error if engine execution fails.
    fn context_step(
        &mut self,
        input: &ContextStepInput<'_>,
        kv_cache: &mut KvCacheManager,
    ) -> Result<CudaTensor<T>>;

    /// Run one generation step.
    ///
    /// # Errors
    /// Returns an error if engine execution fails.
    fn generation_step(
        &mut self,
        input: &GenerationStepInput<'_>,
        kv_cache: &mut KvCacheManager,
    ) -> Result<CudaTensor<T>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_json_roundtrip() {
        let json = r#"{
            "num_layers": 2,
            "num_heads": 8,
            "num_kv_heads": 2,
            "head_size": 64,
            "vocab_size": 50257,
            "vocab_size_padded": 50304,
            "dtype": "F16",
            "attention_plugin": true,
            "packed_input": false,
            "paged_kv_cache": true,
            "tokens_per_block": 64
        }"#;
        let config = EngineConfig::from_json(json).unwrap();
        assert_eq!(config.num_heads, 8);
        assert_eq!(config.dtype, DType::F16);
        assert!(config.paged_kv_cache);
        assert_eq!(config.tokens_per_block, 64);
    }
}
