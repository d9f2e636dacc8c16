//! brazier: batched token decoding and attention step dispatch on CUDA.
//!
//! The crate sits on top of a compiled transformer engine: the engine
//! produces logits, the [`decoder::DecoderBatch`] drives per-slot sampling
//! or beam search on dedicated streams, and the
//! [`cuda::AttentionDispatcher`] orchestrates the context and generation
//! attention kernels over a paged or linear KV cache.

pub mod cuda;
pub mod dtype;
pub mod error;
pub mod sampling;

pub mod decoder;

pub use cuda::{
    AttentionConfig, AttentionDispatcher, CacheShape, CudaContext, CudaTensor, KvCacheManager,
    KvCacheView, MultiBlockWorkspace, PositionEmbedding,
};
pub use decoder::{BatchInput, DecoderBatch, ForwardInput, ForwardOutput, Request};
pub use dtype::{CacheQuant, DType, TensorDType};
pub use error::{Error, Result};
pub use sampling::SamplingConfig;
