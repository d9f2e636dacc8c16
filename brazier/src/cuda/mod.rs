//! CUDA backend: context, streams and events, device tensors, KV cache
//! views, kernel launch wrappers, and the attention step dispatcher.

pub mod attention;
mod context;
pub mod kv_cache;
pub mod ops;
pub mod stream;
mod tensor;

pub use attention::{
    AttentionConfig, AttentionDispatcher, ContextParams, GenerationParams, MultiBlockWorkspace,
    PositionEmbedding,
};
pub use context::CudaContext;
pub use kv_cache::{BlockAllocator, CacheShape, KvCacheManager, KvCacheView};
pub use stream::{CudaEvent, PinnedBuffer};
pub use tensor::CudaTensor;
