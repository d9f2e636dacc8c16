//! brazier-runtime: the session driver that binds a compiled engine's
//! execution context to the brazier decoder batch.

pub mod engine;
pub mod graph;
pub mod session;

pub use engine::{ContextStepInput, Engine, EngineConfig, GenerationStepInput};
pub use graph::CudaGraphExecutor;
pub use session::{Session, SessionConfig, TokenCallback};
