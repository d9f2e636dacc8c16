//! Error types for brazier

use thiserror::Error;

/// Result type alias using brazier's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for brazier operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("CUDA error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),

    #[error("cuBLAS error: {0}")]
    CuBlas(#[from] cudarc::cublas::result::CublasError),

    #[error("NVRTC error: {0}")]
    Nvrtc(#[from] cudarc::nvrtc::result::NvrtcError),

    #[error("CUDA driver call failed: {0}")]
    Driver(String),

    /// A caller-visible precondition failed before any kernel launch.
    #[error("Precondition violation: {0}")]
    PreconditionViolation(String),

    /// Unsupported dtype / device capability combination, detected at setup.
    #[error("Configuration conflict: {0}")]
    ConfigConflict(String),

    /// A previous device fault poisoned this decoder; subsequent calls fail fast.
    #[error("Session poisoned by earlier device fault: {0}")]
    SessionPoisoned(String),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}
