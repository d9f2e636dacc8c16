//! Per-request decoding: joint I/O buffers, the single-slot decoder, and
//! the batched slot scheduler.

pub mod io;
pub mod scheduler;
pub mod slot;

pub use io::{JointBuffers, SlotViews};
pub use scheduler::{BatchInput, DecoderBatch, ForwardInput, ForwardOutput, Request};
pub use slot::{SlotDecoder, SlotStepInput};
