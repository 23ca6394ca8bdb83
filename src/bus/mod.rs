//! Exclusive bus access and atomic multi-step exchanges.

pub mod lock;
pub mod sequence;

pub use lock::{BusGuard, BusLock};
pub use sequence::{
    block_body, AtomicSequence, SequenceCursor, SequenceOutput, SequenceStep, StepCallback,
};
