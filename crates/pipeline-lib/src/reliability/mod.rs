//! Reliability primitives shared by pipeline stages
//!
//! - Bounded stage queues with block, drop-oldest and spill-to-disk policies
//! - Checksummed append-only checkpoints with compaction
//! - Circuit breaker and retry with jittered exponential backoff

mod backpressure;
mod checkpoint;
mod circuit_breaker;
mod retry;
mod spill;

pub use backpressure::{
    BackpressureError, BackpressurePolicy, PushOutcome, StageQueue, StageQueueConfig,
};
pub use checkpoint::{CheckpointConfig, CheckpointRecord, CheckpointStore};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Rejected};
pub use retry::{retry, Exhausted, RetryPolicy};
pub use spill::SpillQueue;
