//! Ordered intake: the queue boundary, source-facing producers, and the
//! worker loop that drives envelopes through the rule engine.
//!
//! The queue's per-identity delivery lease is the pipeline's only ordering
//! primitive: for one identity key, envelopes arrive in submission order
//! and never concurrently; across keys, workers run fully parallel.

pub mod producer;
pub mod queue;
pub mod worker;

pub use producer::{PullSource, QueueSender, Receiver, SourceProcessor};
pub use queue::{DeadLetter, IntakeQueue, MemoryQueue};
pub use worker::PipelineWorker;
