use thiserror::Error;

use crate::validate::ValidationError;

/// Error taxonomy for the pipeline.
///
/// Propagation policy, in short: validation and duplicate errors are
/// terminal where they are detected and never escape past intake;
/// concurrency and store errors are retried locally and dead-letter the
/// envelope once the bound is exhausted; publish and integration errors
/// never reach the intake/commit path.
#[derive(Error, Debug)]
pub enum UniflowError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("duplicate or stale event: {0}")]
    DuplicateOrStale(String),

    #[error("optimistic concurrency conflict on {0}")]
    ConcurrencyConflict(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("integration error: {0}")]
    Integration(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
