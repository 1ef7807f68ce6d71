//! Source-facing producers: validate first, enqueue second.
//!
//! A source system hands over raw data; a `SourceProcessor` turns it into
//! validated envelopes, and the `Receiver` feeds them to the intake queue
//! partitioned by identity key. Invalid input never reaches the queue.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};
use uniflow_common::{EventEnvelope, UniflowError, ValidationError};

/// Write side of the intake queue. The identity key is the session: the
/// transport must keep envelopes sharing a key in submission order.
#[async_trait]
pub trait QueueSender: Send + Sync {
    async fn send(&self, envelope: EventEnvelope) -> Result<(), UniflowError>;
}

/// Turns one raw source payload into zero or more validated envelopes.
///
/// Implementations own the source's schema knowledge; the surrounding
/// plumbing (error logging, enqueueing) is shared.
pub trait SourceProcessor: Send + Sync {
    fn source_system(&self) -> &str;

    fn process(&self, raw: &Value) -> Result<Vec<EventEnvelope>, ValidationError>;
}

/// A source the pipeline pulls from instead of being pushed by. Scheduling
/// of the pull is the host's business; this is only the fetch contract.
#[async_trait]
pub trait PullSource: SourceProcessor {
    /// Fetch the next batch of raw payloads from the source system.
    async fn fetch(&self) -> Result<Vec<Value>, UniflowError>;
}

/// Receives raw events for one source and feeds the intake queue.
pub struct Receiver<S> {
    sender: S,
}

impl<S: QueueSender> Receiver<S> {
    pub fn new(sender: S) -> Self {
        Self { sender }
    }

    /// Validate and enqueue one raw source payload. Returns how many
    /// envelopes were enqueued; a validation failure enqueues nothing.
    pub async fn receive(
        &self,
        processor: &dyn SourceProcessor,
        raw: &Value,
    ) -> Result<usize, UniflowError> {
        let envelopes = processor.process(raw).map_err(|e| {
            warn!(
                source_system = processor.source_system(),
                errors = %e.to_json(),
                "Rejected raw source payload"
            );
            UniflowError::Validation(e)
        })?;

        if envelopes.is_empty() {
            warn!(
                source_system = processor.source_system(),
                "Source payload produced no events"
            );
            return Ok(0);
        }

        let count = envelopes.len();
        for envelope in envelopes {
            self.sender.send(envelope).await?;
        }
        info!(
            source_system = processor.source_system(),
            count, "Enqueued source events"
        );
        Ok(count)
    }

    /// Run one pull cycle: fetch, then validate and enqueue each payload.
    /// A payload failing validation is skipped; the rest of the batch still
    /// goes through. Returns how many envelopes were enqueued.
    pub async fn drain<Src: PullSource>(&self, source: &Src) -> Result<usize, UniflowError> {
        let mut enqueued = 0;
        for raw in source.fetch().await? {
            match self.receive(source, &raw).await {
                Ok(count) => enqueued += count,
                Err(UniflowError::Validation(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(enqueued)
    }
}
