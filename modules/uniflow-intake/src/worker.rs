//! The pipeline worker loop: queue → rule engine → commit → publish.
//!
//! Several workers can run against the same queue; the queue's per-key
//! lease keeps one identity on one worker at a time. Shutdown drains the
//! current batch to a commit/no-commit boundary, so an envelope is never
//! abandoned mid-commit.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};
use uniflow_common::{EventEnvelope, SchemaValidator, Validator};
use uniflow_engine::{CommitOutcome, Committer, Engine, RejectReason};
use uniflow_integration::{publish_with_retry, ChangePublisher, RetryPolicy};
use uniflow_store::{AuditTrail, RecordStore};

use crate::queue::IntakeQueue;

pub struct PipelineWorker<Q, R, A, P> {
    queue: Q,
    engine: Arc<Engine>,
    committer: Committer<R, A>,
    publisher: P,
    publish_policy: RetryPolicy,
    payload_validators: BTreeMap<String, SchemaValidator>,
    batch_size: usize,
}

impl<Q, R, A, P> PipelineWorker<Q, R, A, P>
where
    Q: IntakeQueue,
    R: RecordStore,
    A: AuditTrail,
    P: ChangePublisher,
{
    pub fn new(
        queue: Q,
        engine: Arc<Engine>,
        committer: Committer<R, A>,
        publisher: P,
        publish_policy: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            engine,
            committer,
            publisher,
            publish_policy,
            payload_validators: BTreeMap::new(),
            batch_size: 16,
        }
    }

    /// Validate this source system's payloads before they reach the rule
    /// engine. A failing envelope is dead-lettered and never advances the
    /// record version.
    pub fn with_payload_validator(
        mut self,
        source_system: impl Into<String>,
        validator: SchemaValidator,
    ) -> Self {
        self.payload_validators
            .insert(source_system.into(), validator);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run until the shutdown signal flips or the queue closes. The batch
    /// in hand is always finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Pipeline worker started");
        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow_and_update() {
                        break;
                    }
                    continue;
                }
                batch = self.queue.next_batch(self.batch_size) => batch,
            };

            if batch.is_empty() {
                break;
            }
            for envelope in batch {
                self.process(envelope).await;
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("Pipeline worker drained and stopped");
    }

    async fn process(&self, envelope: EventEnvelope) {
        // Intake-side payload validation: a malformed envelope fails here
        // and is dead-lettered before the rule engine ever sees it.
        if let Some(validator) = self.payload_validators.get(&envelope.source_system) {
            if let Err(e) = validator.validate(&envelope.payload) {
                self.queue
                    .dead_letter(&envelope, &format!("payload validation failed: {}", e.to_json()))
                    .await;
                return;
            }
        }

        match self.committer.apply_and_commit(&self.engine, &envelope).await {
            Ok(CommitOutcome::Committed { record, notification }) => {
                info!(
                    identity = %envelope.identity_key,
                    version = record.version,
                    changed = ?notification.changed_sub_schemas,
                    "Committed record mutation"
                );
                // Best-effort: the record and audit trail are already
                // durable, so a lost notification never fails the event.
                publish_with_retry(&self.publisher, notification, &self.publish_policy).await;
                self.queue.acknowledge(&envelope).await;
            }
            Ok(CommitOutcome::RejectedSilently { reason }) => {
                debug!(
                    identity = %envelope.identity_key,
                    reason = reason.describe().as_str(),
                    "Acknowledging redelivery"
                );
                self.queue.acknowledge(&envelope).await;
            }
            Ok(CommitOutcome::Rejected { reason }) => match reason {
                RejectReason::NoOp => {
                    debug!(identity = %envelope.identity_key, "Rule declared no-op");
                    self.queue.acknowledge(&envelope).await;
                }
                other => {
                    self.queue.dead_letter(&envelope, &other.describe()).await;
                }
            },
            Err(e) => {
                error!(
                    identity = %envelope.identity_key,
                    error = %e,
                    "Fatal per-event failure"
                );
                self.queue.dead_letter(&envelope, &e.to_string()).await;
            }
        }
    }
}
