//! Chain tests — the whole pipeline with in-memory edges.
//!
//! Each test follows MOCK → FUNCTION → OUTPUT: set up the queue, stores,
//! and strategies, run the ACTUAL worker/dispatcher, assert what came out.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;

use uniflow_common::{
    AuditOutcome, ChangeNotification, EventEnvelope, IdentityKey, IntegrationStatus,
    SchemaValidator, UnifiedRecord, ValidationError, ValueKind,
};
use uniflow_engine::{Committer, Decision, Engine, RuleRegistry, UpdateRule};
use uniflow_intake::{MemoryQueue, PipelineWorker};
use uniflow_integration::{
    BroadcastPublisher, Dispatcher, ExecuteStatus, IntegrationError, IntegrationStrategy,
    MemoryResultSink, RetryPolicy,
};
use uniflow_store::{AuditTrail, MemoryAuditTrail, MemoryRecordStore};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Copies the payload into the `profile` sub-schema.
struct ProfileRule;

impl UpdateRule for ProfileRule {
    fn decide(
        &self,
        _current: Option<&UnifiedRecord>,
        event: &EventEnvelope,
    ) -> Result<Decision, ValidationError> {
        Ok(Decision::default().set("profile", event.payload.clone()))
    }
}

/// Delivers everything on the first attempt.
struct AlwaysDeliver;

#[async_trait]
impl IntegrationStrategy for AlwaysDeliver {
    fn name(&self) -> &str {
        "always-deliver"
    }

    fn matches(&self, _notification: &ChangeNotification) -> bool {
        true
    }

    async fn execute(
        &self,
        _notification: &ChangeNotification,
    ) -> Result<ExecuteStatus, IntegrationError> {
        Ok(ExecuteStatus::Delivered)
    }
}

struct Harness {
    queue: Arc<MemoryQueue>,
    records: Arc<MemoryRecordStore>,
    audit: Arc<MemoryAuditTrail>,
    sink: Arc<MemoryResultSink>,
    shutdown_tx: watch::Sender<bool>,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Harness {
    /// Wire queue → worker(s) → stores → broadcast topic → dispatcher.
    fn start(workers: usize, payload_validator: Option<SchemaValidator>) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let queue = Arc::new(MemoryQueue::new());
        let records = Arc::new(MemoryRecordStore::new());
        let audit = Arc::new(MemoryAuditTrail::new());
        let sink = Arc::new(MemoryResultSink::new());
        let engine = Arc::new(Engine::new(
            RuleRegistry::new().register("crm", Arc::new(ProfileRule)),
        ));
        let publisher = Arc::new(BroadcastPublisher::new(64));
        let policy = RetryPolicy::new(3, Duration::ZERO, 2);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut worker_handles = Vec::new();

        let dispatcher = Arc::new(
            Dispatcher::new(policy.clone(), sink.clone()).with_strategy(Arc::new(AlwaysDeliver)),
        );
        let rx = publisher.subscribe();
        {
            let dispatcher = dispatcher.clone();
            let shutdown_rx = shutdown_rx.clone();
            worker_handles.push(tokio::spawn(async move {
                dispatcher.run(rx, shutdown_rx).await;
            }));
        }

        for _ in 0..workers {
            let committer = Committer::new(records.clone(), audit.clone(), 3);
            let mut worker = PipelineWorker::new(
                queue.clone(),
                engine.clone(),
                committer,
                publisher.clone(),
                policy.clone(),
            );
            if let Some(validator) = &payload_validator {
                worker = worker.with_payload_validator("crm", validator.clone());
            }
            let shutdown_rx = shutdown_rx.clone();
            worker_handles.push(tokio::spawn(async move {
                worker.run(shutdown_rx).await;
            }));
        }

        Self {
            queue,
            records,
            audit,
            sink,
            shutdown_tx,
            worker_handles,
        }
    }

    async fn stop(self) {
        self.shutdown_tx.send(true).unwrap();
        self.queue.close();
        for handle in self.worker_handles {
            handle.await.unwrap();
        }
    }
}

fn event(key: &str, seq: i64, payload: serde_json::Value) -> EventEnvelope {
    EventEnvelope::new(key, "crm", seq, payload)
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

// ---------------------------------------------------------------------------
// Chain Test 1: accepted events flow end to end
//
// queue → rule engine → record + audit commit → change topic → strategy.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn accepted_events_reach_record_audit_and_integration() {
    let harness = Harness::start(1, None);
    let key = IdentityKey::from("C1");

    harness.queue.enqueue(event("C1", 1, json!({"name": "Ann"})));
    harness.queue.enqueue(event("C1", 2, json!({"name": "Ann B."})));

    let sink = harness.sink.clone();
    wait_until("two integration results", || sink.all().len() == 2).await;

    let record = harness.records.record(&key).unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(record.sub_schema("profile"), Some(&json!({"name": "Ann B."})));

    // Audit chain: accepted entries compose previous -> new to the final value.
    let entries = harness.audit.entries_for(&key).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.outcome == AuditOutcome::Accepted));
    assert_eq!(entries[1].previous_value, entries[0].new_value);
    assert_eq!(entries[1].new_value.as_ref(), record.sub_schema("profile"));

    // One integration result per accepted version, all successful.
    let versions: BTreeSet<i64> = harness.sink.all().iter().map(|r| r.record_version).collect();
    assert_eq!(versions, BTreeSet::from([1, 2]));
    assert!(harness
        .sink
        .all()
        .iter()
        .all(|r| r.status == IntegrationStatus::Success && r.attempts == 1));

    harness.stop().await;
}

// ---------------------------------------------------------------------------
// Chain Test 2: interleaved keys, parallel workers, per-key order holds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interleaved_keys_apply_in_order_under_parallel_workers() {
    let harness = Harness::start(4, None);

    for seq in 1..=5 {
        harness.queue.enqueue(event("C1", seq, json!({"n": seq})));
        harness.queue.enqueue(event("C2", seq, json!({"n": seq * 10})));
    }

    let records = harness.records.clone();
    wait_until("both records at version 5", || {
        [IdentityKey::from("C1"), IdentityKey::from("C2")]
            .iter()
            .all(|k| records.record(k).map(|r| r.version) == Some(5))
    })
    .await;

    // Every event was accepted in submission order: N accepted events for
    // one identity leave version == N with a gapless audit chain.
    for key in [IdentityKey::from("C1"), IdentityKey::from("C2")] {
        let entries = harness.audit.entries_for(&key).await.unwrap();
        assert_eq!(entries.len(), 5);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.record_version, Some(i as i64 + 1));
        }
        for pair in entries.windows(2) {
            assert_eq!(pair[1].previous_value, pair[0].new_value);
        }
    }

    harness.stop().await;
}

// ---------------------------------------------------------------------------
// Chain Test 3: invalid payload dead-letters before the engine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_payload_is_dead_lettered_and_never_advances_the_version() {
    let validator = SchemaValidator::new("crm-payload").require("name", ValueKind::String);
    let harness = Harness::start(1, Some(validator));
    let key = IdentityKey::from("C1");

    harness.queue.enqueue(event("C1", 1, json!({"unexpected": 42})));

    let queue = harness.queue.clone();
    wait_until("dead letter recorded", || queue.dead_letters().len() == 1).await;

    assert!(harness.records.record(&key).is_none());
    assert!(harness.audit.entries_for(&key).await.unwrap().is_empty());
    assert!(harness.sink.all().is_empty());
    assert!(harness.queue.dead_letters()[0]
        .reason
        .contains("payload validation failed"));

    harness.stop().await;
}

// ---------------------------------------------------------------------------
// Chain Test 4: redelivery is absorbed silently
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redelivered_envelope_changes_neither_version_nor_audit() {
    let harness = Harness::start(1, None);
    let key = IdentityKey::from("C1");

    let original = event("C1", 1, json!({"name": "Ann"}));
    harness.queue.enqueue(original.clone());

    let records = harness.records.clone();
    wait_until("first commit", || records.record(&IdentityKey::from("C1")).is_some()).await;

    // At-least-once upstream: the same envelope shows up again.
    harness.queue.enqueue(original);

    let queue = harness.queue.clone();
    wait_until("redelivery consumed", || queue.pending_len() == 0).await;
    // Give the worker a beat to finish the silent acknowledge.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let record = harness.records.record(&key).unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(harness.audit.entries_for(&key).await.unwrap().len(), 1);
    assert!(harness.queue.dead_letters().is_empty());

    harness.stop().await;
}
