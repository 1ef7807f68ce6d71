//! Ordered intake queue.
//!
//! Contract: for a fixed identity key, delivery order equals submission
//! order, and no two envelopes for the same key are in flight at once.
//! Visibility is at-least-once: duplicates are possible and the engine's
//! idempotency guard absorbs them.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::warn;
use uniflow_common::{EventEnvelope, IdentityKey, UniflowError};

use crate::producer::QueueSender;

/// An envelope that left the pipeline, and why.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub envelope: EventEnvelope,
    pub reason: String,
}

/// Session-ordered intake boundary.
#[async_trait]
pub trait IntakeQueue: Send + Sync {
    /// Wait until at least one envelope is deliverable or the queue shuts
    /// down. An empty batch means shutdown. At most one envelope per
    /// identity key is handed out until it is acknowledged or dead-lettered.
    async fn next_batch(&self, max: usize) -> Vec<EventEnvelope>;

    /// Commit consumption and release the identity's delivery lease.
    async fn acknowledge(&self, envelope: &EventEnvelope);

    /// Route an unrecoverable envelope out of the pipeline and release the
    /// identity's delivery lease.
    async fn dead_letter(&self, envelope: &EventEnvelope, reason: &str);
}

#[async_trait]
impl<Q: IntakeQueue + ?Sized> IntakeQueue for Arc<Q> {
    async fn next_batch(&self, max: usize) -> Vec<EventEnvelope> {
        (**self).next_batch(max).await
    }

    async fn acknowledge(&self, envelope: &EventEnvelope) {
        (**self).acknowledge(envelope).await
    }

    async fn dead_letter(&self, envelope: &EventEnvelope, reason: &str) {
        (**self).dead_letter(envelope, reason).await
    }
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<IdentityKey, VecDeque<EventEnvelope>>,
    in_flight: HashSet<IdentityKey>,
    dead: Vec<DeadLetter>,
}

/// In-memory session-ordered queue.
///
/// Each identity key is a session: envelopes for one key form a FIFO, and
/// a key with an envelope in flight is skipped until the lease is
/// released. Multiple workers can pull from the same queue safely.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue one envelope at the back of its identity's session.
    pub fn enqueue(&self, envelope: EventEnvelope) {
        {
            let mut state = self.state.lock().unwrap();
            state
                .pending
                .entry(envelope.identity_key.clone())
                .or_default()
                .push_back(envelope);
        }
        self.notify.notify_one();
    }

    /// Signal shutdown: blocked `next_batch` calls return empty batches.
    /// Envelopes still pending stay where they are; upstream redelivery
    /// covers them on the next start.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Dead-lettered envelopes so far (for tests and operators).
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().unwrap().dead.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .pending
            .values()
            .map(VecDeque::len)
            .sum()
    }

    fn release(&self, envelope: &EventEnvelope) {
        let mut state = self.state.lock().unwrap();
        state.in_flight.remove(&envelope.identity_key);
        let has_more = state
            .pending
            .get(&envelope.identity_key)
            .is_some_and(|q| !q.is_empty());
        drop(state);
        if has_more {
            self.notify.notify_one();
        }
    }
}

#[async_trait]
impl IntakeQueue for MemoryQueue {
    async fn next_batch(&self, max: usize) -> Vec<EventEnvelope> {
        loop {
            let notified = self.notify.notified();

            {
                let mut state = self.state.lock().unwrap();
                let free_keys: Vec<IdentityKey> = state
                    .pending
                    .iter()
                    .filter(|(key, queue)| {
                        !queue.is_empty() && !state.in_flight.contains(*key)
                    })
                    .map(|(key, _)| key.clone())
                    .take(max.max(1))
                    .collect();

                if !free_keys.is_empty() {
                    let mut batch = Vec::with_capacity(free_keys.len());
                    for key in free_keys {
                        if let Some(envelope) =
                            state.pending.get_mut(&key).and_then(VecDeque::pop_front)
                        {
                            state.in_flight.insert(key);
                            batch.push(envelope);
                        }
                    }
                    return batch;
                }
            }

            if self.closed.load(Ordering::SeqCst) {
                return Vec::new();
            }

            notified.await;
        }
    }

    async fn acknowledge(&self, envelope: &EventEnvelope) {
        self.release(envelope);
    }

    async fn dead_letter(&self, envelope: &EventEnvelope, reason: &str) {
        warn!(
            identity = %envelope.identity_key,
            source_system = envelope.source_system.as_str(),
            sequence_hint = envelope.sequence_hint,
            reason,
            "Dead-lettering envelope"
        );
        {
            let mut state = self.state.lock().unwrap();
            state.dead.push(DeadLetter {
                envelope: envelope.clone(),
                reason: reason.to_string(),
            });
        }
        self.release(envelope);
    }
}

#[async_trait]
impl QueueSender for MemoryQueue {
    async fn send(&self, envelope: EventEnvelope) -> Result<(), UniflowError> {
        self.enqueue(envelope);
        Ok(())
    }
}

#[async_trait]
impl<S: QueueSender + ?Sized> QueueSender for Arc<S> {
    async fn send(&self, envelope: EventEnvelope) -> Result<(), UniflowError> {
        (**self).send(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(key: &str, seq: i64) -> EventEnvelope {
        EventEnvelope::new(key, "crm", seq, json!({"seq": seq}))
    }

    #[tokio::test]
    async fn one_key_delivers_in_submission_order() {
        let queue = MemoryQueue::new();
        queue.enqueue(envelope("C1", 1));
        queue.enqueue(envelope("C1", 2));
        queue.enqueue(envelope("C1", 3));

        for expected in 1..=3 {
            let batch = queue.next_batch(8).await;
            assert_eq!(batch.len(), 1, "only one C1 envelope may be in flight");
            assert_eq!(batch[0].sequence_hint, expected);
            queue.acknowledge(&batch[0]).await;
        }
    }

    #[tokio::test]
    async fn leased_key_is_skipped_while_other_keys_flow() {
        let queue = MemoryQueue::new();
        queue.enqueue(envelope("C1", 1));
        queue.enqueue(envelope("C1", 2));
        queue.enqueue(envelope("C2", 1));

        let first = queue.next_batch(8).await;
        let keys: Vec<&str> = first.iter().map(|e| e.identity_key.as_str()).collect();
        assert_eq!(keys, vec!["C1", "C2"]);

        // C1 is leased; only after the ack does its next envelope surface.
        queue.acknowledge(&first[1]).await;
        queue.acknowledge(&first[0]).await;
        let second = queue.next_batch(8).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].sequence_hint, 2);
    }

    #[tokio::test]
    async fn dead_letter_records_reason_and_releases_the_lease() {
        let queue = MemoryQueue::new();
        queue.enqueue(envelope("C1", 1));
        queue.enqueue(envelope("C1", 2));

        let batch = queue.next_batch(8).await;
        queue.dead_letter(&batch[0], "unparseable payload").await;

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "unparseable payload");

        let next = queue.next_batch(8).await;
        assert_eq!(next[0].sequence_hint, 2);
    }

    #[tokio::test]
    async fn close_unblocks_a_waiting_consumer() {
        let queue = Arc::new(MemoryQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_batch(8).await })
        };

        tokio::task::yield_now().await;
        queue.close();

        let batch = waiter.await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn enqueue_wakes_a_waiting_consumer() {
        let queue = Arc::new(MemoryQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_batch(8).await })
        };

        tokio::task::yield_now().await;
        queue.enqueue(envelope("C1", 1));

        let batch = waiter.await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
