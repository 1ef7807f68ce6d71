//! Change publisher — the topic boundary after a successful commit.
//!
//! A publish failure never rolls back the committed record/audit write.
//! The record is already the source of truth; downstream systems can be
//! reconciled by periodic pull if a live notification is lost. So the
//! contract here is at-least-once with independent, bounded retry.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use uniflow_common::ChangeNotification;

use crate::retry::RetryPolicy;

#[derive(Error, Debug)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

/// Transport boundary for change notifications. Fails only on transport
/// trouble, never on business logic.
#[async_trait]
pub trait ChangePublisher: Send + Sync {
    async fn publish(&self, notification: ChangeNotification) -> Result<(), PublishError>;
}

#[async_trait]
impl<P: ChangePublisher + ?Sized> ChangePublisher for Arc<P> {
    async fn publish(&self, notification: ChangeNotification) -> Result<(), PublishError> {
        (**self).publish(notification).await
    }
}

/// Publish with bounded backoff, logging instead of failing. Returns
/// whether the notification was handed to the transport. Intake success is
/// never gated on this.
pub async fn publish_with_retry(
    publisher: &dyn ChangePublisher,
    notification: ChangeNotification,
    policy: &RetryPolicy,
) -> bool {
    for attempt in 1..=policy.max_attempts.max(1) {
        match publisher.publish(notification.clone()).await {
            Ok(()) => return true,
            Err(e) if attempt < policy.max_attempts => {
                warn!(
                    error = %e,
                    identity = %notification.identity_key,
                    record_version = notification.record_version,
                    attempt,
                    "Publish failed, retrying"
                );
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
            Err(e) => {
                error!(
                    error = %e,
                    identity = %notification.identity_key,
                    record_version = notification.record_version,
                    "Publish failed after retries; downstream will catch up by reconciliation"
                );
            }
        }
    }
    false
}

// ---------------------------------------------------------------------------
// BroadcastPublisher (in-process topic)
// ---------------------------------------------------------------------------

/// In-process topic over `tokio::sync::broadcast`. Every subscriber sees
/// every notification published while it is attached.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<ChangeNotification>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl ChangePublisher for BroadcastPublisher {
    async fn publish(&self, notification: ChangeNotification) -> Result<(), PublishError> {
        // A topic with no subscribers drops the message; that is not a
        // transport failure from the producer's point of view.
        if let Err(e) = self.tx.send(notification) {
            debug!(error = %e, "No subscribers on change topic");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryPublisher (tests)
// ---------------------------------------------------------------------------

/// Captures notifications for assertions; can be told to fail the first N
/// publishes to exercise the retry path.
#[derive(Default)]
pub struct MemoryPublisher {
    sent: Mutex<Vec<ChangeNotification>>,
    failures_remaining: Mutex<u32>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publish calls with a transport error.
    pub fn failing(self, n: u32) -> Self {
        *self.failures_remaining.lock().unwrap() = n;
        self
    }

    pub fn sent(&self) -> Vec<ChangeNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangePublisher for MemoryPublisher {
    async fn publish(&self, notification: ChangeNotification) -> Result<(), PublishError> {
        {
            let mut failures = self.failures_remaining.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(PublishError("injected transport failure".to_string()));
            }
        }
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}
