//! Apply + commit: the causally ordered record-then-audit write pair.
//!
//! The underlying store is a pair of separate writes. The record write goes
//! first and carries the version gate; audit entries are appended only once
//! it succeeds, and success is reported only once they are durable. A
//! version conflict re-runs the whole cycle from a fresh read, so the two
//! collections cannot drift apart.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};
use uniflow_common::{AuditEntry, ChangeNotification, EventEnvelope, UniflowError, UnifiedRecord};
use uniflow_store::{AuditTrail, RecordStore, StoreError};

use crate::engine::{Engine, Outcome, RejectReason};

/// What one apply+commit cycle produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Record and audit entries are durable; the notification is derived
    /// from the committed version and ready to publish.
    Committed {
        record: UnifiedRecord,
        notification: ChangeNotification,
    },
    /// Rejected with one audited entry (validation, no-op, no rule).
    Rejected { reason: RejectReason },
    /// Duplicate or stale redelivery: acknowledged upstream, no audit write.
    RejectedSilently { reason: RejectReason },
}

/// Drives the bounded apply+commit cycle for one envelope at a time.
pub struct Committer<R, A> {
    records: R,
    audit: A,
    max_attempts: u32,
    store_attempts: u32,
    store_backoff: Duration,
}

impl<R: RecordStore, A: AuditTrail> Committer<R, A> {
    pub fn new(records: R, audit: A, max_attempts: u32) -> Self {
        Self {
            records,
            audit,
            max_attempts,
            store_attempts: 3,
            store_backoff: Duration::from_millis(500),
        }
    }

    /// Tune the transport-failure retry for store calls. Conflicts are not
    /// transport failures and follow `max_attempts` instead.
    pub fn with_store_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.store_attempts = attempts.max(1);
        self.store_backoff = backoff;
        self
    }

    /// Retry a store call on backend failure with exponential backoff.
    /// Conflicts pass straight through to the apply+commit cycle.
    async fn retry_store<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Err(e) if !e.is_conflict() && attempt < self.store_attempts => {
                    warn!(
                        error = %e,
                        attempt,
                        max_attempts = self.store_attempts,
                        "Store transport failure, backing off"
                    );
                    tokio::time::sleep(
                        self.store_backoff * 2u32.saturating_pow(attempt - 1),
                    )
                    .await;
                }
                other => return other,
            }
        }
    }

    /// Read the current record, apply the event, and commit the outcome.
    ///
    /// On a version conflict the cycle re-runs from a fresh read, up to the
    /// configured bound; exhausting the bound is a fatal per-event error and
    /// the caller dead-letters the envelope.
    pub async fn apply_and_commit(
        &self,
        engine: &Engine,
        event: &EventEnvelope,
    ) -> Result<CommitOutcome, UniflowError> {
        for attempt in 1..=self.max_attempts {
            let current = self
                .retry_store(|| self.records.get(&event.identity_key))
                .await
                .map_err(store_error)?;

            match engine.apply(current.as_ref(), event) {
                Outcome::Rejected { reason } if reason.is_silent() => {
                    debug!(
                        identity = %event.identity_key,
                        sequence_hint = event.sequence_hint,
                        "Redelivery rejected without audit"
                    );
                    return Ok(CommitOutcome::RejectedSilently { reason });
                }
                Outcome::Rejected { reason } => {
                    let entry = AuditEntry::rejected(
                        event.identity_key.clone(),
                        event.event_id,
                        reason.describe(),
                    );
                    self.retry_store(|| self.audit.append(std::slice::from_ref(&entry)))
                        .await
                        .map_err(store_error)?;
                    return Ok(CommitOutcome::Rejected { reason });
                }
                Outcome::Accepted {
                    new_record,
                    changed_sub_schemas,
                    change_set,
                } => {
                    let expected_version = current.as_ref().map(|r| r.version);
                    match self
                        .retry_store(|| self.records.put(&new_record, expected_version))
                        .await
                    {
                        Ok(()) => {
                            let entries: Vec<AuditEntry> = change_set
                                .iter()
                                .map(|change| {
                                    AuditEntry::accepted(
                                        event.identity_key.clone(),
                                        event.event_id,
                                        change,
                                        new_record.version,
                                    )
                                })
                                .collect();
                            self.retry_store(|| self.audit.append(&entries))
                                .await
                                .map_err(store_error)?;

                            let notification = ChangeNotification {
                                identity_key: event.identity_key.clone(),
                                record_version: new_record.version,
                                changed_sub_schemas,
                            };
                            return Ok(CommitOutcome::Committed {
                                record: new_record,
                                notification,
                            });
                        }
                        Err(e) if e.is_conflict() => {
                            warn!(
                                identity = %event.identity_key,
                                attempt,
                                max_attempts = self.max_attempts,
                                "Version conflict, re-running apply from a fresh read"
                            );
                            continue;
                        }
                        Err(e) => return Err(store_error(e)),
                    }
                }
            }
        }

        Err(UniflowError::ConcurrencyConflict(
            event.identity_key.to_string(),
        ))
    }
}

fn store_error(e: StoreError) -> UniflowError {
    UniflowError::Store(e.to_string())
}
