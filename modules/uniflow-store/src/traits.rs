//! Store trait seams.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uniflow_common::{AuditEntry, IdentityKey, UnifiedRecord};

#[derive(Error, Debug)]
pub enum StoreError {
    /// Another writer advanced the record version first. Recoverable: the
    /// caller re-reads and re-runs the apply+commit cycle.
    #[error("version conflict on {identity_key} (expected {expected:?})")]
    Conflict {
        identity_key: IdentityKey,
        expected: Option<i64>,
    },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Read/write access to the persisted unified record.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, identity_key: &IdentityKey) -> Result<Option<UnifiedRecord>, StoreError>;

    /// Version-gated write. `expected_version: None` inserts only if the
    /// record is absent; `Some(v)` requires the stored version to still be
    /// `v`. Either way a mismatch is a `Conflict` and nothing is written.
    async fn put(
        &self,
        record: &UnifiedRecord,
        expected_version: Option<i64>,
    ) -> Result<(), StoreError>;
}

/// Append-only audit collection.
#[async_trait]
pub trait AuditTrail: Send + Sync {
    /// Append a batch of entries. All-or-nothing per call.
    async fn append(&self, entries: &[AuditEntry]) -> Result<(), StoreError>;

    /// All entries for one identity, in append order.
    async fn entries_for(&self, identity_key: &IdentityKey)
        -> Result<Vec<AuditEntry>, StoreError>;
}

// Arc blankets so adapters can be shared between workers and tests.

#[async_trait]
impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    async fn get(&self, identity_key: &IdentityKey) -> Result<Option<UnifiedRecord>, StoreError> {
        (**self).get(identity_key).await
    }

    async fn put(
        &self,
        record: &UnifiedRecord,
        expected_version: Option<i64>,
    ) -> Result<(), StoreError> {
        (**self).put(record, expected_version).await
    }
}

#[async_trait]
impl<S: AuditTrail + ?Sized> AuditTrail for Arc<S> {
    async fn append(&self, entries: &[AuditEntry]) -> Result<(), StoreError> {
        (**self).append(entries).await
    }

    async fn entries_for(
        &self,
        identity_key: &IdentityKey,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        (**self).entries_for(identity_key).await
    }
}
