//! In-memory adapters for tests. No database required.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uniflow_common::{AuditEntry, AuditOutcome, IdentityKey, UnifiedRecord};

use crate::traits::{AuditTrail, RecordStore, StoreError};

/// HashMap-backed record store with real version gating, so concurrency
/// conflict paths behave exactly as they do against Postgres.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<IdentityKey, UnifiedRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record snapshot (for test assertions).
    pub fn record(&self, identity_key: &IdentityKey) -> Option<UnifiedRecord> {
        self.records.lock().unwrap().get(identity_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, identity_key: &IdentityKey) -> Result<Option<UnifiedRecord>, StoreError> {
        Ok(self.records.lock().unwrap().get(identity_key).cloned())
    }

    async fn put(
        &self,
        record: &UnifiedRecord,
        expected_version: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        let existing = records.get(&record.identity_key).map(|r| r.version);

        let gate_passes = match expected_version {
            None => existing.is_none(),
            Some(v) => existing == Some(v),
        };
        if !gate_passes {
            return Err(StoreError::Conflict {
                identity_key: record.identity_key.clone(),
                expected: expected_version,
            });
        }

        records.insert(record.identity_key.clone(), record.clone());
        Ok(())
    }
}

/// Append-only audit trail in a Vec, with assertion accessors.
#[derive(Default)]
pub struct MemoryAuditTrail {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in append order (for test assertions).
    pub fn all(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn accepted_count(&self, identity_key: &IdentityKey) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.identity_key == *identity_key && e.outcome == AuditOutcome::Accepted)
            .count()
    }
}

#[async_trait]
impl AuditTrail for MemoryAuditTrail {
    async fn append(&self, entries: &[AuditEntry]) -> Result<(), StoreError> {
        self.entries.lock().unwrap().extend_from_slice(entries);
        Ok(())
    }

    async fn entries_for(
        &self,
        identity_key: &IdentityKey,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.identity_key == *identity_key)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn record(key: &str, version: i64) -> UnifiedRecord {
        UnifiedRecord {
            identity_key: IdentityKey::from(key),
            version,
            sub_schemas: BTreeMap::new(),
            last_applied_seq: version,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_then_read_round_trips() {
        let store = MemoryRecordStore::new();
        let rec = record("C1", 1);
        store.put(&rec, None).await.unwrap();
        assert_eq!(store.get(&rec.identity_key).await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn insert_over_existing_record_conflicts() {
        let store = MemoryRecordStore::new();
        store.put(&record("C1", 1), None).await.unwrap();
        let err = store.put(&record("C1", 1), None).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts_and_writes_nothing() {
        let store = MemoryRecordStore::new();
        store.put(&record("C1", 1), None).await.unwrap();

        let err = store.put(&record("C1", 3), Some(2)).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.record(&IdentityKey::from("C1")).unwrap().version, 1);
    }

    #[tokio::test]
    async fn matching_expected_version_updates() {
        let store = MemoryRecordStore::new();
        store.put(&record("C1", 1), None).await.unwrap();
        store.put(&record("C1", 2), Some(1)).await.unwrap();
        assert_eq!(store.record(&IdentityKey::from("C1")).unwrap().version, 2);
    }
}
