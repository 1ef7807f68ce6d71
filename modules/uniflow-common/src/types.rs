//! Core types for the unification pipeline. Domain-agnostic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable, unique identifier binding all events and records for one client.
/// Immutable once assigned; everything downstream is partitioned by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for IdentityKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// One event from one source system, addressed to one identity.
///
/// Consumed exactly once per `(identity_key, sequence_hint)`; redeliveries
/// are possible upstream and are rejected by the engine's idempotency guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub identity_key: IdentityKey,
    pub source_system: String,
    pub occurred_at: DateTime<Utc>,
    pub sequence_hint: i64,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(
        identity_key: impl Into<IdentityKey>,
        source_system: impl Into<String>,
        sequence_hint: i64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            identity_key: identity_key.into(),
            source_system: source_system.into(),
            occurred_at: Utc::now(),
            sequence_hint,
            payload,
        }
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

/// The consolidated client record: named sub-schemas under one identity.
///
/// `version` is the optimistic-concurrency token and increments by exactly
/// one per accepted mutation. `last_applied_seq` is the idempotency
/// watermark, stored alongside the record so both survive together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub identity_key: IdentityKey,
    pub version: i64,
    pub sub_schemas: BTreeMap<String, serde_json::Value>,
    pub last_applied_seq: i64,
    pub updated_at: DateTime<Utc>,
}

impl UnifiedRecord {
    /// A fresh record at version 0 with no sub-schemas. The first accepted
    /// event takes it to version 1.
    pub fn empty(identity_key: IdentityKey) -> Self {
        Self {
            identity_key,
            version: 0,
            sub_schemas: BTreeMap::new(),
            last_applied_seq: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn sub_schema(&self, name: &str) -> Option<&serde_json::Value> {
        self.sub_schemas.get(name)
    }
}

/// Outcome recorded on an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Accepted,
    Rejected,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Accepted => f.write_str("accepted"),
            AuditOutcome::Rejected => f.write_str("rejected"),
        }
    }
}

/// Immutable record of one field-level change (or one rejection) and its
/// outcome. Append-only; one entry per (event, sub-schema touched).
///
/// Rejections touch no sub-schema, so `sub_schema_name` is `None` and the
/// reason carries the explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub identity_key: IdentityKey,
    pub event_ref: Uuid,
    pub sub_schema_name: Option<String>,
    pub previous_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
    pub record_version: Option<i64>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn accepted(
        identity_key: IdentityKey,
        event_ref: Uuid,
        change: &FieldChange,
        record_version: i64,
    ) -> Self {
        Self {
            identity_key,
            event_ref,
            sub_schema_name: Some(change.sub_schema_name.clone()),
            previous_value: change.previous_value.clone(),
            new_value: change.new_value.clone(),
            outcome: AuditOutcome::Accepted,
            reason: None,
            record_version: Some(record_version),
            recorded_at: Utc::now(),
        }
    }

    pub fn rejected(identity_key: IdentityKey, event_ref: Uuid, reason: impl Into<String>) -> Self {
        Self {
            identity_key,
            event_ref,
            sub_schema_name: None,
            previous_value: None,
            new_value: None,
            outcome: AuditOutcome::Rejected,
            reason: Some(reason.into()),
            record_version: None,
            recorded_at: Utc::now(),
        }
    }
}

/// One field-level change inside an accepted application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub sub_schema_name: String,
    pub previous_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
}

/// Announces that a record version changed and which sub-schemas changed.
/// Published at most once per accepted mutation; immutable after that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub identity_key: IdentityKey,
    pub record_version: i64,
    pub changed_sub_schemas: BTreeSet<String>,
}

/// Terminal status of one integration delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationStatus {
    Success,
    Failed,
    Ignored,
}

/// One delivery attempt record per (change notification, strategy).
/// Written once, when the delivery reaches a terminal state; a later
/// record version produces a new result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationResult {
    pub identity_key: IdentityKey,
    pub record_version: i64,
    pub strategy_name: String,
    pub status: IntegrationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub finished_at: DateTime<Utc>,
}
