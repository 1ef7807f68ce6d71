//! Postgres adapters — unified records in one table, audit entries in an
//! append-only table.
//!
//! The version gate is enforced in SQL: inserts use `ON CONFLICT DO
//! NOTHING`, updates carry `AND version = $expected`. Zero affected rows
//! means another writer got there first, reported as `StoreError::Conflict`
//! with nothing written.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use async_trait::async_trait;
use uniflow_common::{AuditEntry, AuditOutcome, IdentityKey, UnifiedRecord};

use crate::traits::{AuditTrail, RecordStore, StoreError};

/// Create the pipeline tables if they do not exist. Run once at startup.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS unified_records (
            identity_key     TEXT PRIMARY KEY,
            version          BIGINT NOT NULL,
            sub_schemas      JSONB NOT NULL,
            last_applied_seq BIGINT NOT NULL,
            updated_at       TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_trail (
            id               BIGSERIAL PRIMARY KEY,
            identity_key     TEXT NOT NULL,
            event_ref        UUID NOT NULL,
            sub_schema_name  TEXT,
            previous_value   JSONB,
            new_value        JSONB,
            outcome          TEXT NOT NULL,
            reason           TEXT,
            record_version   BIGINT,
            recorded_at      TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS audit_trail_identity_idx ON audit_trail (identity_key, id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// PgRecordStore
// ---------------------------------------------------------------------------

/// Record store backed by Postgres with JSONB sub-schemas.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get(&self, identity_key: &IdentityKey) -> Result<Option<UnifiedRecord>, StoreError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT identity_key, version, sub_schemas, last_applied_seq, updated_at
            FROM unified_records
            WHERE identity_key = $1
            "#,
        )
        .bind(identity_key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(RecordRow::into_record).transpose()
    }

    async fn put(
        &self,
        record: &UnifiedRecord,
        expected_version: Option<i64>,
    ) -> Result<(), StoreError> {
        let sub_schemas = serde_json::to_value(&record.sub_schemas)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let result = match expected_version {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO unified_records
                        (identity_key, version, sub_schemas, last_applied_seq, updated_at)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (identity_key) DO NOTHING
                    "#,
                )
                .bind(record.identity_key.as_str())
                .bind(record.version)
                .bind(&sub_schemas)
                .bind(record.last_applied_seq)
                .bind(record.updated_at)
                .execute(&self.pool)
                .await
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE unified_records
                    SET version = $2, sub_schemas = $3, last_applied_seq = $4, updated_at = $5
                    WHERE identity_key = $1 AND version = $6
                    "#,
                )
                .bind(record.identity_key.as_str())
                .bind(record.version)
                .bind(&sub_schemas)
                .bind(record.last_applied_seq)
                .bind(record.updated_at)
                .bind(expected)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                identity_key: record.identity_key.clone(),
                expected: expected_version,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PgAuditTrail
// ---------------------------------------------------------------------------

/// Append-only audit trail backed by Postgres. A batch lands in one
/// transaction so a partially written accepted mutation cannot exist.
#[derive(Clone)]
pub struct PgAuditTrail {
    pool: PgPool,
}

impl PgAuditTrail {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditTrail for PgAuditTrail {
    async fn append(&self, entries: &[AuditEntry]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO audit_trail
                    (identity_key, event_ref, sub_schema_name, previous_value,
                     new_value, outcome, reason, record_version, recorded_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(entry.identity_key.as_str())
            .bind(entry.event_ref)
            .bind(&entry.sub_schema_name)
            .bind(&entry.previous_value)
            .bind(&entry.new_value)
            .bind(entry.outcome.to_string())
            .bind(&entry.reason)
            .bind(entry.record_version)
            .bind(entry.recorded_at)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)
    }

    async fn entries_for(
        &self,
        identity_key: &IdentityKey,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT identity_key, event_ref, sub_schema_name, previous_value,
                   new_value, outcome, reason, record_version, recorded_at
            FROM audit_trail
            WHERE identity_key = $1
            ORDER BY id ASC
            "#,
        )
        .bind(identity_key.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(AuditRow::into_entry).collect()
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

// ---------------------------------------------------------------------------
// Row types — FromRow lives here, domain types stay sqlx-free
// ---------------------------------------------------------------------------

struct RecordRow {
    identity_key: String,
    version: i64,
    sub_schemas: serde_json::Value,
    last_applied_seq: i64,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for RecordRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(RecordRow {
            identity_key: row.try_get("identity_key")?,
            version: row.try_get("version")?,
            sub_schemas: row.try_get("sub_schemas")?,
            last_applied_seq: row.try_get("last_applied_seq")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl RecordRow {
    fn into_record(self) -> Result<UnifiedRecord, StoreError> {
        let sub_schemas = serde_json::from_value(self.sub_schemas)
            .map_err(|e| StoreError::Backend(format!("malformed sub_schemas column: {e}")))?;
        Ok(UnifiedRecord {
            identity_key: IdentityKey::from(self.identity_key),
            version: self.version,
            sub_schemas,
            last_applied_seq: self.last_applied_seq,
            updated_at: self.updated_at,
        })
    }
}

struct AuditRow {
    identity_key: String,
    event_ref: Uuid,
    sub_schema_name: Option<String>,
    previous_value: Option<serde_json::Value>,
    new_value: Option<serde_json::Value>,
    outcome: String,
    reason: Option<String>,
    record_version: Option<i64>,
    recorded_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for AuditRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(AuditRow {
            identity_key: row.try_get("identity_key")?,
            event_ref: row.try_get("event_ref")?,
            sub_schema_name: row.try_get("sub_schema_name")?,
            previous_value: row.try_get("previous_value")?,
            new_value: row.try_get("new_value")?,
            outcome: row.try_get("outcome")?,
            reason: row.try_get("reason")?,
            record_version: row.try_get("record_version")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

impl AuditRow {
    fn into_entry(self) -> Result<AuditEntry, StoreError> {
        let outcome = match self.outcome.as_str() {
            "accepted" => AuditOutcome::Accepted,
            "rejected" => AuditOutcome::Rejected,
            other => {
                return Err(StoreError::Backend(format!(
                    "unknown audit outcome: {other}"
                )))
            }
        };
        Ok(AuditEntry {
            identity_key: IdentityKey::from(self.identity_key),
            event_ref: self.event_ref,
            sub_schema_name: self.sub_schema_name,
            previous_value: self.previous_value,
            new_value: self.new_value,
            outcome,
            reason: self.reason,
            record_version: self.record_version,
            recorded_at: self.recorded_at,
        })
    }
}
