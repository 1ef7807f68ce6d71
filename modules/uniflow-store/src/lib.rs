//! Persistence adapters for the unified record and its audit trail.
//!
//! Two trait seams: `RecordStore` (get-by-key plus version-gated put) and
//! `AuditTrail` (append-only). The Postgres adapters are the production
//! implementations; the memory adapters back tests. The commit ordering
//! (record before audit, both gated by the same version check) lives in
//! `uniflow-engine`; this crate only promises the primitives.

pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::{MemoryAuditTrail, MemoryRecordStore};
pub use postgres::{migrate, PgAuditTrail, PgRecordStore};
pub use traits::{AuditTrail, RecordStore, StoreError};
