//! Update rule engine.
//!
//! Applies one event envelope to one identity's unified record: an
//! idempotency guard, the integrator's pure rule, validation of the
//! produced sub-schema values, and construction of the version-incremented
//! record. `Committer` then makes the record-before-audit write pair
//! effectively atomic under optimistic concurrency.

pub mod commit;
pub mod engine;
pub mod rules;

pub use commit::{CommitOutcome, Committer};
pub use engine::{Engine, Outcome, RejectReason};
pub use rules::{Decision, RuleRegistry, UpdateRule};
