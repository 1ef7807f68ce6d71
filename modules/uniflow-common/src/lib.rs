//! Shared types for the unification pipeline.
//!
//! One client identity, many source systems, one consistent record. This
//! crate holds the vocabulary every other crate speaks: identity keys,
//! event envelopes, the unified record, audit entries, change
//! notifications, and the error taxonomy. No I/O lives here.

pub mod config;
pub mod error;
pub mod types;
pub mod validate;

pub use config::Config;
pub use error::UniflowError;
pub use types::*;
pub use validate::{FieldError, SchemaValidator, ValidationError, Validator, ValueKind};
