//! Pluggable update rules and their routing table.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use uniflow_common::{EventEnvelope, UnifiedRecord, ValidationError};

/// What a rule decided: the full new values of the sub-schemas it produced,
/// and which of them it considers changed.
#[derive(Debug, Clone, Default)]
pub struct Decision {
    pub sub_schema_values: BTreeMap<String, Value>,
    pub changed: Vec<String>,
}

impl Decision {
    /// A decision that changes nothing. The engine rejects it as a no-op.
    pub fn no_op() -> Self {
        Self::default()
    }

    /// Set one sub-schema value and mark it changed.
    pub fn set(mut self, name: impl Into<String>, value: Value) -> Self {
        let name = name.into();
        self.sub_schema_values.insert(name.clone(), value);
        self.changed.push(name);
        self
    }

    /// Carry a sub-schema value forward without marking it changed.
    pub fn keep(mut self, name: impl Into<String>, value: Value) -> Self {
        self.sub_schema_values.insert(name.into(), value);
        self
    }
}

/// The integrator's business rule: given the current record state and an
/// incoming event, produce new sub-schema state.
///
/// Must be pure: no I/O, no clocks. The engine owns everything around it:
/// idempotency, validation of produced values, and versioning. How a rule
/// decides what changed is its author's business.
pub trait UpdateRule: Send + Sync {
    fn decide(
        &self,
        current: Option<&UnifiedRecord>,
        event: &EventEnvelope,
    ) -> Result<Decision, ValidationError>;
}

/// Routing table from source system to rule, resolved once at startup.
#[derive(Default)]
pub struct RuleRegistry {
    rules: BTreeMap<String, Arc<dyn UpdateRule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, source_system: impl Into<String>, rule: Arc<dyn UpdateRule>) -> Self {
        self.rules.insert(source_system.into(), rule);
        self
    }

    pub fn resolve(&self, source_system: &str) -> Option<Arc<dyn UpdateRule>> {
        self.rules.get(source_system).cloned()
    }

    pub fn source_systems(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }
}
