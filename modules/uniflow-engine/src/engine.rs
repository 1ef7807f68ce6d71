//! Applying one envelope to one record.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use uniflow_common::{
    EventEnvelope, FieldChange, SchemaValidator, UnifiedRecord, ValidationError, Validator,
};

use crate::rules::RuleRegistry;

/// Why an event was not applied.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// Exact redelivery of the already-applied sequence.
    Duplicate { sequence_hint: i64 },
    /// Arrived after a later sequence was already applied.
    Stale {
        sequence_hint: i64,
        last_applied_seq: i64,
    },
    /// The rule produced no effective change.
    NoOp,
    /// No rule is registered for the event's source system.
    NoRule { source_system: String },
    /// The payload or a produced sub-schema value failed validation.
    Validation(ValidationError),
}

impl RejectReason {
    /// Duplicate and stale redeliveries are acknowledged without an audit
    /// entry; every other rejection is audited.
    pub fn is_silent(&self) -> bool {
        matches!(self, RejectReason::Duplicate { .. } | RejectReason::Stale { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            RejectReason::Duplicate { sequence_hint } => {
                format!("duplicate delivery of sequence {sequence_hint}")
            }
            RejectReason::Stale {
                sequence_hint,
                last_applied_seq,
            } => format!(
                "stale sequence {sequence_hint} (last applied {last_applied_seq})"
            ),
            RejectReason::NoOp => "rule produced no change".to_string(),
            RejectReason::NoRule { source_system } => {
                format!("no rule registered for source system {source_system}")
            }
            RejectReason::Validation(e) => format!("validation failed: {}", e.to_json()),
        }
    }
}

/// Result of applying one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Accepted {
        new_record: UnifiedRecord,
        changed_sub_schemas: BTreeSet<String>,
        change_set: Vec<FieldChange>,
    },
    Rejected {
        reason: RejectReason,
    },
}

/// Wraps the integrator's rules with the pipeline's guarantees.
///
/// The engine never reorders events: it trusts the intake adapter's
/// per-identity ordering and only guards against redelivery.
pub struct Engine {
    registry: RuleRegistry,
    sub_schema_validators: BTreeMap<String, SchemaValidator>,
}

impl Engine {
    pub fn new(registry: RuleRegistry) -> Self {
        Self {
            registry,
            sub_schema_validators: BTreeMap::new(),
        }
    }

    /// Register a validator for the sub-schema matching its name. Values
    /// for sub-schemas without a validator pass unchecked.
    pub fn with_sub_schema_validator(mut self, validator: SchemaValidator) -> Self {
        self.sub_schema_validators
            .insert(validator.name().to_string(), validator);
        self
    }

    /// Apply one event to the current record state.
    pub fn apply(&self, current: Option<&UnifiedRecord>, event: &EventEnvelope) -> Outcome {
        // Idempotency guard, before the rule ever runs.
        if let Some(record) = current {
            if event.sequence_hint == record.last_applied_seq {
                return Outcome::Rejected {
                    reason: RejectReason::Duplicate {
                        sequence_hint: event.sequence_hint,
                    },
                };
            }
            if event.sequence_hint < record.last_applied_seq {
                return Outcome::Rejected {
                    reason: RejectReason::Stale {
                        sequence_hint: event.sequence_hint,
                        last_applied_seq: record.last_applied_seq,
                    },
                };
            }
        }

        let Some(rule) = self.registry.resolve(&event.source_system) else {
            return Outcome::Rejected {
                reason: RejectReason::NoRule {
                    source_system: event.source_system.clone(),
                },
            };
        };

        let decision = match rule.decide(current, event) {
            Ok(decision) => decision,
            Err(e) => {
                return Outcome::Rejected {
                    reason: RejectReason::Validation(e),
                }
            }
        };

        // Every produced sub-schema value is validated before acceptance.
        for (name, value) in &decision.sub_schema_values {
            if let Some(validator) = self.sub_schema_validators.get(name) {
                if let Err(e) = validator.validate(value) {
                    return Outcome::Rejected {
                        reason: RejectReason::Validation(e),
                    };
                }
            }
        }

        // Build the change set; names whose value did not actually move are
        // dropped, so a rule over-reporting `changed` stays honest.
        let mut change_set = Vec::new();
        for name in &decision.changed {
            let previous_value = current.and_then(|r| r.sub_schema(name)).cloned();
            let new_value = decision.sub_schema_values.get(name).cloned();
            if previous_value == new_value {
                continue;
            }
            change_set.push(FieldChange {
                sub_schema_name: name.clone(),
                previous_value,
                new_value,
            });
        }

        if change_set.is_empty() {
            return Outcome::Rejected {
                reason: RejectReason::NoOp,
            };
        }

        let mut new_record = current
            .cloned()
            .unwrap_or_else(|| UnifiedRecord::empty(event.identity_key.clone()));
        for (name, value) in decision.sub_schema_values {
            new_record.sub_schemas.insert(name, value);
        }
        for change in &change_set {
            if change.new_value.is_none() {
                new_record.sub_schemas.remove(&change.sub_schema_name);
            }
        }
        new_record.version += 1;
        new_record.last_applied_seq = event.sequence_hint;
        new_record.updated_at = Utc::now();

        let changed_sub_schemas: BTreeSet<String> = change_set
            .iter()
            .map(|c| c.sub_schema_name.clone())
            .collect();

        Outcome::Accepted {
            new_record,
            changed_sub_schemas,
            change_set,
        }
    }
}
