//! Structural validation for payloads and sub-schema values.
//!
//! Each schema is an explicit set of field rules plus a hand-written walk;
//! no runtime reflection. Validation is pure: same input, same errors, no
//! side effects. Errors keep their nested path so callers can serialize
//! them without losing location information.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One validation failure, anchored to a dot-separated path into the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

/// Ordered list of field errors. Order follows rule registration order, so
/// nested structure is preserved in serialized output.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("validation failed with {} field error(s)", .field_errors.len())]
pub struct ValidationError {
    pub field_errors: Vec<FieldError>,
}

impl ValidationError {
    pub fn new(field_errors: Vec<FieldError>) -> Self {
        Self { field_errors }
    }

    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field_errors: vec![FieldError {
                path: path.into(),
                message: message.into(),
            }],
        }
    }

    /// JSON form suitable for persisting alongside a dead-lettered envelope.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(&self.field_errors).unwrap_or_else(|_| Value::Null)
    }
}

/// Anything that can judge a raw JSON value. Pure and side-effect free.
pub trait Validator: Send + Sync {
    fn validate(&self, raw: &Value) -> Result<(), ValidationError>;
}

/// Expected JSON type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Number,
    Bool,
    Object,
    Array,
}

impl ValueKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            ValueKind::String => value.is_string(),
            ValueKind::Number => value.is_number(),
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Object => value.is_object(),
            ValueKind::Array => value.is_array(),
        }
    }

    fn describe(self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::Number => "number",
            ValueKind::Bool => "boolean",
            ValueKind::Object => "object",
            ValueKind::Array => "array",
        }
    }
}

#[derive(Debug, Clone)]
struct FieldRule {
    path: String,
    kind: ValueKind,
    required: bool,
}

/// Explicit, rule-based schema validator.
///
/// ```
/// use uniflow_common::validate::{SchemaValidator, Validator, ValueKind};
///
/// let schema = SchemaValidator::new("contact")
///     .require("email", ValueKind::String)
///     .optional("phone.mobile", ValueKind::String);
/// assert!(schema.validate(&serde_json::json!({"email": "a@b.co"})).is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct SchemaValidator {
    name: String,
    rules: Vec<FieldRule>,
}

impl SchemaValidator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The field must be present and of the given kind. Required strings
    /// must also be non-empty.
    pub fn require(mut self, path: impl Into<String>, kind: ValueKind) -> Self {
        self.rules.push(FieldRule {
            path: path.into(),
            kind,
            required: true,
        });
        self
    }

    /// The field may be absent; if present it must be of the given kind.
    pub fn optional(mut self, path: impl Into<String>, kind: ValueKind) -> Self {
        self.rules.push(FieldRule {
            path: path.into(),
            kind,
            required: false,
        });
        self
    }

    fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
        let mut current = root;
        for segment in path.split('.') {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }
}

impl Validator for SchemaValidator {
    fn validate(&self, raw: &Value) -> Result<(), ValidationError> {
        if !raw.is_object() {
            return Err(ValidationError::single(
                "",
                format!("{} value must be an object", self.name),
            ));
        }

        let mut errors = Vec::new();
        for rule in &self.rules {
            match Self::lookup(raw, &rule.path) {
                None | Some(Value::Null) => {
                    if rule.required {
                        errors.push(FieldError {
                            path: rule.path.clone(),
                            message: "required field is missing".to_string(),
                        });
                    }
                }
                Some(value) if !rule.kind.matches(value) => {
                    errors.push(FieldError {
                        path: rule.path.clone(),
                        message: format!("expected {}", rule.kind.describe()),
                    });
                }
                Some(Value::String(s)) if rule.required && s.is_empty() => {
                    errors.push(FieldError {
                        path: rule.path.clone(),
                        message: "must not be empty".to_string(),
                    });
                }
                Some(_) => {}
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(errors))
        }
    }
}
