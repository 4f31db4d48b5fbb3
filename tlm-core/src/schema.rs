use std::fmt;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::{codec::kind_name, event::map_pointer, Event};

/// Payload constraints checked by the pipeline before the plugin chain.
#[derive(Deserialize, Debug, Clone)]
pub struct Schema {
    #[serde(default)]
    pub required: Vec<FieldRule>,
    #[serde(default)]
    pub max_fields: Option<usize>,
    #[serde(default = "default_reject_empty")]
    pub reject_empty: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FieldRule {
    // JSON Pointer into the payload
    pub field: String,
    #[serde(default)]
    pub kind: FieldKind,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Any,
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("missing required field {0}")]
    MissingField(String),
    #[error("field {field} should be {expected}, found {found}")]
    WrongKind {
        field: String,
        expected: FieldKind,
        found: &'static str,
    },
    #[error("payload has {count} fields, more than the allowed {max}")]
    TooManyFields { count: usize, max: usize },
}

fn default_reject_empty() -> bool {
    true
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            required: Vec::new(),
            max_fields: None,
            reject_empty: default_reject_empty(),
        }
    }
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, field: impl Into<String>, kind: FieldKind) -> Self {
        self.required.push(FieldRule {
            field: field.into(),
            kind,
        });
        self
    }

    pub fn max_fields(mut self, max: usize) -> Self {
        self.max_fields = Some(max);
        self
    }

    /// Validates an event, handing it back when it conforms.
    pub fn validate(&self, event: Event) -> Result<Event, SchemaError> {
        self.check(&event)?;
        Ok(event)
    }

    /// Same as [`Schema::validate`] without taking ownership, so the caller
    /// can still route a rejected event somewhere.
    pub fn check(&self, event: &Event) -> Result<(), SchemaError> {
        if self.reject_empty && event.payload.is_empty() {
            return Err(SchemaError::EmptyPayload);
        }
        if let Some(max) = self.max_fields {
            if event.payload.len() > max {
                return Err(SchemaError::TooManyFields {
                    count: event.payload.len(),
                    max,
                });
            }
        }
        for rule in &self.required {
            let value = map_pointer(&event.payload, &rule.field)
                .ok_or_else(|| SchemaError::MissingField(rule.field.clone()))?;
            if !rule.kind.matches(value) {
                return Err(SchemaError::WrongKind {
                    field: rule.field.clone(),
                    expected: rule.kind,
                    found: kind_name(value),
                });
            }
        }
        Ok(())
    }
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::Any => !value.is_null(),
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Any => "any non-null value",
            FieldKind::String => "a string",
            FieldKind::Number => "a number",
            FieldKind::Integer => "an integer",
            FieldKind::Boolean => "a boolean",
            FieldKind::Object => "an object",
            FieldKind::Array => "an array",
        };
        f.write_str(name)
    }
}
