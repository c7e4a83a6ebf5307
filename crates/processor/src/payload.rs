//! Field lookup in opaque event payloads
//!
//! Queries read a handful of fields (`spell_id`, `currency_type`) out of the
//! free-form `event_data` document. A lookup never fails loudly: a missing
//! path, a document that does not parse, or a value that is not a scalar all
//! yield `None`.

use crate::error::{ProcessorError, Result};
use serde_json::Value;
use std::fmt;
use telemetry_types::GameEvent;

/// A dotted path into a JSON document, e.g. `$.spell_id` or `$.item.id`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse `$.a.b`, `a.b` or `a`; numeric segments index into arrays
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim();
        let body = trimmed
            .strip_prefix("$.")
            .or_else(|| trimmed.strip_prefix('$'))
            .unwrap_or(trimmed);

        let segments: Vec<String> = body.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ProcessorError::Configuration {
                source: format!("invalid field path '{}'", path).into(),
            });
        }

        Ok(Self { segments })
    }

    /// Path made of a single top-level key
    pub fn key(name: &str) -> Self {
        Self {
            segments: vec![name.to_string()],
        }
    }

    fn lookup<'a>(&self, document: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(document, |node, segment| match node {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$.{}", self.segments.join("."))
    }
}

/// Capability to read an optional string field by path
pub trait PayloadFields {
    fn extract_str(&self, path: &FieldPath) -> Option<String>;
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

impl PayloadFields for Value {
    fn extract_str(&self, path: &FieldPath) -> Option<String> {
        match self {
            // Payload shipped as an encoded document
            Value::String(raw) => {
                let document: Value = serde_json::from_str(raw).ok()?;
                path.lookup(&document).and_then(scalar_to_string)
            }
            document => path.lookup(document).and_then(scalar_to_string),
        }
    }
}

impl PayloadFields for GameEvent {
    fn extract_str(&self, path: &FieldPath) -> Option<String> {
        self.event_data.as_ref()?.extract_str(path)
    }
}
