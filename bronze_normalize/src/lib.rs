//! Conversion of raw source change envelopes into [`ChangeEvent`]s.
//!
//! [`normalize`] is a pure function: it performs no I/O, consults no clock and returns the same
//! result for the same input. Failures are permanent by construction, so callers dead-letter the
//! raw event instead of retrying it.

use bronze_types::{ChangeEvent, Payload, Source};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

mod document;
mod relational;

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("malformed event: {reason}")]
    Malformed { reason: String },

    #[error("unsupported operation '{operation}'")]
    UnsupportedOperation { operation: String },
}

impl NormalizeError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    /// Short, stable label used for metrics and dead-letter records.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "malformed",
            Self::UnsupportedOperation { .. } => "unsupported_operation",
        }
    }
}

pub type Result<T, E = NormalizeError> = std::result::Result<T, E>;

/// Map a raw envelope read from `source`'s channel onto a [`ChangeEvent`].
pub fn normalize(source: Source, raw: &[u8]) -> Result<ChangeEvent> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| NormalizeError::malformed(format!("invalid JSON: {e}")))?;
    let Value::Object(envelope) = value else {
        return Err(NormalizeError::malformed("envelope is not a JSON object"));
    };

    match source {
        Source::Relational => relational::normalize(envelope),
        Source::Document => document::normalize(envelope),
    }
}

/// A required, non-empty string field.
fn required_str<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<&'a str> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(NormalizeError::malformed(format!(
            "missing required field '{field}'"
        ))),
        Some(Value::String(s)) if s.trim().is_empty() => Err(NormalizeError::malformed(format!(
            "required field '{field}' is empty"
        ))),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(NormalizeError::malformed(format!(
            "field '{field}' must be a string, got {}",
            type_name(other)
        ))),
    }
}

/// An optional object field; `null` counts as absent.
fn optional_object(obj: &Map<String, Value>, field: &str) -> Result<Option<Payload>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(m)) => Ok(Some(m.clone())),
        Some(other) => Err(NormalizeError::malformed(format!(
            "field '{field}' must be an object, got {}",
            type_name(other)
        ))),
    }
}

/// Parse an instant given as RFC 3339 text, `YYYY-MM-DD HH:MM:SS[.f]+TZ` text, or epoch
/// milliseconds.
fn parse_instant(field: &str, value: &Value) -> Result<DateTime<Utc>> {
    let invalid = || NormalizeError::malformed(format!("field '{field}' is not a valid timestamp"));
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z"))
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| invalid()),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
