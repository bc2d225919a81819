//! Envelopes produced by the relational capture relay.
//!
//! ```json
//! {"lsn": "16/B374D848", "ordinal": 0, "schema": "public", "table": "users",
//!  "operation": "UPDATE", "timestamp": "2024-03-07T10:00:00Z", "data": {...}, "old": {...},
//!  "key": {...}}
//! ```
//!
//! `ordinal`, the position of the change within its transaction, is optional. When present it
//! becomes part of the sequence, so rows decoded from one WAL record keep distinct ids.

use bronze_types::{ChangeEvent, Operation, Payload, Source, SourceSequence};
use serde_json::{Map, Value};

use crate::{NormalizeError, Result, optional_object, parse_instant, required_str};

pub(crate) fn normalize(envelope: Map<String, Value>) -> Result<ChangeEvent> {
    let entity = required_str(&envelope, "table")?.to_string();

    let operation = match required_str(&envelope, "operation")?.to_ascii_lowercase().as_str() {
        "insert" | "i" => Operation::Insert,
        "update" | "u" => Operation::Update,
        "delete" | "d" => Operation::Delete,
        other => {
            return Err(NormalizeError::UnsupportedOperation {
                operation: other.to_string(),
            });
        }
    };

    let lsn = required_str(&envelope, "lsn")?;
    let lsn = SourceSequence::lsn_value(lsn).map_err(|e| NormalizeError::malformed(e.to_string()))?;
    let source_sequence = match envelope.get("ordinal") {
        None | Some(Value::Null) => SourceSequence::from_lsn(lsn),
        Some(v) => {
            let ordinal = v
                .as_u64()
                .and_then(|o| u32::try_from(o).ok())
                .ok_or_else(|| {
                    NormalizeError::malformed(format!("field 'ordinal' is not a valid ordinal: {v}"))
                })?;
            SourceSequence::from_lsn_ordinal(lsn, ordinal)
        }
    };

    let source_timestamp = match envelope.get("timestamp") {
        None | Some(Value::Null) => {
            return Err(NormalizeError::malformed(
                "missing required field 'timestamp'",
            ));
        }
        Some(v) => parse_instant("timestamp", v)?,
    };

    let payload = match operation {
        Operation::Insert | Operation::Update => optional_object(&envelope, "data")?
            .ok_or_else(|| {
                NormalizeError::malformed(format!("{operation} without a 'data' object"))
            })?,
        // pre-change state when the table publishes it, otherwise the replica identity
        Operation::Delete => match optional_object(&envelope, "old")? {
            Some(old) => old,
            None => optional_object(&envelope, "key")?.unwrap_or_else(Payload::new),
        },
    };

    Ok(ChangeEvent {
        source: Source::Relational,
        entity,
        operation,
        payload,
        source_timestamp,
        source_sequence,
    })
}
