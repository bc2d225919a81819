//! Change stream events, as relaxed extended JSON.

use bronze_types::{ChangeEvent, Operation, Payload, Source, SourceSequence};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::{NormalizeError, Result, optional_object, parse_instant, required_str};

pub(crate) fn normalize(envelope: Map<String, Value>) -> Result<ChangeEvent> {
    let operation_type = required_str(&envelope, "operationType")?;
    let operation = match operation_type {
        "insert" => Operation::Insert,
        "update" | "replace" => Operation::Update,
        "delete" => Operation::Delete,
        other => {
            return Err(NormalizeError::UnsupportedOperation {
                operation: other.to_string(),
            });
        }
    };

    let namespace = optional_object(&envelope, "ns")?
        .ok_or_else(|| NormalizeError::malformed("missing required field 'ns'"))?;
    let entity = required_str(&namespace, "coll")
        .map_err(|_| NormalizeError::malformed("missing required field 'ns.coll'"))?
        .to_string();

    let resume_token = optional_object(&envelope, "_id")?
        .ok_or_else(|| NormalizeError::malformed("missing required field '_id'"))?;
    let source_sequence = SourceSequence::new(
        required_str(&resume_token, "_data")
            .map_err(|_| NormalizeError::malformed("missing required field '_id._data'"))?,
    );

    let source_timestamp = timestamp(&envelope)?;

    let full_document = optional_object(&envelope, "fullDocument")?;
    let document_key = optional_object(&envelope, "documentKey")?;

    let payload = match operation_type {
        "insert" | "replace" => full_document.ok_or_else(|| {
            NormalizeError::malformed(format!("{operation_type} without 'fullDocument'"))
        })?,
        "update" => match full_document {
            Some(doc) => doc,
            None => partial_update(&envelope, document_key)?,
        },
        _ => match optional_object(&envelope, "fullDocumentBeforeChange")? {
            Some(doc) => doc,
            None => document_key.ok_or_else(|| {
                NormalizeError::malformed("delete without 'documentKey'")
            })?,
        },
    };

    Ok(ChangeEvent {
        source: Source::Document,
        entity,
        operation,
        payload,
        source_timestamp,
        source_sequence,
    })
}

/// Identity merged with the changed fields; removed fields are reported as `null`.
fn partial_update(envelope: &Map<String, Value>, document_key: Option<Payload>) -> Result<Payload> {
    let mut payload = document_key
        .ok_or_else(|| NormalizeError::malformed("update without 'fullDocument' or 'documentKey'"))?;

    if let Some(description) = optional_object(envelope, "updateDescription")? {
        if let Some(updated) = optional_object(&description, "updatedFields")? {
            payload.extend(updated);
        }
        if let Some(Value::Array(removed)) = description.get("removedFields") {
            for field in removed.iter().filter_map(Value::as_str) {
                payload.insert(field.to_string(), Value::Null);
            }
        }
    }

    Ok(payload)
}

/// The operation's cluster time, falling back to the server wall clock time of the event.
fn timestamp(envelope: &Map<String, Value>) -> Result<DateTime<Utc>> {
    if let Some(cluster_time) = envelope.get("clusterTime").filter(|v| !v.is_null()) {
        return cluster_time_seconds(cluster_time)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| NormalizeError::malformed("field 'clusterTime' is not a timestamp"));
    }

    match envelope.get("wallTime") {
        None | Some(Value::Null) => Err(NormalizeError::malformed(
            "missing required field 'clusterTime'",
        )),
        Some(Value::Object(date)) => match date.get("$date") {
            Some(Value::Object(long)) => long
                .get("$numberLong")
                .and_then(Value::as_str)
                .and_then(|ms| ms.parse::<i64>().ok())
                .and_then(DateTime::from_timestamp_millis)
                .ok_or_else(|| NormalizeError::malformed("field 'wallTime' is not a timestamp")),
            Some(v) => parse_instant("wallTime", v),
            None => Err(NormalizeError::malformed("field 'wallTime' is not a timestamp")),
        },
        Some(v) => parse_instant("wallTime", v),
    }
}

/// `{"$timestamp": {"t": <seconds>, "i": <increment>}}` or plain seconds.
fn cluster_time_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Object(obj) => obj.get("$timestamp")?.get("t")?.as_i64(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}
