//! Decoder for the `pgoutput` logical replication protocol (version 1).
//!
//! Turns the binary messages returned by `pg_logical_slot_peek_binary_changes` into the
//! relational change envelope:
//!
//! ```text
//! {"lsn": "00000016/B374D848", "ordinal": 0, "schema": "public", "table": "users",
//!  "operation": "INSERT", "timestamp": "2024-03-07T10:00:00Z", "data": {...}, "old": {...},
//!  "key": {...}}
//! ```
//!
//! `ordinal` numbers the changes of a transaction from zero. The rows of a multi-row WAL record
//! share its LSN and are told apart by it.

use std::collections::HashMap;

use bronze_types::SourceSequence;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value, json};

use crate::RawChange;

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[allow(missing_copy_implementations)]
pub enum PgOutputError {
    #[error("message truncated while reading {0}")]
    Truncated(&'static str),

    #[error("row message references unknown relation {0}")]
    UnknownRelation(u32),

    #[error("unexpected tuple tag '{0}'")]
    UnexpectedTag(char),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("row change outside of a transaction")]
    NoTransaction,

    #[error("invalid commit timestamp {0}")]
    InvalidTimestamp(i64),

    #[error("transaction holds more changes than can be numbered")]
    TransactionTooLarge,
}

type Result<T, E = PgOutputError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Column {
    name: String,
    type_oid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Relation {
    schema: String,
    table: String,
    columns: Vec<Column>,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Begin {
        final_lsn: u64,
        timestamp: DateTime<Utc>,
    },
    Commit {
        commit_lsn: u64,
        end_lsn: u64,
        timestamp: DateTime<Utc>,
    },
    Row(RowChange),
    Truncate {
        tables: Vec<(String, String)>,
    },
    /// Relation, type and origin messages; consumed by the decoder itself.
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub schema: String,
    pub table: String,
    pub operation: &'static str,
    pub new: Option<Map<String, Value>>,
    pub old: Option<Map<String, Value>>,
    /// `old` holds only the replica identity columns.
    pub old_is_key: bool,
}

#[derive(Debug, Default)]
pub struct PgOutputDecoder {
    relations: HashMap<u32, Relation>,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<Message> {
        let mut r = Reader(data);
        let tag = r.u8("message tag")?;
        match tag {
            b'B' => {
                let final_lsn = r.u64("begin lsn")?;
                let timestamp = pg_timestamp(r.i64("begin timestamp")?)?;
                Ok(Message::Begin {
                    final_lsn,
                    timestamp,
                })
            }
            b'C' => {
                r.u8("commit flags")?;
                let commit_lsn = r.u64("commit lsn")?;
                let end_lsn = r.u64("commit end lsn")?;
                let timestamp = pg_timestamp(r.i64("commit timestamp")?)?;
                Ok(Message::Commit {
                    commit_lsn,
                    end_lsn,
                    timestamp,
                })
            }
            b'R' => {
                let id = r.u32("relation id")?;
                let schema = r.cstr("relation namespace")?;
                let table = r.cstr("relation name")?;
                r.u8("replica identity")?;
                let n = r.u16("column count")?;
                let columns = (0..n)
                    .map(|_| {
                        r.u8("column flags")?;
                        let name = r.cstr("column name")?;
                        let type_oid = r.u32("column type")?;
                        r.u32("column type modifier")?;
                        Ok(Column { name, type_oid })
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.relations.insert(
                    id,
                    Relation {
                        schema,
                        table,
                        columns,
                    },
                );
                Ok(Message::Other)
            }
            b'I' => {
                let rel = self.relation(r.u32("relation id")?)?;
                expect_tag(&mut r, b'N')?;
                let new = tuple(&mut r, rel)?;
                Ok(Message::Row(RowChange {
                    schema: rel.schema.clone(),
                    table: rel.table.clone(),
                    operation: "INSERT",
                    new: Some(new),
                    old: None,
                    old_is_key: false,
                }))
            }
            b'U' => {
                let rel = self.relation(r.u32("relation id")?)?;
                let (mut old, mut old_is_key) = (None, false);
                let mut tag = r.u8("update tuple tag")?;
                if tag == b'K' || tag == b'O' {
                    old_is_key = tag == b'K';
                    old = Some(tuple(&mut r, rel)?);
                    tag = r.u8("update tuple tag")?;
                }
                if tag != b'N' {
                    return Err(PgOutputError::UnexpectedTag(tag as char));
                }
                let new = tuple(&mut r, rel)?;
                Ok(Message::Row(RowChange {
                    schema: rel.schema.clone(),
                    table: rel.table.clone(),
                    operation: "UPDATE",
                    new: Some(new),
                    old,
                    old_is_key,
                }))
            }
            b'D' => {
                let rel = self.relation(r.u32("relation id")?)?;
                let tag = r.u8("delete tuple tag")?;
                if tag != b'K' && tag != b'O' {
                    return Err(PgOutputError::UnexpectedTag(tag as char));
                }
                let old = tuple(&mut r, rel)?;
                Ok(Message::Row(RowChange {
                    schema: rel.schema.clone(),
                    table: rel.table.clone(),
                    operation: "DELETE",
                    new: None,
                    old: Some(old),
                    old_is_key: tag == b'K',
                }))
            }
            b'T' => {
                let n = r.u32("truncate relation count")?;
                r.u8("truncate options")?;
                let tables = (0..n)
                    .map(|_| {
                        let rel = self.relation(r.u32("truncated relation")?)?;
                        Ok((rel.schema.clone(), rel.table.clone()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Message::Truncate { tables })
            }
            _ => Ok(Message::Other),
        }
    }

    fn relation(&self, id: u32) -> Result<&Relation> {
        self.relations
            .get(&id)
            .ok_or(PgOutputError::UnknownRelation(id))
    }
}

/// Builds the relational envelope of the `ordinal`-th change of a transaction, recorded at `lsn`
/// and committed at `timestamp`.
pub fn envelope(change: &RowChange, lsn: u64, ordinal: u32, timestamp: DateTime<Utc>) -> Value {
    let mut v = json!({
        "lsn": SourceSequence::from_lsn(lsn).as_str(),
        "ordinal": ordinal,
        "schema": change.schema,
        "table": change.table,
        "operation": change.operation,
        "timestamp": timestamp.to_rfc3339(),
    });
    if let Some(obj) = v.as_object_mut() {
        if let Some(new) = &change.new {
            obj.insert("data".into(), Value::Object(new.clone()));
        }
        if let Some(old) = &change.old {
            let field = if change.old_is_key { "key" } else { "old" };
            obj.insert(field.into(), Value::Object(old.clone()));
        }
    }
    v
}

/// Groups decoded messages into committed transactions.
///
/// Changes are released only once their transaction commits; every change of a transaction
/// carries the commit end LSN as its cursor, which is where the slot may be advanced to.
#[derive(Debug, Default)]
pub struct TransactionBuffer {
    decoder: PgOutputDecoder,
    timestamp: Option<DateTime<Utc>>,
    pending: Vec<(String, Value)>,
}

impl TransactionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the message at `lsn`. Returns the changes of a transaction when `data` commits it.
    pub fn push(&mut self, lsn: u64, data: &[u8]) -> Result<Option<Vec<RawChange>>> {
        match self.decoder.decode(data)? {
            Message::Begin { timestamp, .. } => {
                self.timestamp = Some(timestamp);
                self.pending.clear();
                Ok(None)
            }
            Message::Row(change) => {
                let ts = self.timestamp.ok_or(PgOutputError::NoTransaction)?;
                let ordinal = self.next_ordinal()?;
                self.pending
                    .push((change.table.clone(), envelope(&change, lsn, ordinal, ts)));
                Ok(None)
            }
            Message::Truncate { tables } => {
                let ts = self.timestamp.ok_or(PgOutputError::NoTransaction)?;
                for (schema, table) in tables {
                    let v = json!({
                        "lsn": SourceSequence::from_lsn(lsn).as_str(),
                        "ordinal": self.next_ordinal()?,
                        "schema": schema,
                        "table": table,
                        "operation": "TRUNCATE",
                        "timestamp": ts.to_rfc3339(),
                    });
                    self.pending.push((table, v));
                }
                Ok(None)
            }
            Message::Commit { end_lsn, .. } => {
                self.timestamp = None;
                let cursor = SourceSequence::from_lsn(end_lsn).as_str().to_string();
                let changes = self
                    .pending
                    .drain(..)
                    .map(|(entity, v)| RawChange {
                        entity,
                        payload: Bytes::from(v.to_string()),
                        cursor: cursor.clone(),
                    })
                    .collect();
                Ok(Some(changes))
            }
            Message::Other => Ok(None),
        }
    }

    fn next_ordinal(&self) -> Result<u32> {
        u32::try_from(self.pending.len()).map_err(|_| PgOutputError::TransactionTooLarge)
    }
}

fn pg_timestamp(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(PG_EPOCH_OFFSET_SECS, 0)
        .and_then(|epoch| epoch.checked_add_signed(TimeDelta::microseconds(micros)))
        .ok_or(PgOutputError::InvalidTimestamp(micros))
}

fn expect_tag(r: &mut Reader<'_>, expected: u8) -> Result<()> {
    let tag = r.u8("tuple tag")?;
    if tag != expected {
        return Err(PgOutputError::UnexpectedTag(tag as char));
    }
    Ok(())
}

fn tuple(r: &mut Reader<'_>, rel: &Relation) -> Result<Map<String, Value>> {
    let n = r.u16("tuple column count")? as usize;
    let mut out = Map::new();
    for idx in 0..n {
        let kind = r.u8("tuple column kind")?;
        let column = rel.columns.get(idx);
        let value = match kind {
            b'n' => Some(Value::Null),
            // unchanged TOAST value, not sent
            b'u' => None,
            b't' => {
                let len = r.u32("column length")? as usize;
                let raw = r.bytes(len, "column value")?;
                let text = std::str::from_utf8(raw).map_err(|_| PgOutputError::InvalidUtf8)?;
                Some(text_value(text, column.map(|c| c.type_oid).unwrap_or_default()))
            }
            other => return Err(PgOutputError::UnexpectedTag(other as char)),
        };
        if let (Some(column), Some(value)) = (column, value) {
            out.insert(column.name.clone(), value);
        }
    }
    Ok(out)
}

/// Convert the text output of a column into JSON by its type oid.
fn text_value(text: &str, type_oid: u32) -> Value {
    const BOOL: u32 = 16;
    const INT8: u32 = 20;
    const INT2: u32 = 21;
    const INT4: u32 = 23;
    const JSON: u32 = 114;
    const FLOAT4: u32 = 700;
    const FLOAT8: u32 = 701;
    const JSONB: u32 = 3802;

    match type_oid {
        BOOL => Value::Bool(text == "t"),
        INT2 | INT4 | INT8 => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        FLOAT4 | FLOAT8 => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),
        JSON | JSONB => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        _ => Value::String(text.to_string()),
    }
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        if self.0.len() < n {
            return Err(PgOutputError::Truncated(what));
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N]> {
        let mut out = [0; N];
        out.copy_from_slice(self.bytes(N, what)?);
        Ok(out)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8> {
        Ok(self.array::<1>(what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16> {
        self.array(what).map(u16::from_be_bytes)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32> {
        self.array(what).map(u32::from_be_bytes)
    }

    fn u64(&mut self, what: &'static str) -> Result<u64> {
        self.array(what).map(u64::from_be_bytes)
    }

    fn i64(&mut self, what: &'static str) -> Result<i64> {
        self.array(what).map(i64::from_be_bytes)
    }

    fn cstr(&mut self, what: &'static str) -> Result<String> {
        let end = self
            .0
            .iter()
            .position(|b| *b == 0)
            .ok_or(PgOutputError::Truncated(what))?;
        let s = std::str::from_utf8(&self.0[..end]).map_err(|_| PgOutputError::InvalidUtf8)?;
        self.0 = &self.0[end + 1..];
        Ok(s.to_string())
    }
}
