use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Operation, Source};

/// Ordered, open mapping of field names to values.
///
/// Unknown fields are carried through untouched and in their original order.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Source-local, monotonically non-decreasing position of a change in its origin system.
///
/// Relational sequences are write-ahead log positions in their canonical
/// `XXXXXXXX/XXXXXXXX` form, so comparing two of them as strings orders them by LSN. Rows
/// decoded from one WAL record share its LSN, so changes captured by the relay also carry their
/// ordinal within the transaction (`XXXXXXXX/XXXXXXXX:XXXXXXXX`). Document sequences are change
/// stream resume tokens and are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceSequence(String);

#[derive(Debug, thiserror::Error)]
#[error("invalid log sequence number '{0}'")]
pub struct InvalidLsn(String);

impl SourceSequence {
    pub fn new(sequence: impl Into<String>) -> Self {
        Self(sequence.into())
    }

    /// Canonical sequence for a 64-bit write-ahead log position.
    pub fn from_lsn(lsn: u64) -> Self {
        Self(format!("{:08X}/{:08X}", lsn >> 32, lsn & 0xFFFF_FFFF))
    }

    /// Sequence of the `ordinal`-th change of a transaction, recorded at `lsn`.
    pub fn from_lsn_ordinal(lsn: u64, ordinal: u32) -> Self {
        let mut sequence = Self::from_lsn(lsn);
        sequence.0.push_str(&format!(":{ordinal:08X}"));
        sequence
    }

    /// Parse a log sequence number in `hi/lo` hex notation (`16/B374D848`).
    pub fn parse_lsn(s: &str) -> Result<Self, InvalidLsn> {
        Self::lsn_value(s).map(Self::from_lsn)
    }

    /// Numeric value of a `hi/lo` log sequence number.
    pub fn lsn_value(s: &str) -> Result<u64, InvalidLsn> {
        let invalid = || InvalidLsn(s.to_string());
        let (hi, lo) = s.trim().split_once('/').ok_or_else(invalid)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok((u64::from(hi) << 32) | u64::from(lo))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SourceSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic identifier of a change, derived only from its source and sequence.
///
/// Two deliveries of the same change always yield the same id, which is what makes lake writes
/// idempotent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(String);

impl EventId {
    const HEX_LEN: usize = 32;

    pub fn new(source: Source, sequence: &SourceSequence) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(sequence.as_str().as_bytes());
        let mut id = hex::encode(hasher.finalize());
        id.truncate(Self::HEX_LEN);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A normalized, source-agnostic change record.
///
/// This is the JSON shape that lands in the lake and that downstream consumers read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub source: Source,
    /// Table name or collection name.
    pub entity: String,
    pub operation: Operation,
    /// Post-change state for inserts and updates; pre-change state or identity keys for deletes.
    pub payload: Payload,
    pub source_timestamp: DateTime<Utc>,
    pub source_sequence: SourceSequence,
}

impl ChangeEvent {
    pub fn event_id(&self) -> EventId {
        EventId::new(self.source, &self.source_sequence)
    }
}
