//! Shared vocabulary of the bronze ingestion pipeline.
//!
//! Everything that crosses a crate boundary lives here: the two capture [`Source`]s, the
//! normalized [`ChangeEvent`], the per-partition [`ConsumerCheckpoint`] and the channel
//! addressing types [`PartitionId`] and [`Position`].

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

mod checkpoint;
mod event;

pub use checkpoint::ConsumerCheckpoint;
pub use event::{ChangeEvent, EventId, InvalidLsn, Payload, SourceSequence};

/// Origin system of a change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Row changes read from a logical replication slot.
    Relational,
    /// Document changes read from a change stream.
    Document,
}

impl Source {
    /// Both sources, in a stable order.
    pub const ALL: [Self; 2] = [Self::Relational, Self::Document];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Document => "document",
        }
    }
}

impl Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown source '{0}', expected 'relational' or 'document'")]
pub struct UnknownSource(String);

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relational" => Ok(Self::Relational),
            "document" => Ok(Self::Document),
            _ => Err(UnknownSource(s.to_string())),
        }
    }
}

/// Kind of change carried by a [`ChangeEvent`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partition of a durable channel.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct PartitionId(u32);

impl PartitionId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Offset of a record within a channel partition.
///
/// Offsets start at zero and grow by one per appended record.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct Position(u64);

impl Position {
    pub const ZERO: Self = Self(0);

    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    /// The position immediately after this one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_round_trips_through_str() {
        for source in Source::ALL {
            assert_eq!(source.as_str().parse::<Source>().unwrap(), source);
        }
        assert_eq!("Document".parse::<Source>().unwrap(), Source::Document);
        assert!("kafka".parse::<Source>().is_err());
    }

    #[test]
    fn source_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Source::Relational).unwrap(),
            r#""relational""#
        );
        assert_eq!(
            serde_json::to_string(&Operation::Delete).unwrap(),
            r#""delete""#
        );
    }

    #[test]
    fn position_next_saturates() {
        assert_eq!(Position::new(41).next(), Position::new(42));
        assert_eq!(Position::new(u64::MAX).next(), Position::new(u64::MAX));
    }
}
