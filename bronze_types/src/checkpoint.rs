use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{PartitionId, Position, Source};

/// Last fully handled channel position of one consumer group on one partition of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerCheckpoint {
    pub consumer_group: String,
    pub source: Source,
    pub partition_id: PartitionId,
    /// Offset of the last record whose lake (or dead-letter) write is durable.
    pub position: Position,
    pub updated_at: DateTime<Utc>,
}

impl ConsumerCheckpoint {
    /// Where consumption resumes after this checkpoint.
    pub fn resume_from(&self) -> Position {
        self.position.next()
    }
}
