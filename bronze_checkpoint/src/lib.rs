//! Durable consumer progress.
//!
//! A [`CheckpointStore`] records, per `(consumer group, source, partition)`, the channel position
//! of the last record whose lake write is durable. A [`CursorStore`] records the opaque
//! source-side cursor of a capture relay so a restarted relay resumes where it acknowledged.

use std::fmt::Display;

use async_trait::async_trait;
use bronze_backoff::{BackoffError, Retryable};
use bronze_types::{ConsumerCheckpoint, PartitionId, Position, Source};

pub mod cursor;
mod json;
pub mod store;

pub use cursor::{CursorError, CursorStore, ObjectStoreCursorStore};
pub use store::ObjectStoreCheckpointStore;

/// Identity of a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointKey {
    pub consumer_group: String,
    pub source: Source,
    pub partition: PartitionId,
}

impl CheckpointKey {
    pub fn new(consumer_group: impl Into<String>, source: Source, partition: PartitionId) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            source,
            partition,
        }
    }
}

impl Display for CheckpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/partition={}",
            self.consumer_group, self.source, self.partition
        )
    }
}

impl From<&ConsumerCheckpoint> for CheckpointKey {
    fn from(c: &ConsumerCheckpoint) -> Self {
        Self::new(c.consumer_group.clone(), c.source, c.partition_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to serialize checkpoint {key}: {error}")]
    Serialize {
        key: CheckpointKey,
        error: serde_json::Error,
    },

    #[error("checkpoint {path} is not a valid checkpoint document: {error}")]
    Corrupt {
        path: String,
        error: serde_json::Error,
    },

    #[error("checkpoint store operation on {path} failed: {source}")]
    Store {
        path: String,
        source: BackoffError<object_store::Error>,
    },

    #[error(
        "refusing to move checkpoint {key} backwards from position {committed} to {attempted}"
    )]
    Regression {
        key: CheckpointKey,
        committed: Position,
        attempted: Position,
    },
}

impl Retryable for CheckpointError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Store { source, .. } => !source.is_permanent(),
            Self::Serialize { .. } | Self::Corrupt { .. } | Self::Regression { .. } => false,
        }
    }
}

/// Persistence of consumer checkpoints.
///
/// Each key has exactly one writer: the consumer task that owns the partition.
#[async_trait]
pub trait CheckpointStore: Send + Sync + std::fmt::Debug + 'static {
    /// The committed checkpoint for `key`, or `None` if the partition was never committed.
    async fn load(&self, key: &CheckpointKey) -> Result<Option<ConsumerCheckpoint>, CheckpointError>;

    /// Durably record `position` as the last fully handled record of `key`.
    ///
    /// Committing the current position again is a no-op. Committing a lower position fails with
    /// [`CheckpointError::Regression`] and leaves the stored checkpoint untouched.
    async fn commit(
        &self,
        key: &CheckpointKey,
        position: Position,
    ) -> Result<ConsumerCheckpoint, CheckpointError>;

    /// Every committed checkpoint of `consumer_group`, ordered by source and partition.
    async fn list(&self, consumer_group: &str) -> Result<Vec<ConsumerCheckpoint>, CheckpointError>;
}
