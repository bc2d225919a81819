//! Durable, partitioned channels that decouple change capture from consumption.
//!
//! A channel is an ordered log per partition. Writers append raw change envelopes, readers stream
//! them back from any [`Position`], so a consumer can resume from its last checkpoint after a
//! restart.
//!
//! Implementations:
//!
//! * [`memory::MemoryChannel`]: process-local, for tests and single-process runs.
//! * [`file::FileChannel`]: one append-only, checksummed file per partition.
//! * `kafka::{KafkaChannelWriter, KafkaChannelReader}`: Kafka topics, behind the `kafka`
//!   feature.

use std::error::Error;

use async_trait::async_trait;
use bronze_backoff::Retryable;
use bronze_types::{PartitionId, Position};
use bytes::Bytes;
use futures::stream::BoxStream;
use twox_hash::XxHash64;

pub mod file;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

#[cfg(test)]
mod test_utils;

/// Category of a [`ChannelError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelErrorKind {
    /// I/O or broker communication failure. Retrying may help.
    Io,

    /// Stored data could not be decoded.
    InvalidData,

    /// The requested partition does not exist in this channel.
    UnknownPartition,

    /// Anything else.
    Unknown,
}

#[derive(Debug, thiserror::Error)]
#[error("ChannelError({kind:?}): {inner}")]
pub struct ChannelError {
    kind: ChannelErrorKind,
    #[source]
    inner: Box<dyn Error + Sync + Send>,
}

impl ChannelError {
    pub fn new(kind: ChannelErrorKind, e: impl Into<Box<dyn Error + Sync + Send>>) -> Self {
        Self {
            kind,
            inner: e.into(),
        }
    }

    pub fn io(e: impl Into<Box<dyn Error + Sync + Send>>) -> Self {
        Self::new(ChannelErrorKind::Io, e)
    }

    pub fn invalid_data(e: impl Into<Box<dyn Error + Sync + Send>>) -> Self {
        Self::new(ChannelErrorKind::InvalidData, e)
    }

    pub fn unknown_partition(partition: PartitionId) -> Self {
        Self::new(
            ChannelErrorKind::UnknownPartition,
            format!("unknown partition {partition}"),
        )
    }

    pub fn kind(&self) -> ChannelErrorKind {
        self.kind
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e)
    }
}

impl Retryable for ChannelError {
    fn is_transient(&self) -> bool {
        matches!(self.kind, ChannelErrorKind::Io | ChannelErrorKind::Unknown)
    }
}

/// Where an appended record landed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub partition: PartitionId,
    pub position: Position,
}

/// A record read back from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub partition: PartitionId,
    pub position: Position,
    pub payload: Bytes,
}

impl ChannelRecord {
    pub fn meta(&self) -> RecordMeta {
        RecordMeta {
            partition: self.partition,
            position: self.position,
        }
    }
}

/// Output stream of [`ChannelReading::stream`].
///
/// Yields records of one partition in position order. The stream stays pending while the
/// partition has no new records and does not terminate on its own.
pub type RecordStream = BoxStream<'static, Result<ChannelRecord, ChannelError>>;

/// Appends records to a channel.
///
/// Appends to one partition are serialized, so records keep the order in which their appends
/// completed.
#[async_trait]
pub trait ChannelWriting: Sync + Send + std::fmt::Debug + 'static {
    /// Partitions of the channel, in ascending order.
    fn partitions(&self) -> Vec<PartitionId>;

    /// Durably append `payload` to `partition`.
    async fn append(&self, partition: PartitionId, payload: Bytes)
    -> Result<RecordMeta, ChannelError>;
}

/// Reads records from a channel.
#[async_trait]
pub trait ChannelReading: Sync + Send + std::fmt::Debug + 'static {
    /// Partitions of the channel, in ascending order.
    fn partitions(&self) -> Vec<PartitionId>;

    /// Stream the records of `partition`, starting with the one at `from`.
    async fn stream(&self, partition: PartitionId, from: Position)
    -> Result<RecordStream, ChannelError>;

    /// Position the next appended record of `partition` will get.
    async fn high_watermark(&self, partition: PartitionId) -> Result<Position, ChannelError>;
}

/// Stable partition for a routing key, so all changes of one entity stay in order.
pub fn partition_for_key(key: &[u8], partitions: &[PartitionId]) -> Option<PartitionId> {
    if partitions.is_empty() {
        return None;
    }
    let idx = XxHash64::oneshot(0, key) % partitions.len() as u64;
    Some(partitions[idx as usize])
}
