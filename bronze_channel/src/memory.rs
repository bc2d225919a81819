//! Process-local channel backed by shared vectors.

use std::{
    collections::{BTreeMap, VecDeque},
    num::NonZeroU32,
    sync::Arc,
};

use async_trait::async_trait;
use bronze_types::{PartitionId, Position};
use bytes::Bytes;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{ChannelError, ChannelReading, ChannelRecord, ChannelWriting, RecordMeta, RecordStream};

#[derive(Debug, Default)]
struct PartitionLog {
    records: Mutex<Vec<Bytes>>,

    /// Errors handed to the next read of any stream on this partition.
    read_errors: Mutex<VecDeque<ChannelError>>,

    /// Errors returned by the next appends to this partition.
    append_errors: Mutex<VecDeque<ChannelError>>,

    /// Wakes streams waiting for new records or injected errors.
    notify: Notify,
}

/// In-memory channel.
///
/// Clones share the same partitions, so one clone can be handed to a publisher and another to a
/// consumer.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    partitions: Arc<BTreeMap<PartitionId, Arc<PartitionLog>>>,
}

impl MemoryChannel {
    pub fn new(n_partitions: NonZeroU32) -> Self {
        let partitions = (0..n_partitions.get())
            .map(|p| (PartitionId::new(p), Arc::default()))
            .collect();
        Self {
            partitions: Arc::new(partitions),
        }
    }

    fn log(&self, partition: PartitionId) -> Result<&Arc<PartitionLog>, ChannelError> {
        self.partitions
            .get(&partition)
            .ok_or_else(|| ChannelError::unknown_partition(partition))
    }

    /// Payloads stored in `partition`, in position order.
    pub fn records(&self, partition: PartitionId) -> Vec<Bytes> {
        self.partitions
            .get(&partition)
            .map(|log| log.records.lock().clone())
            .unwrap_or_default()
    }

    /// Make the next read on `partition` fail with `error`.
    pub fn inject_read_error(
        &self,
        partition: PartitionId,
        error: ChannelError,
    ) -> Result<(), ChannelError> {
        let log = self.log(partition)?;
        log.read_errors.lock().push_back(error);
        log.notify.notify_waiters();
        Ok(())
    }

    /// Make the next append to `partition` fail with `error`.
    pub fn inject_append_error(
        &self,
        partition: PartitionId,
        error: ChannelError,
    ) -> Result<(), ChannelError> {
        let log = self.log(partition)?;
        log.append_errors.lock().push_back(error);
        Ok(())
    }
}

#[async_trait]
impl ChannelWriting for MemoryChannel {
    fn partitions(&self) -> Vec<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    async fn append(
        &self,
        partition: PartitionId,
        payload: Bytes,
    ) -> Result<RecordMeta, ChannelError> {
        let log = self.log(partition)?;

        if let Some(e) = log.append_errors.lock().pop_front() {
            return Err(e);
        }

        let position = {
            let mut records = log.records.lock();
            records.push(payload);
            Position::new(records.len() as u64 - 1)
        };
        log.notify.notify_waiters();

        Ok(RecordMeta {
            partition,
            position,
        })
    }
}

#[async_trait]
impl ChannelReading for MemoryChannel {
    fn partitions(&self) -> Vec<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    async fn stream(
        &self,
        partition: PartitionId,
        from: Position,
    ) -> Result<RecordStream, ChannelError> {
        let log = Arc::clone(self.log(partition)?);

        let stream = stream::unfold((log, from), move |(log, next)| async move {
            loop {
                // registered before looking at the log so an append racing with the checks below
                // still wakes us up
                let notified = log.notify.notified();

                let injected = log.read_errors.lock().pop_front();
                if let Some(e) = injected {
                    return Some((Err(e), (Arc::clone(&log), next)));
                }

                let payload = log.records.lock().get(next.get() as usize).cloned();
                if let Some(payload) = payload {
                    let record = ChannelRecord {
                        partition,
                        position: next,
                        payload,
                    };
                    return Some((Ok(record), (Arc::clone(&log), next.next())));
                }

                notified.await;
            }
        });

        Ok(stream.boxed())
    }

    async fn high_watermark(&self, partition: PartitionId) -> Result<Position, ChannelError> {
        let log = self.log(partition)?;
        let len = log.records.lock().len();
        Ok(Position::new(len as u64))
    }
}
