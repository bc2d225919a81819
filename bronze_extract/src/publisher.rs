//! Appending raw change events to the per-source channels.

use std::{collections::BTreeMap, sync::Arc};

use bronze_backoff::{Backoff, BackoffConfig, BackoffError};
use bronze_channel::{ChannelError, ChannelWriting, RecordMeta, partition_for_key};
use bronze_types::PartitionId;
use bytes::Bytes;
use metric::{Attributes, U64Counter};
use observability_deps::tracing::{debug, error};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("no channel named '{0}' is configured")]
    UnknownChannel(String),

    #[error("channel '{channel}' has no partitions")]
    NoPartitions { channel: String },

    #[error("failed to publish to channel '{channel}': {source}")]
    Exhausted {
        channel: String,
        source: BackoffError<ChannelError>,
    },
}

#[derive(Debug)]
struct PublishTarget {
    writer: Arc<dyn ChannelWriting>,
    failed: U64Counter,
}

/// Hands raw source events to the named durable channels.
///
/// A publish returns once the channel acknowledged the record as durable.
#[derive(Debug)]
pub struct ChangePublisher {
    channels: BTreeMap<String, PublishTarget>,
    backoff: BackoffConfig,
}

impl ChangePublisher {
    pub fn new(
        channels: impl IntoIterator<Item = (String, Arc<dyn ChannelWriting>)>,
        backoff: BackoffConfig,
        metrics: &metric::Registry,
    ) -> Self {
        let failed = metrics.register_metric::<U64Counter>(
            "bronze_publish_failed",
            "number of raw change events that could not be appended to their channel",
        );

        let channels = channels
            .into_iter()
            .map(|(name, writer)| {
                let failed = failed.recorder(Attributes::from([("channel", name.clone().into())]));
                (name, PublishTarget { writer, failed })
            })
            .collect();

        Self { channels, backoff }
    }

    /// Names of the configured channels.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Append `raw` to partition 0 of `channel`.
    pub async fn publish(&self, channel: &str, raw: Bytes) -> Result<RecordMeta, PublishError> {
        self.append(channel, raw, |_| Some(PartitionId::new(0))).await
    }

    /// Append `raw` to the partition of `channel` that `key` hashes to.
    ///
    /// Events sharing a key land on one partition, so their relative order is kept.
    pub async fn publish_keyed(
        &self,
        channel: &str,
        key: &[u8],
        raw: Bytes,
    ) -> Result<RecordMeta, PublishError> {
        self.append(channel, raw, |partitions| {
            partition_for_key(key, partitions)
        })
        .await
    }

    async fn append<F>(&self, channel: &str, raw: Bytes, pick: F) -> Result<RecordMeta, PublishError>
    where
        F: FnOnce(&[PartitionId]) -> Option<PartitionId> + Send,
    {
        let target = self
            .channels
            .get(channel)
            .ok_or_else(|| PublishError::UnknownChannel(channel.to_string()))?;

        let partition = pick(&target.writer.partitions()).ok_or_else(|| {
            PublishError::NoPartitions {
                channel: channel.to_string(),
            }
        })?;

        let res = Backoff::new(&self.backoff)
            .retry("channel append", || {
                let writer = Arc::clone(&target.writer);
                let raw = raw.clone();
                async move { writer.append(partition, raw).await }
            })
            .await;

        match res {
            Ok(meta) => {
                debug!(
                    channel,
                    partition = %meta.partition,
                    offset = %meta.position,
                    "published change event"
                );
                Ok(meta)
            }
            Err(source) => {
                target.failed.inc(1);
                error!(channel, %partition, error = %source, "failed to publish change event");
                Err(PublishError::Exhausted {
                    channel: channel.to_string(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroU32, time::Duration};

    use assert_matches::assert_matches;
    use bronze_channel::{ChannelReading, memory::MemoryChannel};
    use bronze_types::Position;
    use metric::Metric;

    use super::*;

    fn backoff() -> BackoffConfig {
        BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            max_attempts: 3,
            ..Default::default()
        }
    }

    fn failed(metrics: &metric::Registry, channel: &'static str) -> u64 {
        metrics
            .get_instrument::<Metric<U64Counter>>("bronze_publish_failed")
            .unwrap()
            .get_observer(&Attributes::from(&[("channel", channel)]))
            .unwrap()
            .fetch()
    }

    #[tokio::test]
    async fn publish_appends_to_partition_zero() {
        let channel = MemoryChannel::new(NonZeroU32::new(2).unwrap());
        let metrics = metric::Registry::default();
        let publisher = ChangePublisher::new(
            [(
                "postgresql-changes".to_string(),
                Arc::new(channel.clone()) as Arc<dyn ChannelWriting>,
            )],
            backoff(),
            &metrics,
        );

        let a = publisher
            .publish("postgresql-changes", Bytes::from_static(b"a"))
            .await
            .unwrap();
        let b = publisher
            .publish("postgresql-changes", Bytes::from_static(b"b"))
            .await
            .unwrap();
        assert_eq!(a.partition, PartitionId::new(0));
        assert_eq!(a.position, Position::new(0));
        assert_eq!(b.position, Position::new(1));
        assert_eq!(
            channel.high_watermark(PartitionId::new(0)).await.unwrap(),
            Position::new(2)
        );
    }

    #[tokio::test]
    async fn keyed_publish_is_stable_per_key() {
        let channel = MemoryChannel::new(NonZeroU32::new(4).unwrap());
        let publisher = ChangePublisher::new(
            [(
                "mongodb-changes".to_string(),
                Arc::new(channel.clone()) as Arc<dyn ChannelWriting>,
            )],
            backoff(),
            &metric::Registry::default(),
        );

        let first = publisher
            .publish_keyed("mongodb-changes", b"logs", Bytes::from_static(b"1"))
            .await
            .unwrap();
        let second = publisher
            .publish_keyed("mongodb-changes", b"logs", Bytes::from_static(b"2"))
            .await
            .unwrap();
        assert_eq!(first.partition, second.partition);
        assert_eq!(second.position, first.position.next());
    }

    #[tokio::test]
    async fn unknown_channel() {
        let publisher = ChangePublisher::new(
            Vec::<(String, Arc<dyn ChannelWriting>)>::new(),
            backoff(),
            &metric::Registry::default(),
        );
        assert_matches!(
            publisher.publish("nope", Bytes::new()).await,
            Err(PublishError::UnknownChannel(name)) if name == "nope"
        );
    }

    #[test_log::test(tokio::test)]
    async fn transient_errors_are_retried_then_counted() {
        let channel = MemoryChannel::new(NonZeroU32::new(1).unwrap());
        let metrics = metric::Registry::default();
        let publisher = ChangePublisher::new(
            [(
                "postgresql-changes".to_string(),
                Arc::new(channel.clone()) as Arc<dyn ChannelWriting>,
            )],
            backoff(),
            &metrics,
        );

        // one failure is absorbed by the retry
        channel
            .inject_append_error(PartitionId::new(0), ChannelError::io("broken pipe"))
            .unwrap();
        publisher
            .publish("postgresql-changes", Bytes::from_static(b"a"))
            .await
            .unwrap();
        assert_eq!(failed(&metrics, "postgresql-changes"), 0);

        for _ in 0..3 {
            channel
                .inject_append_error(PartitionId::new(0), ChannelError::io("broken pipe"))
                .unwrap();
        }
        assert_matches!(
            publisher
                .publish("postgresql-changes", Bytes::from_static(b"b"))
                .await,
            Err(PublishError::Exhausted { .. })
        );
        assert_eq!(failed(&metrics, "postgresql-changes"), 1);
        assert_eq!(channel.records(PartitionId::new(0)).len(), 1);
    }
}
