//! Kafka-backed channel.
//!
//! Consumer offsets are never committed to Kafka: readers are assigned partitions manually and
//! seek to the position they are asked for, because positions live in the checkpoint store.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bronze_types::{PartitionId, Position};
use bytes::Bytes;
use futures::{StreamExt, stream};
use observability_deps::tracing::{debug, info};
use rdkafka::{
    ClientConfig, Message, Offset, TopicPartitionList,
    consumer::{BaseConsumer, Consumer, StreamConsumer},
    error::KafkaError,
    producer::{FutureProducer, FutureRecord},
    types::RDKafkaErrorCode,
    util::Timeout,
};

use crate::{
    ChannelError, ChannelErrorKind, ChannelReading, ChannelRecord, ChannelWriting, RecordMeta,
    RecordStream,
};

const METADATA_TIMEOUT: Duration = Duration::from_secs(60);

impl From<KafkaError> for ChannelError {
    fn from(e: KafkaError) -> Self {
        let kind = match e.rdkafka_error_code() {
            Some(RDKafkaErrorCode::UnknownPartition) => ChannelErrorKind::UnknownPartition,
            Some(RDKafkaErrorCode::InvalidMessage | RDKafkaErrorCode::BadMessage) => {
                ChannelErrorKind::InvalidData
            }
            _ => ChannelErrorKind::Io,
        };
        Self::new(kind, e)
    }
}

fn blocking_failed(e: tokio::task::JoinError) -> ChannelError {
    ChannelError::new(ChannelErrorKind::Unknown, e)
}

/// Partition ids of `topic`, sorted.
async fn fetch_partitions(topic: &str, cfg: &ClientConfig) -> Result<Vec<PartitionId>, ChannelError> {
    let topic = topic.to_string();
    let probe_consumer: BaseConsumer = cfg.create()?;

    let metadata = tokio::task::spawn_blocking(move || {
        probe_consumer.fetch_metadata(Some(&topic), METADATA_TIMEOUT)
    })
    .await
    .map_err(blocking_failed)??;

    let topic_metadata = metadata
        .topics()
        .first()
        .ok_or_else(|| ChannelError::new(ChannelErrorKind::Unknown, "no metadata for topic"))?;
    if let Some(e) = topic_metadata.error() {
        return Err(ChannelError::new(
            ChannelErrorKind::Io,
            format!("topic metadata error: {e:?}"),
        ));
    }

    let mut partitions: Vec<_> = topic_metadata
        .partitions()
        .iter()
        .map(|p| PartitionId::new(p.id() as u32))
        .collect();
    partitions.sort_unstable();
    Ok(partitions)
}

pub struct KafkaChannelWriter {
    conn: String,
    topic: String,
    partitions: Vec<PartitionId>,
    producer: FutureProducer,
    send_timeout: Duration,
}

// rdkafka's FutureProducer doesn't impl Debug
impl std::fmt::Debug for KafkaChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaChannelWriter")
            .field("conn", &self.conn)
            .field("topic", &self.topic)
            .field("partitions", &self.partitions)
            .finish()
    }
}

impl KafkaChannelWriter {
    pub async fn new(
        conn: impl Into<String> + Send,
        topic: impl Into<String> + Send,
        send_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let conn = conn.into();
        let topic = topic.into();

        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", &conn);
        cfg.set("message.timeout.ms", send_timeout.as_millis().to_string());
        cfg.set("request.required.acks", "all"); // equivalent to acks=-1
        cfg.set("enable.idempotence", "true");

        let partitions = fetch_partitions(&topic, &cfg).await?;
        info!(%topic, ?partitions, "found Kafka partitions");

        let producer: FutureProducer = cfg.create()?;

        Ok(Self {
            conn,
            topic,
            partitions,
            producer,
            send_timeout,
        })
    }
}

#[async_trait]
impl ChannelWriting for KafkaChannelWriter {
    fn partitions(&self) -> Vec<PartitionId> {
        self.partitions.clone()
    }

    async fn append(
        &self,
        partition: PartitionId,
        payload: Bytes,
    ) -> Result<RecordMeta, ChannelError> {
        if !self.partitions.contains(&partition) {
            return Err(ChannelError::unknown_partition(partition));
        }

        // `FutureRecord` is generic over the key type even without a key, `()` is arbitrary
        let record: FutureRecord<'_, (), _> = FutureRecord::to(&self.topic)
            .payload(payload.as_ref())
            .partition(partition.get() as i32);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(e, _owned_message)| ChannelError::from(e))?;

        debug!(topic = %self.topic, partition, offset, size = payload.len(), "appended to kafka");

        Ok(RecordMeta {
            partition: PartitionId::new(partition as u32),
            position: Position::new(offset as u64),
        })
    }
}

pub struct KafkaChannelReader {
    conn: String,
    topic: String,
    partitions: Vec<PartitionId>,
    cfg: ClientConfig,
    /// Used for watermark lookups only.
    probe: Arc<BaseConsumer>,
}

// rdkafka's consumers don't impl Debug
impl std::fmt::Debug for KafkaChannelReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaChannelReader")
            .field("conn", &self.conn)
            .field("topic", &self.topic)
            .field("partitions", &self.partitions)
            .finish()
    }
}

impl KafkaChannelReader {
    pub async fn new(
        conn: impl Into<String> + Send,
        topic: impl Into<String> + Send,
        consumer_group: &str,
    ) -> Result<Self, ChannelError> {
        let conn = conn.into();
        let topic = topic.into();

        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", &conn);
        cfg.set("session.timeout.ms", "6000");
        cfg.set("enable.auto.commit", "false");
        cfg.set("enable.partition.eof", "false");
        cfg.set("group.id", consumer_group);

        let partitions = fetch_partitions(&topic, &cfg).await?;
        info!(%topic, ?partitions, "found Kafka partitions");

        let probe: BaseConsumer = cfg.create()?;

        Ok(Self {
            conn,
            topic,
            partitions,
            cfg,
            probe: Arc::new(probe),
        })
    }
}

#[async_trait]
impl ChannelReading for KafkaChannelReader {
    fn partitions(&self) -> Vec<PartitionId> {
        self.partitions.clone()
    }

    async fn stream(
        &self,
        partition: PartitionId,
        from: Position,
    ) -> Result<RecordStream, ChannelError> {
        if !self.partitions.contains(&partition) {
            return Err(ChannelError::unknown_partition(partition));
        }

        let consumer: StreamConsumer = self.cfg.create()?;
        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(
            &self.topic,
            partition.get() as i32,
            Offset::Offset(from.get() as i64),
        )?;
        consumer.assign(&assignment)?;

        let stream = stream::unfold(Arc::new(consumer), |consumer| async move {
            let item = match consumer.recv().await {
                Ok(message) => Ok(ChannelRecord {
                    partition: PartitionId::new(message.partition() as u32),
                    position: Position::new(message.offset() as u64),
                    payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
                }),
                Err(e) => Err(ChannelError::from(e)),
            };
            Some((item, consumer))
        });

        Ok(stream.boxed())
    }

    async fn high_watermark(&self, partition: PartitionId) -> Result<Position, ChannelError> {
        let probe = Arc::clone(&self.probe);
        let topic = self.topic.clone();

        let watermarks = tokio::task::spawn_blocking(move || {
            probe.fetch_watermarks(&topic, partition.get() as i32, METADATA_TIMEOUT)
        })
        .await
        .map_err(blocking_failed)?;

        match watermarks {
            Ok((_low, high)) => Ok(Position::new(high.max(0) as u64)),
            Err(KafkaError::MetadataFetch(RDKafkaErrorCode::UnknownPartition)) => {
                Err(ChannelError::unknown_partition(partition))
            }
            Err(e) => Err(e.into()),
        }
    }
}
