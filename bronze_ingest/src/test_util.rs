use std::{
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bronze_backoff::{BackoffConfig, BackoffError};
use bronze_channel::{ChannelWriting, memory::MemoryChannel};
use bronze_checkpoint::{CheckpointError, CheckpointKey, CheckpointStore, ObjectStoreCheckpointStore};
use bronze_extract::{CaptureExtractor, CaptureHandle, ExtractorError};
use bronze_lake::{LakeSink, LakeWriter, ObjectStoreDeadLetterSink, WriteError, WriteOutcome};
use bronze_types::{ChangeEvent, ConsumerCheckpoint, PartitionId, Position, Source};
use bytes::Bytes;
use futures::TryStreamExt;
use iox_time::{MockProvider, Time};
use metric::{Attributes, Metric, U64Counter, U64Gauge};
use object_store::{ObjectStore, memory::InMemory, path::Path};
use parking_lot::Mutex;
use serde_json::json;

use crate::{ConsumerConfig, ConsumerDeps};

pub(crate) const DEAD_LETTER_PREFIX: &str = "_dead_letter";
pub(crate) const CHECKPOINT_PREFIX: &str = "_checkpoints";
pub(crate) const GROUP: &str = "$Default";

pub(crate) fn fast_backoff(max_attempts: u32) -> BackoffConfig {
    BackoffConfig {
        init_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        base: 2.,
        max_attempts,
        attempt_timeout: Duration::from_secs(5),
    }
}

pub(crate) fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        consumer_group: GROUP.to_string(),
        receive_timeout: Duration::from_millis(20),
        read_backoff: fast_backoff(3),
    }
}

/// Relational envelope of an insert of row `id` into `table` at `lsn`.
pub(crate) fn relational_insert(lsn: u64, table: &str, id: i64) -> Bytes {
    let envelope = json!({
        "lsn": format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF),
        "schema": "public",
        "table": table,
        "operation": "INSERT",
        "timestamp": "2024-03-07T10:00:00Z",
        "data": {"id": id},
    });
    Bytes::from(envelope.to_string())
}

/// Document envelope of an insert of document `id` into `collection`.
pub(crate) fn document_insert(token: &str, collection: &str, id: i64) -> Bytes {
    let envelope = json!({
        "_id": {"_data": token},
        "operationType": "insert",
        "ns": {"db": "app", "coll": collection},
        "clusterTime": {"$timestamp": {"t": 1709805600, "i": 1}},
        "documentKey": {"_id": id},
        "fullDocument": {"_id": id, "kg": 1.5},
    });
    Bytes::from(envelope.to_string())
}

/// Shared state of a consumer test: in-memory channels, object store and checkpoints.
#[derive(Debug)]
pub(crate) struct TestContext {
    pub(crate) relational: MemoryChannel,
    pub(crate) document: MemoryChannel,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) lake: Arc<TestLake>,
    pub(crate) checkpoints: Arc<TestCheckpoints>,
    pub(crate) time_provider: Arc<MockProvider>,
    pub(crate) metrics: Arc<metric::Registry>,
}

impl TestContext {
    pub(crate) fn new(n_partitions: u32) -> Self {
        let n = NonZeroU32::new(n_partitions).expect("at least one partition");
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(
            1_709_805_601_000_000_000,
        )));

        let lake = Arc::new(TestLake::new(LakeWriter::new(
            Arc::clone(&object_store),
            fast_backoff(2),
        )));
        let checkpoints = Arc::new(TestCheckpoints::new(ObjectStoreCheckpointStore::new(
            Arc::clone(&object_store),
            CHECKPOINT_PREFIX,
            Arc::<MockProvider>::clone(&time_provider),
            fast_backoff(2),
        )));

        Self {
            relational: MemoryChannel::new(n),
            document: MemoryChannel::new(n),
            object_store,
            lake,
            checkpoints,
            time_provider,
            metrics: Arc::new(metric::Registry::default()),
        }
    }

    pub(crate) fn deps(&self) -> ConsumerDeps {
        ConsumerDeps {
            lake: Arc::<TestLake>::clone(&self.lake),
            dead_letters: Arc::new(ObjectStoreDeadLetterSink::new(
                Arc::clone(&self.object_store),
                DEAD_LETTER_PREFIX,
                fast_backoff(2),
            )),
            checkpoints: Arc::<TestCheckpoints>::clone(&self.checkpoints),
            time_provider: Arc::<MockProvider>::clone(&self.time_provider),
            metrics: Arc::clone(&self.metrics),
        }
    }

    pub(crate) fn channel(&self, source: Source) -> &MemoryChannel {
        match source {
            Source::Relational => &self.relational,
            Source::Document => &self.document,
        }
    }

    pub(crate) async fn append(&self, source: Source, partition: u32, payload: Bytes) {
        self.channel(source)
            .append(PartitionId::new(partition), payload)
            .await
            .unwrap();
    }

    /// Every object below `prefix`, sorted.
    pub(crate) async fn objects(&self, prefix: &str) -> Vec<String> {
        let prefix = Path::from(prefix);
        let mut paths: Vec<String> = self
            .object_store
            .list(Some(&prefix))
            .map_ok(|m| m.location.to_string())
            .try_collect()
            .await
            .unwrap();
        paths.sort();
        paths
    }

    pub(crate) async fn checkpoint(
        &self,
        source: Source,
        partition: u32,
    ) -> Option<ConsumerCheckpoint> {
        self.checkpoints
            .load(&CheckpointKey::new(GROUP, source, PartitionId::new(partition)))
            .await
            .unwrap()
    }

    /// Poll until the checkpoint of `partition` reaches `position`.
    pub(crate) async fn wait_for_checkpoint(&self, source: Source, partition: u32, position: u64) {
        loop {
            if let Some(c) = self.checkpoint(source, partition).await {
                if c.position >= Position::new(position) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn injected_store_error(task: &str) -> BackoffError<object_store::Error> {
    BackoffError::Permanent {
        task: task.to_string(),
        source: object_store::Error::Generic {
            store: "test",
            source: "injected failure".into(),
        },
    }
}

/// [`LakeWriter`] that records what it wrote and can be told to fail.
#[derive(Debug)]
pub(crate) struct TestLake {
    inner: LakeWriter,
    written: Mutex<Vec<ChangeEvent>>,
    failing_source: Mutex<Option<Source>>,
    fail_next: AtomicUsize,
}

impl TestLake {
    fn new(inner: LakeWriter) -> Self {
        Self {
            inner,
            written: Default::default(),
            failing_source: Default::default(),
            fail_next: AtomicUsize::new(0),
        }
    }

    /// Events handed to the lake, including duplicates, in call order.
    pub(crate) fn written(&self) -> Vec<ChangeEvent> {
        self.written.lock().clone()
    }

    /// Fail every write of events from `source`.
    pub(crate) fn fail_source(&self, source: Option<Source>) {
        *self.failing_source.lock() = source;
    }

    /// Fail the next `n` writes.
    pub(crate) fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl LakeSink for TestLake {
    async fn write(&self, event: &ChangeEvent) -> Result<WriteOutcome, WriteError> {
        let fail_source = *self.failing_source.lock() == Some(event.source);
        let fail_next = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail_source || fail_next {
            return Err(WriteError::Store {
                key: event.entity.clone(),
                source: injected_store_error("lake write"),
            });
        }

        let outcome = self.inner.write(event).await?;
        self.written.lock().push(event.clone());
        Ok(outcome)
    }
}

/// Checkpoint store whose next commits can be made to fail.
#[derive(Debug)]
pub(crate) struct TestCheckpoints {
    inner: ObjectStoreCheckpointStore,
    fail_commits: AtomicUsize,
}

impl TestCheckpoints {
    fn new(inner: ObjectStoreCheckpointStore) -> Self {
        Self {
            inner,
            fail_commits: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_commits(&self, n: usize) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for TestCheckpoints {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<ConsumerCheckpoint>, CheckpointError> {
        self.inner.load(key).await
    }

    async fn commit(
        &self,
        key: &CheckpointKey,
        position: Position,
    ) -> Result<ConsumerCheckpoint, CheckpointError> {
        let fail = self
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(CheckpointError::Store {
                path: key.to_string(),
                source: injected_store_error("checkpoint commit"),
            });
        }
        self.inner.commit(key, position).await
    }

    async fn list(&self, consumer_group: &str) -> Result<Vec<ConsumerCheckpoint>, CheckpointError> {
        self.inner.list(consumer_group).await
    }
}

/// Capture bootstrap that always reports a source that cannot be captured.
#[derive(Debug)]
pub(crate) struct UnavailableCapture {
    pub(crate) source: Source,
}

#[async_trait]
impl CaptureExtractor for UnavailableCapture {
    fn source(&self) -> Source {
        self.source
    }

    async fn enable_capture(&self, _entities: &[String]) -> Result<CaptureHandle, ExtractorError> {
        Err(ExtractorError::CapabilityUnavailable(
            "wal_level is 'replica', logical replication requires 'logical'".to_string(),
        ))
    }
}

pub(crate) fn partition_attrs(
    source: Source,
    partition: u32,
    extra: Option<(&'static str, &'static str)>,
) -> Attributes {
    let mut attrs = Attributes::from([
        ("source", source.as_str().into()),
        ("partition", partition.to_string().into()),
    ]);
    if let Some((k, v)) = extra {
        attrs.insert(k, v);
    }
    attrs
}

pub(crate) fn counter(metrics: &metric::Registry, name: &'static str, attrs: &Attributes) -> u64 {
    metrics
        .get_instrument::<Metric<U64Counter>>(name)
        .expect("did not find counter")
        .get_observer(attrs)
        .expect("did not match metric attributes")
        .fetch()
}

pub(crate) fn gauge(metrics: &metric::Registry, name: &'static str, attrs: &Attributes) -> u64 {
    metrics
        .get_instrument::<Metric<U64Gauge>>(name)
        .expect("did not find gauge")
        .get_observer(attrs)
        .expect("did not match metric attributes")
        .fetch()
}
