//! The per-source consumer task.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use bronze_backoff::{Backoff, BackoffConfig, Retryable};
use bronze_channel::{ChannelError, ChannelReading, ChannelRecord, RecordStream};
use bronze_checkpoint::{CheckpointError, CheckpointKey, CheckpointStore};
use bronze_extract::{CaptureExtractor, ExtractorError};
use bronze_lake::{DeadLetterError, DeadLetterRecord, DeadLetterSink, LakeSink, WriteError};
use bronze_normalize::normalize;
use bronze_shutdown::ShutdownToken;
use bronze_types::{PartitionId, Position, Source};
use futures::{StreamExt, stream::SelectAll};
use iox_time::{Time, TimeProvider};
use observability_deps::tracing::{debug, error, info, warn};
use tokio::sync::watch;

use crate::{
    metrics::ConsumerMetrics,
    state::{ConsumerState, StopReason},
};

/// Minimum time between two checkpoint-lag refreshes while events keep arriving.
const LAG_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("enabling change capture failed: {0}")]
    Capture(#[source] ExtractorError),

    #[error("channel read failed: {0}")]
    Channel(#[source] ChannelError),

    #[error("channel read failed {attempts} times in a row: {source}")]
    ReadExhausted { attempts: u32, source: ChannelError },

    #[error("lake write of partition {partition} offset {position} failed: {source}")]
    Write {
        partition: PartitionId,
        position: Position,
        source: WriteError,
    },

    #[error("dead-lettering partition {partition} offset {position} failed: {source}")]
    DeadLetter {
        partition: PartitionId,
        position: Position,
        source: DeadLetterError,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl ConsumerError {
    /// Errors a restarted task would run into again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Capture(e) if e.is_fatal())
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub consumer_group: String,
    /// How long a receive waits before refreshing the lag gauge. Not an error.
    pub receive_timeout: Duration,
    /// Retry policy of channel reads. The task stops after `max_attempts` consecutive failures.
    /// Opening a stream and reading a high watermark are each bounded by its `attempt_timeout`.
    pub read_backoff: BackoffConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_group: "$Default".to_string(),
            receive_timeout: Duration::from_secs(1),
            read_backoff: BackoffConfig::default(),
        }
    }
}

/// Capture setup run when a consumer task starts.
#[derive(Debug, Clone)]
pub struct CaptureBootstrap {
    pub extractor: Arc<dyn CaptureExtractor>,
    pub entities: Vec<String>,
}

/// One source and the channel carrying its raw events.
#[derive(Debug, Clone)]
pub struct SourcePipeline {
    pub source: Source,
    pub channel: Arc<dyn ChannelReading>,
    pub bootstrap: Option<CaptureBootstrap>,
}

/// Collaborators shared by the consumers of both sources.
///
/// Keys written by different sources never collide: lake keys and checkpoint keys both start
/// with the source name.
#[derive(Debug, Clone)]
pub struct ConsumerDeps {
    pub lake: Arc<dyn LakeSink>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub time_provider: Arc<dyn TimeProvider>,
    pub metrics: Arc<metric::Registry>,
}

#[derive(Debug)]
struct ReadRetry {
    backoff: Backoff,
    failures: u32,
}

impl ReadRetry {
    fn reset(&mut self) {
        if self.failures > 0 {
            self.failures = 0;
            self.backoff.reset();
        }
    }
}

/// Consumes one source channel into the lake.
///
/// Events are handled one at a time: normalize, write to the lake (or the dead-letter store),
/// commit the checkpoint. A checkpoint therefore never covers an event whose write is not
/// durable, and a task that dies between write and commit reprocesses the event after restart,
/// which the create-if-absent lake write turns into a no-op.
#[derive(Debug)]
pub struct ConsumerTask {
    pipeline: SourcePipeline,
    deps: ConsumerDeps,
    config: Arc<ConsumerConfig>,
    metrics: ConsumerMetrics,
    state: watch::Sender<ConsumerState>,
    shutdown: ShutdownToken,

    /// Last committed position per partition, `None` before the first commit.
    committed: BTreeMap<PartitionId, Option<Position>>,
    committed_events: u64,
    last_lag_refresh: Option<Time>,
}

impl ConsumerTask {
    pub fn new(
        pipeline: SourcePipeline,
        deps: ConsumerDeps,
        config: Arc<ConsumerConfig>,
        state: watch::Sender<ConsumerState>,
        shutdown: ShutdownToken,
    ) -> Self {
        let metrics = ConsumerMetrics::new(&deps.metrics, pipeline.source);
        Self {
            pipeline,
            deps,
            config,
            metrics,
            state,
            shutdown,
            committed: Default::default(),
            committed_events: 0,
            last_lag_refresh: None,
        }
    }

    pub fn source(&self) -> Source {
        self.pipeline.source
    }

    /// Number of events this task instance handled and committed.
    pub fn committed_events(&self) -> u64 {
        self.committed_events
    }

    /// Consume until shutdown (`Ok`) or until an error the task cannot absorb.
    pub async fn run(&mut self) -> Result<(), ConsumerError> {
        let source = self.source();
        self.set_state(ConsumerState::Starting);

        if let Some(bootstrap) = &self.pipeline.bootstrap {
            let handle = bootstrap
                .extractor
                .enable_capture(&bootstrap.entities)
                .await
                .map_err(ConsumerError::Capture)?;
            info!(
                %source,
                resource = %handle.resource,
                entities = ?handle.entities,
                changed = handle.changed,
                "change capture enabled"
            );
        }

        let mut retry = ReadRetry {
            backoff: Backoff::new(&self.config.read_backoff),
            failures: 0,
        };
        let max_attempts = self.config.read_backoff.max_attempts.max(1);

        loop {
            let e = match self.consume(&mut retry).await {
                Ok(()) => {
                    info!(%source, "consumer drained and stopped");
                    self.set_state(ConsumerState::Stopped(StopReason::Shutdown));
                    return Ok(());
                }
                Err(ConsumerError::Channel(e)) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            retry.failures += 1;
            if retry.failures >= max_attempts {
                return Err(ConsumerError::ReadExhausted {
                    attempts: retry.failures,
                    source: e,
                });
            }

            let delay = retry.backoff.next_delay();
            self.set_state(ConsumerState::Backoff);
            warn!(
                %source,
                error = %e,
                attempt = retry.failures,
                max_attempts,
                backoff_ms = delay.as_millis() as u64,
                "channel read failed, re-opening streams after backoff"
            );

            tokio::select! {
                _ = self.shutdown.wait_for_shutdown() => {
                    self.set_state(ConsumerState::Stopped(StopReason::Shutdown));
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn consume(&mut self, retry: &mut ReadRetry) -> Result<(), ConsumerError> {
        self.set_state(ConsumerState::LoadingCheckpoint);
        let mut streams = self.open_streams().await?;
        self.set_state(ConsumerState::Streaming);
        self.refresh_lag().await;

        loop {
            if self.shutdown.is_shutdown() {
                return Ok(());
            }

            let next = tokio::select! {
                biased;
                _ = self.shutdown.wait_for_shutdown() => return Ok(()),
                next = tokio::time::timeout(self.config.receive_timeout, streams.next()) => next,
            };

            match next {
                // idle, nothing to consume
                Err(_) => self.refresh_lag().await,
                Ok(Some(Ok(record))) => {
                    retry.reset();
                    self.set_state(ConsumerState::Processing);
                    self.process(record).await?;
                    self.set_state(ConsumerState::Streaming);
                }
                Ok(Some(Err(e))) => return Err(ConsumerError::Channel(e)),
                Ok(None) => {
                    return Err(ConsumerError::Channel(ChannelError::io(
                        "channel streams ended unexpectedly",
                    )));
                }
            }
        }
    }

    /// Open one stream per partition, each resuming after its committed checkpoint.
    async fn open_streams(&mut self) -> Result<SelectAll<RecordStream>, ConsumerError> {
        let source = self.source();
        let mut streams = vec![];

        for partition in self.pipeline.channel.partitions() {
            let key = CheckpointKey::new(self.config.consumer_group.clone(), source, partition);
            let checkpoint = self.deps.checkpoints.load(&key).await?;
            let from = checkpoint
                .as_ref()
                .map(|c| c.resume_from())
                .unwrap_or(Position::ZERO);
            self.committed
                .insert(partition, checkpoint.map(|c| c.position));

            debug!(%source, %partition, %from, "opening channel stream");
            let call_timeout = self.config.read_backoff.attempt_timeout;
            let open = self.pipeline.channel.stream(partition, from);
            let stream = tokio::time::timeout(call_timeout, open)
                .await
                .map_err(|_| {
                    ChannelError::io(format!(
                        "opening partition {partition} timed out after {call_timeout:?}"
                    ))
                })
                .and_then(|res| res)
                .map_err(ConsumerError::Channel)?;
            streams.push(stream);
        }

        info!(%source, n_partitions = streams.len(), "streaming channel");
        Ok(futures::stream::select_all(streams))
    }

    async fn process(&mut self, record: ChannelRecord) -> Result<(), ConsumerError> {
        let ChannelRecord {
            partition,
            position,
            payload,
        } = record;
        let source = self.source();
        let metrics = self.metrics.partition(partition);
        metrics.received.inc(1);

        match normalize(source, &payload) {
            Ok(event) => {
                let outcome = match self.deps.lake.write(&event).await {
                    Ok(v) => v,
                    Err(e) => {
                        metrics.write_failed.inc(1);
                        error!(
                            %source,
                            %partition,
                            offset = %position,
                            entity = %event.entity,
                            error = %e,
                            "lake write failed, checkpoint not advanced"
                        );
                        return Err(ConsumerError::Write {
                            partition,
                            position,
                            source: e,
                        });
                    }
                };

                if outcome.created {
                    metrics.created.inc(1);
                } else {
                    metrics.duplicate.inc(1);
                    debug!(%source, %partition, offset = %position, key = %outcome.key, "duplicate delivery");
                }

                let now = self.deps.time_provider.now().date_time();
                if let Ok(d) = (now - event.source_timestamp).to_std() {
                    metrics.record_time_to_lake(d);
                }
            }
            Err(e) => {
                metrics.normalize_failed(e.reason()).inc(1);
                warn!(
                    %source,
                    %partition,
                    offset = %position,
                    reason = e.reason(),
                    error = %e,
                    "event could not be normalized, dead-lettering"
                );

                let dead_letter = DeadLetterRecord::new(
                    source,
                    partition,
                    position,
                    &payload,
                    e.reason(),
                    e.to_string(),
                    self.deps.time_provider.now().date_time(),
                );
                self.deps
                    .dead_letters
                    .record(&dead_letter)
                    .await
                    .map_err(|e| ConsumerError::DeadLetter {
                        partition,
                        position,
                        source: e,
                    })?;
                metrics.dead_lettered.inc(1);
            }
        }

        let key = CheckpointKey::new(self.config.consumer_group.clone(), source, partition);
        self.deps.checkpoints.commit(&key, position).await?;
        self.committed.insert(partition, Some(position));
        self.committed_events += 1;

        let now = self.deps.time_provider.now();
        let due = self
            .last_lag_refresh
            .and_then(|last| now.checked_duration_since(last))
            .is_none_or(|elapsed| elapsed >= LAG_REFRESH_INTERVAL);
        if due {
            self.refresh_lag().await;
        }

        Ok(())
    }

    /// Recompute the checkpoint lag of every partition from the channel's high watermarks.
    async fn refresh_lag(&mut self) {
        let source = self.source();
        let call_timeout = self.config.read_backoff.attempt_timeout;
        for partition in self.pipeline.channel.partitions() {
            let lookup = self.pipeline.channel.high_watermark(partition);
            match tokio::time::timeout(call_timeout, lookup).await {
                Err(_) => {
                    debug!(%source, %partition, ?call_timeout, "high watermark lookup timed out");
                }
                Ok(Ok(high_watermark)) => {
                    let next = self
                        .committed
                        .get(&partition)
                        .copied()
                        .flatten()
                        .map(|p| p.next())
                        .unwrap_or(Position::ZERO);
                    let lag = high_watermark.get().saturating_sub(next.get());
                    self.metrics.partition(partition).checkpoint_lag.set(lag);
                }
                Ok(Err(e)) => {
                    debug!(%source, %partition, error = %e, "failed to read high watermark");
                }
            }
        }
        self.last_lag_refresh = Some(self.deps.time_provider.now());
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(source = %self.source(), from = %previous, to = %state, "consumer state");
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bronze_channel::{ChannelErrorKind, memory::MemoryChannel};
    use pretty_assertions::assert_eq;
    use test_helpers::timeout::FutureTimeout;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::test_util::*;

    #[derive(Debug)]
    struct Running {
        handle: JoinHandle<(ConsumerTask, Result<(), ConsumerError>)>,
        token: ShutdownToken,
        state: watch::Receiver<ConsumerState>,
    }

    impl Running {
        async fn join(self) -> (ConsumerTask, Result<(), ConsumerError>) {
            self.handle
                .with_timeout_panic(Duration::from_secs(5))
                .await
                .expect("consumer task panicked")
        }

        async fn stop(self) -> (ConsumerTask, Result<(), ConsumerError>) {
            self.token.trigger_shutdown();
            self.join().await
        }
    }

    fn start(ctx: &TestContext, source: Source) -> Running {
        start_with(
            ctx,
            source,
            Arc::new(ctx.channel(source).clone()),
            consumer_config(),
        )
    }

    fn start_with(
        ctx: &TestContext,
        source: Source,
        channel: Arc<dyn ChannelReading>,
        config: ConsumerConfig,
    ) -> Running {
        let token = ShutdownToken::detached(format!("{source}_consumer"));
        let (tx, state) = watch::channel(ConsumerState::Starting);
        let pipeline = SourcePipeline {
            source,
            channel,
            bootstrap: None,
        };
        let mut task = ConsumerTask::new(pipeline, ctx.deps(), Arc::new(config), tx, token.clone());
        let handle = tokio::spawn(async move {
            let res = task.run().await;
            (task, res)
        });
        Running {
            handle,
            token,
            state,
        }
    }

    #[test_log::test(tokio::test)]
    async fn events_land_in_the_lake_and_checkpoint_advances() {
        let ctx = TestContext::new(1);
        for (lsn, id) in [(0x100, 1), (0x200, 2), (0x300, 3)] {
            ctx.append(Source::Relational, 0, relational_insert(lsn, "users", id))
                .await;
        }

        let running = start(&ctx, Source::Relational);
        ctx.wait_for_checkpoint(Source::Relational, 0, 2)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        let mut state = running.state.clone();
        let (task, res) = running.stop().await;
        res.unwrap();

        assert_eq!(task.committed_events(), 3);
        assert_eq!(*state.borrow_and_update(), ConsumerState::Stopped(StopReason::Shutdown));

        let objects = ctx.objects("relational").await;
        assert_eq!(objects.len(), 3);
        for o in &objects {
            assert!(
                o.starts_with("relational/users/year=2024/month=3/day=7/data_"),
                "{o}"
            );
        }

        let checkpoint = ctx.checkpoint(Source::Relational, 0).await.unwrap();
        assert_eq!(checkpoint.position, Position::new(2));
        assert_eq!(checkpoint.consumer_group, GROUP);

        let attrs = partition_attrs(Source::Relational, 0, None);
        assert_eq!(counter(&ctx.metrics, "bronze_events_received", &attrs), 3);
        let created = partition_attrs(Source::Relational, 0, Some(("result", "created")));
        assert_eq!(counter(&ctx.metrics, "bronze_events_written", &created), 3);
    }

    #[test_log::test(tokio::test)]
    async fn redelivered_event_is_written_once() {
        let ctx = TestContext::new(1);
        let raw = document_insert("8265E9A1200000000A2B022C0100296E5A1004", "waste_reports", 7);
        ctx.append(Source::Document, 0, raw.clone()).await;
        ctx.append(Source::Document, 0, raw).await;

        let running = start(&ctx, Source::Document);
        ctx.wait_for_checkpoint(Source::Document, 0, 1)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        running.stop().await.1.unwrap();

        assert_eq!(ctx.objects("document").await.len(), 1);
        assert_eq!(ctx.lake.written().len(), 2);

        let created = partition_attrs(Source::Document, 0, Some(("result", "created")));
        let duplicate = partition_attrs(Source::Document, 0, Some(("result", "duplicate")));
        assert_eq!(counter(&ctx.metrics, "bronze_events_written", &created), 1);
        assert_eq!(counter(&ctx.metrics, "bronze_events_written", &duplicate), 1);
    }

    #[test_log::test(tokio::test)]
    async fn restart_resumes_after_the_checkpoint() {
        let ctx = TestContext::new(1);
        ctx.append(Source::Relational, 0, relational_insert(0x10, "users", 1))
            .await;
        ctx.append(Source::Relational, 0, relational_insert(0x20, "users", 2))
            .await;

        let running = start(&ctx, Source::Relational);
        ctx.wait_for_checkpoint(Source::Relational, 0, 1)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        running.stop().await.1.unwrap();

        ctx.append(Source::Relational, 0, relational_insert(0x30, "users", 3))
            .await;
        let running = start(&ctx, Source::Relational);
        ctx.wait_for_checkpoint(Source::Relational, 0, 2)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        let (task, res) = running.stop().await;
        res.unwrap();

        // only the new event was read by the second task
        assert_eq!(task.committed_events(), 1);
        assert_eq!(ctx.lake.written().len(), 3);
        assert_eq!(ctx.objects("relational").await.len(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn failed_commit_after_write_reprocesses_without_duplicates() {
        let ctx = TestContext::new(1);
        ctx.append(Source::Relational, 0, relational_insert(0x10, "orders", 1))
            .await;

        ctx.checkpoints.fail_commits(1);
        let (task, res) = start(&ctx, Source::Relational).join().await;
        assert_matches!(res, Err(ConsumerError::Checkpoint(_)));
        assert_eq!(task.committed_events(), 0);
        assert!(ctx.checkpoint(Source::Relational, 0).await.is_none());
        assert_eq!(ctx.objects("relational").await.len(), 1);

        let running = start(&ctx, Source::Relational);
        ctx.wait_for_checkpoint(Source::Relational, 0, 0)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        running.stop().await.1.unwrap();

        assert_eq!(ctx.lake.written().len(), 2);
        assert_eq!(ctx.objects("relational").await.len(), 1);
        let duplicate = partition_attrs(Source::Relational, 0, Some(("result", "duplicate")));
        assert_eq!(counter(&ctx.metrics, "bronze_events_written", &duplicate), 1);
    }

    #[test_log::test(tokio::test)]
    async fn unusable_events_are_dead_lettered_and_skipped() {
        let ctx = TestContext::new(1);
        let truncate = serde_json::json!({
            "lsn": "0/30",
            "schema": "public",
            "table": "orders",
            "operation": "TRUNCATE",
            "timestamp": "2024-03-07T10:00:00Z",
        });
        ctx.append(Source::Relational, 0, relational_insert(0x10, "orders", 1))
            .await;
        ctx.append(Source::Relational, 0, bytes::Bytes::from_static(b"{not json"))
            .await;
        ctx.append(Source::Relational, 0, relational_insert(0x20, "orders", 2))
            .await;
        ctx.append(Source::Relational, 0, truncate.to_string().into())
            .await;

        let running = start(&ctx, Source::Relational);
        ctx.wait_for_checkpoint(Source::Relational, 0, 3)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        running.stop().await.1.unwrap();

        assert_eq!(ctx.objects("relational").await.len(), 2);
        assert_eq!(
            ctx.objects(DEAD_LETTER_PREFIX).await,
            vec![
                "_dead_letter/relational/partition=0/offset_00000000000000000001.json".to_string(),
                "_dead_letter/relational/partition=0/offset_00000000000000000003.json".to_string(),
            ]
        );

        let malformed = partition_attrs(Source::Relational, 0, Some(("reason", "malformed")));
        let unsupported = partition_attrs(
            Source::Relational,
            0,
            Some(("reason", "unsupported_operation")),
        );
        let attrs = partition_attrs(Source::Relational, 0, None);
        assert_eq!(counter(&ctx.metrics, "bronze_events_normalize_failed", &malformed), 1);
        assert_eq!(counter(&ctx.metrics, "bronze_events_normalize_failed", &unsupported), 1);
        assert_eq!(counter(&ctx.metrics, "bronze_events_dead_lettered", &attrs), 2);
        assert_eq!(counter(&ctx.metrics, "bronze_events_received", &attrs), 4);
    }

    #[test_log::test(tokio::test)]
    async fn event_without_entity_does_not_block_its_partition() {
        let ctx = TestContext::new(1);
        let no_table = serde_json::json!({
            "lsn": "0/18",
            "schema": "public",
            "operation": "INSERT",
            "timestamp": "2024-03-07T10:00:00Z",
            "data": {"id": 2},
        });
        ctx.append(Source::Relational, 0, relational_insert(0x10, "orders", 1))
            .await;
        ctx.append(Source::Relational, 0, no_table.to_string().into())
            .await;
        ctx.append(Source::Relational, 0, relational_insert(0x20, "orders", 3))
            .await;

        let running = start(&ctx, Source::Relational);
        ctx.wait_for_checkpoint(Source::Relational, 0, 2)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        running.stop().await.1.unwrap();

        let ids: Vec<_> = ctx
            .lake
            .written()
            .into_iter()
            .map(|e| e.payload["id"].clone())
            .collect();
        assert_eq!(ids, vec![serde_json::json!(1), serde_json::json!(3)]);
        assert_eq!(ctx.objects("relational").await.len(), 2);

        let dead_letters = ctx.objects(DEAD_LETTER_PREFIX).await;
        assert_eq!(
            dead_letters,
            vec!["_dead_letter/relational/partition=0/offset_00000000000000000001.json".to_string()]
        );
        let bytes = ctx
            .object_store
            .get(&object_store::path::Path::from(dead_letters[0].as_str()))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let record: DeadLetterRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(record.reason, "malformed");
        assert_eq!(record.offset, Position::new(1));
        assert_eq!(record.raw().unwrap(), no_table.to_string().into_bytes());

        let checkpoint = ctx.checkpoint(Source::Relational, 0).await.unwrap();
        assert_eq!(checkpoint.position, Position::new(2));
    }

    #[test_log::test(tokio::test)]
    async fn rows_sharing_a_wal_record_are_all_written() {
        let ctx = TestContext::new(1);
        // a multi-row insert: both rows were decoded at the LSN of one WAL record
        for (ordinal, id) in [(0, 1), (1, 2)] {
            let row = serde_json::json!({
                "lsn": "0/110",
                "ordinal": ordinal,
                "schema": "public",
                "table": "orders",
                "operation": "INSERT",
                "timestamp": "2024-03-07T10:00:00Z",
                "data": {"id": id},
            });
            ctx.append(Source::Relational, 0, row.to_string().into())
                .await;
        }

        let running = start(&ctx, Source::Relational);
        ctx.wait_for_checkpoint(Source::Relational, 0, 1)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        running.stop().await.1.unwrap();

        assert_eq!(ctx.objects("relational").await.len(), 2);
        let created = partition_attrs(Source::Relational, 0, Some(("result", "created")));
        assert_eq!(counter(&ctx.metrics, "bronze_events_written", &created), 2);
    }

    #[test_log::test(tokio::test)]
    async fn lake_failure_leaves_the_checkpoint_untouched() {
        let ctx = TestContext::new(1);
        ctx.append(Source::Relational, 0, relational_insert(0x10, "orders", 1))
            .await;
        ctx.append(Source::Relational, 0, relational_insert(0x20, "orders", 2))
            .await;

        ctx.lake.fail_next(1);
        let (_, res) = start(&ctx, Source::Relational).join().await;
        assert_matches!(
            res,
            Err(ConsumerError::Write { position, .. }) if position == Position::ZERO
        );
        assert!(ctx.checkpoint(Source::Relational, 0).await.is_none());
        assert!(ctx.objects("relational").await.is_empty());

        let attrs = partition_attrs(Source::Relational, 0, None);
        assert_eq!(counter(&ctx.metrics, "bronze_events_write_failed", &attrs), 1);
        // the lag was measured when the streams opened
        assert_eq!(gauge(&ctx.metrics, "bronze_checkpoint_lag", &attrs), 2);
    }

    #[test_log::test(tokio::test)]
    async fn events_of_one_partition_are_written_in_order() {
        let ctx = TestContext::new(2);
        for i in 0..5_u64 {
            ctx.append(Source::Relational, 0, relational_insert(0x100 + i, "a", i as i64))
                .await;
            ctx.append(Source::Relational, 1, relational_insert(0x200 + i, "b", i as i64))
                .await;
        }

        let running = start(&ctx, Source::Relational);
        ctx.wait_for_checkpoint(Source::Relational, 0, 4)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        ctx.wait_for_checkpoint(Source::Relational, 1, 4)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        running.stop().await.1.unwrap();

        let written = ctx.lake.written();
        assert_eq!(written.len(), 10);
        for entity in ["a", "b"] {
            let sequences: Vec<_> = written
                .iter()
                .filter(|e| e.entity == entity)
                .map(|e| e.source_sequence.clone())
                .collect();
            let mut sorted = sequences.clone();
            sorted.sort();
            assert_eq!(sequences, sorted, "events of {entity} out of order");
        }
    }

    #[test_log::test(tokio::test)]
    async fn transient_read_errors_reopen_the_streams() {
        let ctx = TestContext::new(1);
        ctx.relational
            .inject_read_error(PartitionId::new(0), ChannelError::io("connection reset"))
            .unwrap();
        ctx.append(Source::Relational, 0, relational_insert(0x10, "orders", 1))
            .await;

        let running = start(&ctx, Source::Relational);
        ctx.wait_for_checkpoint(Source::Relational, 0, 0)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        let (task, res) = running.stop().await;
        res.unwrap();
        assert_eq!(task.committed_events(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn persistent_read_errors_exhaust_the_budget() {
        let ctx = TestContext::new(1);
        for _ in 0..3 {
            ctx.relational
                .inject_read_error(PartitionId::new(0), ChannelError::io("broker down"))
                .unwrap();
        }

        let (_, res) = start(&ctx, Source::Relational).join().await;
        assert_matches!(res, Err(ConsumerError::ReadExhausted { attempts: 3, .. }));
    }

    /// Channel whose watermark lookups never answer, and optionally its stream opens too.
    #[derive(Debug)]
    struct UnresponsiveChannel {
        inner: MemoryChannel,
        streams_hang: bool,
    }

    #[async_trait::async_trait]
    impl ChannelReading for UnresponsiveChannel {
        fn partitions(&self) -> Vec<PartitionId> {
            ChannelReading::partitions(&self.inner)
        }

        async fn stream(
            &self,
            partition: PartitionId,
            from: Position,
        ) -> Result<RecordStream, ChannelError> {
            if self.streams_hang {
                futures::future::pending::<()>().await;
            }
            self.inner.stream(partition, from).await
        }

        async fn high_watermark(&self, _partition: PartitionId) -> Result<Position, ChannelError> {
            futures::future::pending().await
        }
    }

    fn short_call_timeout() -> ConsumerConfig {
        let mut config = consumer_config();
        config.read_backoff.attempt_timeout = Duration::from_millis(50);
        config
    }

    #[test_log::test(tokio::test)]
    async fn stream_opens_that_never_answer_fail_the_task() {
        let ctx = TestContext::new(1);
        let channel = UnresponsiveChannel {
            inner: ctx.relational.clone(),
            streams_hang: true,
        };

        let (_, res) = start_with(
            &ctx,
            Source::Relational,
            Arc::new(channel),
            short_call_timeout(),
        )
        .join()
        .await;
        assert_matches!(
            res,
            Err(ConsumerError::ReadExhausted { attempts: 3, source })
                if source.kind() == ChannelErrorKind::Io
        );
    }

    #[test_log::test(tokio::test)]
    async fn watermark_lookups_that_never_answer_do_not_stall_consumption() {
        let ctx = TestContext::new(1);
        ctx.append(Source::Relational, 0, relational_insert(0x10, "orders", 1))
            .await;
        ctx.append(Source::Relational, 0, relational_insert(0x20, "orders", 2))
            .await;
        let channel = UnresponsiveChannel {
            inner: ctx.relational.clone(),
            streams_hang: false,
        };

        let running = start_with(
            &ctx,
            Source::Relational,
            Arc::new(channel),
            short_call_timeout(),
        );
        ctx.wait_for_checkpoint(Source::Relational, 0, 1)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        let (task, res) = running.stop().await;
        res.unwrap();
        assert_eq!(task.committed_events(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn invalid_channel_data_is_not_retried() {
        let ctx = TestContext::new(1);
        ctx.relational.inject_read_error(
            PartitionId::new(0),
            ChannelError::invalid_data("corrupt segment"),
        )
        .unwrap();

        let (_, res) = start(&ctx, Source::Relational).join().await;
        assert_matches!(
            res,
            Err(ConsumerError::Channel(e)) if e.kind() == ChannelErrorKind::InvalidData
        );
    }

    #[test_log::test(tokio::test)]
    async fn idle_consumer_stops_on_shutdown_and_reports_lag() {
        let ctx = TestContext::new(1);
        let running = start(&ctx, Source::Document);

        let mut state = running.state.clone();
        state
            .wait_for(|s| *s == ConsumerState::Streaming)
            .with_timeout_panic(Duration::from_secs(5))
            .await
            .unwrap();

        // receive timeouts are not errors and the task keeps waiting
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*state.borrow(), ConsumerState::Streaming);

        let attrs = partition_attrs(Source::Document, 0, None);
        assert_eq!(gauge(&ctx.metrics, "bronze_checkpoint_lag", &attrs), 0);

        let (task, res) = running.stop().await;
        res.unwrap();
        assert_eq!(task.committed_events(), 0);
        assert!(state.borrow().is_stopped());
    }

    #[test_log::test(tokio::test)]
    async fn fatal_capture_errors_are_reported() {
        let ctx = TestContext::new(1);
        let (tx, _state) = watch::channel(ConsumerState::Starting);
        let pipeline = SourcePipeline {
            source: Source::Relational,
            channel: Arc::new(ctx.relational.clone()),
            bootstrap: Some(CaptureBootstrap {
                extractor: Arc::new(UnavailableCapture {
                    source: Source::Relational,
                }),
                entities: vec!["orders".to_string()],
            }),
        };
        let mut task = ConsumerTask::new(
            pipeline,
            ctx.deps(),
            Arc::new(consumer_config()),
            tx,
            ShutdownToken::detached("relational_consumer"),
        );

        let err = task.run().await.unwrap_err();
        assert_matches!(err, ConsumerError::Capture(ExtractorError::CapabilityUnavailable(_)));
        assert!(err.is_fatal());
    }
}
