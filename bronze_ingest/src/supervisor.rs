//! Runs one consumer task per source and restarts tasks that fail.

use std::{collections::BTreeMap, sync::Arc};

use bronze_backoff::{Backoff, BackoffConfig};
use bronze_shutdown::{ShutdownManager, ShutdownToken};
use bronze_types::Source;
use observability_deps::tracing::{error, info, warn};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    consumer::{ConsumerConfig, ConsumerDeps, ConsumerTask, SourcePipeline},
    metrics::SupervisorMetrics,
    state::{ConsumerState, StopReason},
};

/// Owns the consumer tasks of both sources.
///
/// Each source gets its own task, checkpoints and restart cooldown, so a failing source never
/// stalls the other one.
#[derive(Debug)]
pub struct Supervisor {
    pipelines: Vec<SourcePipeline>,
    deps: ConsumerDeps,
    config: Arc<ConsumerConfig>,
    restart_backoff: BackoffConfig,
}

impl Supervisor {
    pub fn new(
        pipelines: Vec<SourcePipeline>,
        deps: ConsumerDeps,
        config: ConsumerConfig,
        restart_backoff: BackoffConfig,
    ) -> Self {
        Self {
            pipelines,
            deps,
            config: Arc::new(config),
            restart_backoff,
        }
    }

    /// Spawn the consumer tasks. Each registers with `shutdown` and reports completion once its
    /// in-flight event is drained.
    pub fn start(self, shutdown: &ShutdownManager) -> SupervisorHandle {
        let mut states = BTreeMap::new();
        let mut tasks = Vec::with_capacity(self.pipelines.len());

        for pipeline in self.pipelines {
            let source = pipeline.source;
            let (state_tx, state_rx) = watch::channel(ConsumerState::Starting);
            states.insert(source, state_rx);

            let token = shutdown.register(format!("{source}_consumer"));
            let metrics = SupervisorMetrics::new(&self.deps.metrics, source);
            let supervised = Supervised {
                pipeline,
                deps: self.deps.clone(),
                config: Arc::clone(&self.config),
                restart_backoff: self.restart_backoff,
                metrics,
                state: state_tx,
                token,
            };

            tasks.push(tokio::spawn(supervised.run()));
        }

        SupervisorHandle { states, tasks }
    }
}

#[derive(Debug)]
struct Supervised {
    pipeline: SourcePipeline,
    deps: ConsumerDeps,
    config: Arc<ConsumerConfig>,
    restart_backoff: BackoffConfig,
    metrics: SupervisorMetrics,
    state: watch::Sender<ConsumerState>,
    token: ShutdownToken,
}

impl Supervised {
    async fn run(self) {
        let source = self.pipeline.source;
        let mut cooldown = Backoff::new(&self.restart_backoff);

        let reason = loop {
            let mut task = ConsumerTask::new(
                self.pipeline.clone(),
                self.deps.clone(),
                Arc::clone(&self.config),
                self.state.clone(),
                self.token.clone(),
            );

            let e = match task.run().await {
                Ok(()) => break StopReason::Shutdown,
                Err(e) => e,
            };

            if e.is_fatal() {
                self.metrics.fatal.inc(1);
                error!(
                    %source,
                    error = %e,
                    "consumer cannot capture this source, not restarting"
                );
                break StopReason::Fatal;
            }

            // a task that made progress starts the next one from a fresh cooldown
            if task.committed_events() > 0 {
                cooldown.reset();
            }
            let delay = cooldown.next_delay();
            self.state.send_replace(ConsumerState::Stopped(StopReason::Failed));
            warn!(
                %source,
                error = %e,
                committed_events = task.committed_events(),
                restart_in_ms = delay.as_millis() as u64,
                "consumer task failed, restarting"
            );

            tokio::select! {
                _ = self.token.wait_for_shutdown() => break StopReason::Shutdown,
                _ = tokio::time::sleep(delay) => {}
            }
            self.metrics.restarts.inc(1);
        };

        self.state.send_replace(ConsumerState::Stopped(reason));
        info!(%source, state = %ConsumerState::Stopped(reason), "consumer stopped");
        self.token.complete();
    }
}

/// Observes and awaits the tasks started by [`Supervisor::start`].
#[derive(Debug)]
pub struct SupervisorHandle {
    states: BTreeMap<Source, watch::Receiver<ConsumerState>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SupervisorHandle {
    /// Current state of the consumer of `source`, `None` if that source is not consumed.
    pub fn state(&self, source: Source) -> Option<ConsumerState> {
        self.states.get(&source).map(|rx| *rx.borrow())
    }

    pub fn subscribe(&self, source: Source) -> Option<watch::Receiver<ConsumerState>> {
        self.states.get(&source).cloned()
    }

    /// Wait until the consumer of `source` is in a state matching `f`.
    pub async fn wait_for_state<F>(&self, source: Source, f: F) -> Option<ConsumerState>
    where
        F: Fn(&ConsumerState) -> bool + Send,
    {
        let mut rx = self.subscribe(source)?;
        let state = rx.wait_for(|s| f(s)).await.ok()?;
        Some(*state)
    }

    /// Wait for every consumer task to stop.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "consumer supervisor task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use test_helpers::timeout::FutureTimeout;

    use super::*;
    use crate::{CaptureBootstrap, test_util::*};

    fn pipeline(ctx: &TestContext, source: Source) -> SourcePipeline {
        SourcePipeline {
            source,
            channel: Arc::new(ctx.channel(source).clone()),
            bootstrap: None,
        }
    }

    fn supervisor(ctx: &TestContext, pipelines: Vec<SourcePipeline>) -> Supervisor {
        Supervisor::new(pipelines, ctx.deps(), consumer_config(), fast_backoff(u32::MAX))
    }

    fn source_attrs(source: Source) -> metric::Attributes {
        metric::Attributes::from(&[("source", source.as_str())])
    }

    #[test_log::test(tokio::test)]
    async fn failing_source_does_not_stall_the_other() {
        let ctx = TestContext::new(1);
        ctx.lake.fail_source(Some(Source::Relational));
        ctx.append(Source::Relational, 0, relational_insert(0x10, "orders", 1))
            .await;
        for (token, id) in [("82A1", 1), ("82A2", 2), ("82A3", 3)] {
            ctx.append(Source::Document, 0, document_insert(token, "waste_reports", id))
                .await;
        }

        let shutdown = ShutdownManager::new_testing();
        let handle = supervisor(
            &ctx,
            vec![
                pipeline(&ctx, Source::Relational),
                pipeline(&ctx, Source::Document),
            ],
        )
        .start(&shutdown);

        ctx.wait_for_checkpoint(Source::Document, 0, 2)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        assert_eq!(ctx.objects("document").await.len(), 3);

        // the relational consumer keeps failing and being restarted meanwhile
        async {
            loop {
                let restarts = counter(
                    &ctx.metrics,
                    "bronze_consumer_restarts",
                    &source_attrs(Source::Relational),
                );
                if restarts >= 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        .with_timeout_panic(Duration::from_secs(5))
        .await;
        assert!(ctx.checkpoint(Source::Relational, 0).await.is_none());
        assert!(ctx.objects("relational").await.is_empty());

        // once the lake recovers the relational event lands too
        ctx.lake.fail_source(None);
        ctx.wait_for_checkpoint(Source::Relational, 0, 0)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        assert_eq!(ctx.objects("relational").await.len(), 1);

        shutdown.shutdown();
        shutdown.join().with_timeout_panic(Duration::from_secs(5)).await;
        handle.join().with_timeout_panic(Duration::from_secs(5)).await;
    }

    #[test_log::test(tokio::test)]
    async fn graceful_shutdown_stops_every_consumer() {
        let ctx = TestContext::new(2);
        ctx.append(Source::Relational, 1, relational_insert(0x10, "orders", 1))
            .await;

        let shutdown = ShutdownManager::new_testing();
        let handle = supervisor(
            &ctx,
            vec![
                pipeline(&ctx, Source::Relational),
                pipeline(&ctx, Source::Document),
            ],
        )
        .start(&shutdown);

        ctx.wait_for_checkpoint(Source::Relational, 1, 0)
            .with_timeout_panic(Duration::from_secs(5))
            .await;

        shutdown.shutdown();
        shutdown.join().with_timeout_panic(Duration::from_secs(5)).await;

        for source in Source::ALL {
            assert_eq!(
                handle.state(source),
                Some(ConsumerState::Stopped(StopReason::Shutdown))
            );
        }
        handle.join().with_timeout_panic(Duration::from_secs(5)).await;
    }

    #[test_log::test(tokio::test)]
    async fn capability_errors_stop_only_that_source() {
        let ctx = TestContext::new(1);
        let mut relational = pipeline(&ctx, Source::Relational);
        relational.bootstrap = Some(CaptureBootstrap {
            extractor: Arc::new(UnavailableCapture {
                source: Source::Relational,
            }),
            entities: vec!["orders".to_string()],
        });
        ctx.append(Source::Document, 0, document_insert("82B1", "waste_reports", 1))
            .await;

        let shutdown = ShutdownManager::new_testing();
        let handle = supervisor(&ctx, vec![relational, pipeline(&ctx, Source::Document)])
            .start(&shutdown);

        let state = handle
            .wait_for_state(Source::Relational, ConsumerState::is_stopped)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        assert_eq!(state, Some(ConsumerState::Stopped(StopReason::Fatal)));

        ctx.wait_for_checkpoint(Source::Document, 0, 0)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        let state = handle
            .wait_for_state(Source::Document, |s| *s == ConsumerState::Streaming)
            .with_timeout_panic(Duration::from_secs(5))
            .await;
        assert_eq!(state, Some(ConsumerState::Streaming));

        let attrs = source_attrs(Source::Relational);
        assert_eq!(counter(&ctx.metrics, "bronze_consumer_fatal", &attrs), 1);
        assert_eq!(counter(&ctx.metrics, "bronze_consumer_restarts", &attrs), 0);

        shutdown.shutdown();
        shutdown.join().with_timeout_panic(Duration::from_secs(5)).await;
        handle.join().with_timeout_panic(Duration::from_secs(5)).await;
    }
}
