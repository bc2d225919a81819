//! Entrypoint of the pipeline: capture relays, per-source consumers and the metrics endpoint.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use bronze_backoff::{Backoff, BackoffConfig};
use bronze_channel::ChannelWriting;
use bronze_checkpoint::CursorStore;
use bronze_clap_blocks::{
    capture::{CaptureConfig, StateConfig},
    channel::{ChannelConfig, ChannelConfigError},
    object_store::{ObjectStoreConfig, ParseError},
    retry::RetryConfig,
    socket_addr::SocketAddr,
};
use bronze_extract::{CaptureRelay, ChangePublisher};
use bronze_ingest::{
    CaptureBootstrap, ConsumerConfig, ConsumerDeps, ConsumerState, SourcePipeline, StopReason,
    Supervisor, SupervisorHandle,
};
use bronze_shutdown::{ShutdownManager, ShutdownToken, wait_for_signal};
use bronze_types::Source;
use futures::future::join_all;
use hyper::server::conn::AddrIncoming;
use observability_deps::tracing::*;
use panic_logging::SendPanicsToTracing;
use tokio_util::sync::CancellationToken;
use trogging::cli::LoggingConfig;

use super::common::{ConnectError, ConnectedSource, Stores, connect_source};
use crate::http::{self, ServerState};

/// The default bind address of the metrics and health endpoint.
pub(crate) const DEFAULT_METRICS_BIND_ADDR: &str = "0.0.0.0:9187";

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("Cannot parse object store config: {0}")]
    ObjectStoreParsing(#[from] ParseError),

    #[error("Cannot open channel: {0}")]
    Channel(#[from] ChannelConfigError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Failed to bind metrics address: {0}")]
    BindAddress(#[source] hyper::Error),

    #[error("Metrics server error: {0}")]
    Server(#[source] hyper::Error),

    #[error("every consumer stopped with an unrecoverable error, see the logs")]
    AllConsumersFailed,
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    #[clap(flatten)]
    object_store_config: ObjectStoreConfig,

    #[clap(flatten)]
    channel_config: ChannelConfig,

    #[clap(flatten)]
    capture_config: CaptureConfig,

    #[clap(flatten)]
    state_config: StateConfig,

    #[clap(flatten)]
    retry_config: RetryConfig,

    /// Comma separated sources to consume.
    #[clap(
        long = "sources",
        env = "BRONZE_SOURCES",
        value_delimiter = ',',
        default_value = "relational,document",
        action
    )]
    sources: Vec<Source>,

    /// Enable change capture on every connected source before its consumer starts reading.
    #[clap(long = "bootstrap-capture", env = "BRONZE_BOOTSTRAP_CAPTURE", action)]
    bootstrap_capture: bool,

    /// Relay the changes of every connected source into its channel from this process.
    #[clap(long = "relay", env = "BRONZE_RELAY", action)]
    relay: bool,

    /// Address of the metrics and health endpoint.
    #[clap(
        long = "metrics-bind",
        env = "BRONZE_METRICS_BIND",
        default_value = DEFAULT_METRICS_BIND_ADDR,
        action
    )]
    metrics_bind_address: SocketAddr,
}

/// How a relay moves changes of one source into its channel.
#[derive(Debug)]
struct RelaySettings {
    channel: String,
    entities: Vec<String>,
    publisher: Arc<ChangePublisher>,
    cursors: Arc<dyn CursorStore>,
    batch_size: usize,
    idle_interval: Duration,
    backoff: BackoffConfig,
    restart_backoff: BackoffConfig,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let metrics = Arc::new(metric::Registry::default());

    // Leaked so the handler is never removed while a panic unwinds.
    let f = SendPanicsToTracing::new_with_metrics(&metrics);
    std::mem::forget(f);

    let backoff = config.retry_config.backoff();
    let restart_backoff = config.retry_config.restart_backoff();
    let object_store = config.object_store_config.make_object_store()?;
    info!(
        object_store = config.object_store_config.object_store.as_str(),
        "lake object store configured"
    );
    let stores = Stores::new(object_store, &config.state_config, backoff);

    let serving_shutdown = CancellationToken::new();
    let shutdown_manager = ShutdownManager::new(serving_shutdown.clone());

    let sources: BTreeSet<Source> = config.sources.iter().copied().collect();
    let connect = config.bootstrap_capture || config.relay;

    let mut pipelines = Vec::with_capacity(sources.len());
    let mut writers: Vec<(String, Arc<dyn ChannelWriting>)> = Vec::with_capacity(sources.len());
    let mut relays = vec![];
    for source in sources.iter().copied() {
        let channel = config
            .channel_config
            .make_channel(source, &config.state_config.consumer_group)
            .await?;
        writers.push((channel.name.clone(), Arc::clone(&channel.writer)));

        let mut connected = None;
        if connect {
            connected = connect_source(source, &config.capture_config, backoff).await?;
            if connected.is_none() {
                warn!(%source, "source database not configured, only consuming its channel");
            }
        }

        let entities = config.capture_config.entities(source).to_vec();
        let bootstrap = connected
            .as_ref()
            .filter(|_| config.bootstrap_capture)
            .map(|c| CaptureBootstrap {
                extractor: Arc::clone(&c.extractor),
                entities: entities.clone(),
            });

        pipelines.push(SourcePipeline {
            source,
            channel: channel.reader,
            bootstrap,
        });

        if let Some(connected) = connected.filter(|_| config.relay) {
            relays.push((connected, channel.name, entities));
        }
    }

    let publisher = Arc::new(ChangePublisher::new(writers, backoff, &metrics));
    for (connected, channel, entities) in relays {
        let token = shutdown_manager.register(format!("{}_relay", connected.source));
        let settings = RelaySettings {
            channel,
            entities,
            publisher: Arc::clone(&publisher),
            cursors: Arc::clone(&stores.cursors),
            batch_size: config.capture_config.relay_batch_size,
            idle_interval: config.capture_config.relay_idle_interval,
            backoff,
            restart_backoff,
        };
        tokio::spawn(run_relay(connected, settings, token));
    }

    let deps = ConsumerDeps {
        lake: Arc::clone(&stores.lake),
        dead_letters: Arc::clone(&stores.dead_letters),
        checkpoints: Arc::clone(&stores.checkpoints),
        time_provider: Arc::clone(&stores.time_provider),
        metrics: Arc::clone(&metrics),
    };
    let consumer_config = ConsumerConfig {
        consumer_group: config.state_config.consumer_group.clone(),
        receive_timeout: config.retry_config.receive_timeout,
        read_backoff: backoff,
    };
    let supervisor =
        Supervisor::new(pipelines, deps, consumer_config, restart_backoff).start(&shutdown_manager);

    let consumers: BTreeMap<_, _> = sources
        .iter()
        .filter_map(|&source| supervisor.subscribe(source).map(|rx| (source, rx)))
        .collect();

    let addr = AddrIncoming::bind(&config.metrics_bind_address).map_err(Error::BindAddress)?;
    info!(address = %addr.local_addr(), "metrics endpoint listening");
    let server = http::serve(
        addr,
        ServerState::new(Arc::clone(&metrics), consumers),
        serving_shutdown.clone(),
    );
    tokio::pin!(server);

    let mut all_failed = false;
    let mut server_res = None;
    tokio::select! {
        res = wait_for_signal() => {
            if let Err(e) = res {
                error!(error = %e, "failed to listen for shutdown signals");
            }
            info!("shutdown requested");
        }
        _ = all_fatal(&supervisor, &sources) => {
            error!("every consumer stopped with an unrecoverable error, shutting down");
            all_failed = true;
        }
        res = &mut server => {
            error!("metrics endpoint stopped unexpectedly, shutting down");
            server_res = Some(res);
        }
    }

    shutdown_manager.shutdown();
    shutdown_manager.join().await;
    supervisor.join().await;

    let server_res = match server_res {
        Some(res) => res,
        None => server.await,
    };
    server_res.map_err(Error::Server)?;
    info!("pipeline stopped");

    if all_failed {
        return Err(Error::AllConsumersFailed);
    }
    Ok(())
}

/// Resolves once the consumer of every source stopped for good.
async fn all_fatal(supervisor: &SupervisorHandle, sources: &BTreeSet<Source>) {
    if sources.is_empty() {
        return std::future::pending().await;
    }

    join_all(sources.iter().map(|&source| {
        supervisor.wait_for_state(source, |s| *s == ConsumerState::Stopped(StopReason::Fatal))
    }))
    .await;
}

/// Enable capture on a connected source, then relay its changes until shutdown.
///
/// A failed relay is restarted after a cooldown. Capture errors that a restart cannot resolve
/// leave the source without a relay.
async fn run_relay(connected: ConnectedSource, settings: RelaySettings, token: ShutdownToken) {
    let source = connected.source;
    let mut cooldown = Backoff::new(&settings.restart_backoff);

    let handle = loop {
        let res = tokio::select! {
            _ = token.wait_for_shutdown() => {
                token.complete();
                return;
            }
            res = connected.extractor.enable_capture(&settings.entities) => res,
        };

        match res {
            Ok(handle) => break handle,
            Err(e) if e.is_fatal() => {
                error!(%source, error = %e, "cannot enable capture, relay not started");
                token.complete();
                return;
            }
            Err(e) => {
                let delay = cooldown.next_delay();
                warn!(%source, error = %e, cooldown_ms = delay.as_millis() as u64, "enabling capture failed");
                tokio::select! {
                    _ = token.wait_for_shutdown() => {
                        token.complete();
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    };
    info!(%source, resource = %handle.resource, entities = ?handle.entities, "capture enabled");

    let relay = CaptureRelay::new(
        connected.into_feed(&handle, settings.cursors),
        settings.publisher,
        settings.channel,
        settings.batch_size,
        settings.idle_interval,
        settings.backoff,
    );

    cooldown.reset();
    loop {
        match relay.run(token.clone()).await {
            Ok(()) => break,
            Err(e) => {
                let delay = cooldown.next_delay();
                warn!(%source, error = %e, cooldown_ms = delay.as_millis() as u64, "restarting capture relay");
                tokio::select! {
                    _ = token.wait_for_shutdown() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    token.complete();
}
