//! Moving raw changes from a source-side feed into the source's channel.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bronze_backoff::{Backoff, BackoffConfig, BackoffError};
use bronze_shutdown::ShutdownToken;
use bronze_types::Source;
use bytes::Bytes;
use observability_deps::tracing::{debug, info, warn};

use crate::{BackendError, ChangePublisher, PublishError};

/// One raw change as read from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    /// Table or collection, used as the partitioning key.
    pub entity: String,
    /// The raw envelope handed to the normalizer.
    pub payload: Bytes,
    /// Source-side position to acknowledge once this change is published.
    pub cursor: String,
}

/// A source-side stream of changes with explicit acknowledgement.
///
/// Changes that were polled but not acknowledged are delivered again after a restart.
#[async_trait]
pub trait ChangeFeed: Send + Sync + std::fmt::Debug + 'static {
    fn source(&self) -> Source;

    /// Up to `max_changes` changes after the last acknowledged cursor. May be empty.
    async fn poll(&self, max_changes: usize) -> Result<Vec<RawChange>, BackendError>;

    /// Release every change up to and including `cursor`.
    async fn acknowledge(&self, cursor: &str) -> Result<(), BackendError>;
}

#[async_trait]
impl<T> ChangeFeed for Box<T>
where
    T: ChangeFeed + ?Sized,
{
    fn source(&self) -> Source {
        (**self).source()
    }

    async fn poll(&self, max_changes: usize) -> Result<Vec<RawChange>, BackendError> {
        (**self).poll(max_changes).await
    }

    async fn acknowledge(&self, cursor: &str) -> Result<(), BackendError> {
        (**self).acknowledge(cursor).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("change feed failed: {0}")]
    Feed(BackoffError<BackendError>),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

#[derive(Debug)]
pub struct CaptureRelay<F> {
    feed: F,
    publisher: Arc<ChangePublisher>,
    channel: String,
    batch_size: usize,
    idle_interval: Duration,
    backoff: BackoffConfig,
}

impl<F> CaptureRelay<F>
where
    F: ChangeFeed,
{
    pub fn new(
        feed: F,
        publisher: Arc<ChangePublisher>,
        channel: impl Into<String>,
        batch_size: usize,
        idle_interval: Duration,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            feed,
            publisher,
            channel: channel.into(),
            batch_size: batch_size.max(1),
            idle_interval,
            backoff,
        }
    }

    /// Publish one batch, then acknowledge it. Returns the number of relayed changes.
    ///
    /// A failed publish returns before the acknowledgement, leaving the whole batch to be
    /// delivered again.
    pub async fn relay_batch(&self) -> Result<usize, RelayError> {
        let mut backoff = Backoff::new(&self.backoff);
        let changes = backoff
            .retry("poll change feed", || self.feed.poll(self.batch_size))
            .await
            .map_err(RelayError::Feed)?;

        let Some(last) = changes.last() else {
            return Ok(0);
        };

        for change in &changes {
            self.publisher
                .publish_keyed(
                    &self.channel,
                    change.entity.as_bytes(),
                    change.payload.clone(),
                )
                .await?;
        }

        backoff.reset();
        backoff
            .retry("acknowledge change feed", || {
                self.feed.acknowledge(&last.cursor)
            })
            .await
            .map_err(RelayError::Feed)?;

        debug!(
            source = %self.feed.source(),
            channel = %self.channel,
            n_changes = changes.len(),
            cursor = %last.cursor,
            "relayed change batch"
        );

        Ok(changes.len())
    }

    /// Relay until shutdown is requested. A batch in flight is finished first.
    pub async fn run(&self, shutdown: ShutdownToken) -> Result<(), RelayError> {
        let source = self.feed.source();
        info!(%source, channel = %self.channel, "capture relay started");

        let res = loop {
            if shutdown.is_shutdown() {
                break Ok(());
            }

            match self.relay_batch().await {
                Ok(0) => {
                    tokio::select! {
                        _ = shutdown.wait_for_shutdown() => {}
                        _ = tokio::time::sleep(self.idle_interval) => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%source, error = %e, "capture relay stopped");
                    break Err(e);
                }
            }
        };

        info!(%source, "capture relay finished");
        res
    }
}
