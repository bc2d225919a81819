//! Wiring shared by the subcommands: durable stores and source connections.

use std::sync::Arc;

use bronze_backoff::BackoffConfig;
use bronze_checkpoint::{
    CheckpointStore, CursorStore, ObjectStoreCheckpointStore, ObjectStoreCursorStore,
};
use bronze_clap_blocks::capture::{CaptureConfig, StateConfig};
use bronze_extract::{BackendError, CaptureExtractor, CaptureHandle, ChangeFeed};
use bronze_lake::{DeadLetterSink, LakeSink, LakeWriter, ObjectStoreDeadLetterSink};
use bronze_types::Source;
use iox_time::{SystemProvider, TimeProvider};
use object_store::DynObjectStore;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConnectError {
    #[error("failed to connect to the {origin} source: {error}")]
    Backend { origin: Source, error: BackendError },

    #[error("{origin} capture support not enabled, recompile with the {feature} feature")]
    NotEnabled {
        origin: Source,
        feature: &'static str,
    },

    #[error("--mongo-database / `BRONZE_MONGO_DATABASE` is required with --mongo-uri")]
    MissingDatabase,
}

/// Everything the pipeline keeps in the object store.
#[derive(Debug, Clone)]
pub(crate) struct Stores {
    pub(crate) time_provider: Arc<dyn TimeProvider>,
    pub(crate) lake: Arc<dyn LakeSink>,
    pub(crate) dead_letters: Arc<dyn DeadLetterSink>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) cursors: Arc<dyn CursorStore>,
}

impl Stores {
    pub(crate) fn new(
        object_store: Arc<DynObjectStore>,
        state: &StateConfig,
        backoff: BackoffConfig,
    ) -> Self {
        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());

        Self {
            lake: Arc::new(LakeWriter::new(Arc::clone(&object_store), backoff)),
            dead_letters: Arc::new(ObjectStoreDeadLetterSink::new(
                Arc::clone(&object_store),
                state.dead_letter_prefix.as_str(),
                backoff,
            )),
            checkpoints: Arc::new(ObjectStoreCheckpointStore::new(
                Arc::clone(&object_store),
                state.checkpoint_prefix.as_str(),
                Arc::clone(&time_provider),
                backoff,
            )),
            cursors: Arc::new(ObjectStoreCursorStore::new(
                object_store,
                state.cursor_prefix.as_str(),
                Arc::clone(&time_provider),
                backoff,
            )),
            time_provider,
        }
    }
}

type FeedFactory =
    Box<dyn FnOnce(&CaptureHandle, Arc<dyn CursorStore>) -> Box<dyn ChangeFeed> + Send>;

/// A source database the process is connected to.
pub(crate) struct ConnectedSource {
    pub(crate) source: Source,
    pub(crate) extractor: Arc<dyn CaptureExtractor>,
    feed: FeedFactory,
}

impl std::fmt::Debug for ConnectedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedSource")
            .field("source", &self.source)
            .field("extractor", &self.extractor)
            .finish_non_exhaustive()
    }
}

impl ConnectedSource {
    /// The change feed over what `handle` enabled capture on.
    ///
    /// Feeds that cannot resume from the source itself keep their position in `cursors`.
    pub(crate) fn into_feed(
        self,
        handle: &CaptureHandle,
        cursors: Arc<dyn CursorStore>,
    ) -> Box<dyn ChangeFeed> {
        (self.feed)(handle, cursors)
    }
}

/// Connect to the database of `source`, or `None` if it is not configured.
pub(crate) async fn connect_source(
    source: Source,
    capture: &CaptureConfig,
    backoff: BackoffConfig,
) -> Result<Option<ConnectedSource>, ConnectError> {
    match source {
        Source::Relational => connect_relational(capture, backoff).await,
        Source::Document => connect_document(capture, backoff).await,
    }
}

#[cfg(feature = "postgres")]
async fn connect_relational(
    capture: &CaptureConfig,
    backoff: BackoffConfig,
) -> Result<Option<ConnectedSource>, ConnectError> {
    use bronze_extract::{
        RelationalCaptureConfig, RelationalExtractor,
        postgres::{PgChangeFeed, PgReplicationAdmin, connect},
    };

    let Some(url) = capture.postgres_url.as_deref() else {
        return Ok(None);
    };

    let client = connect(url).await.map_err(|error| ConnectError::Backend {
        origin: Source::Relational,
        error,
    })?;

    let config = RelationalCaptureConfig {
        slot: capture.replication_slot.clone(),
        publication: capture.publication.clone(),
        default_schema: capture.default_schema.clone(),
        ..Default::default()
    };
    let feed = PgChangeFeed::new(
        Arc::clone(&client),
        config.slot.as_str(),
        config.publication.as_str(),
    );
    let extractor = RelationalExtractor::new(PgReplicationAdmin::new(client), config, backoff);

    Ok(Some(ConnectedSource {
        source: Source::Relational,
        extractor: Arc::new(extractor),
        feed: Box::new(move |_: &CaptureHandle, _: Arc<dyn CursorStore>| {
            Box::new(feed) as Box<dyn ChangeFeed>
        }),
    }))
}

#[cfg(not(feature = "postgres"))]
async fn connect_relational(
    capture: &CaptureConfig,
    _backoff: BackoffConfig,
) -> Result<Option<ConnectedSource>, ConnectError> {
    match capture.postgres_url {
        Some(_) => Err(ConnectError::NotEnabled {
            origin: Source::Relational,
            feature: "postgres",
        }),
        None => Ok(None),
    }
}

#[cfg(feature = "mongodb")]
async fn connect_document(
    capture: &CaptureConfig,
    backoff: BackoffConfig,
) -> Result<Option<ConnectedSource>, ConnectError> {
    use bronze_extract::{
        DocumentExtractor, WatchSpec,
        mongo::{MongoChangeFeed, MongoChangeStreamAdmin},
    };

    let Some(uri) = capture.mongo_uri.as_deref() else {
        return Ok(None);
    };
    let database = capture
        .mongo_database
        .as_deref()
        .ok_or(ConnectError::MissingDatabase)?;

    let admin = MongoChangeStreamAdmin::connect(uri)
        .await
        .map(Arc::new)
        .map_err(|error| ConnectError::Backend {
            origin: Source::Document,
            error,
        })?;
    let extractor = DocumentExtractor::new(Arc::clone(&admin), database, backoff);

    Ok(Some(ConnectedSource {
        source: Source::Document,
        extractor: Arc::new(extractor),
        feed: Box::new(move |handle: &CaptureHandle, cursors: Arc<dyn CursorStore>| {
            let spec = WatchSpec {
                database: handle.resource.clone(),
                collections: handle.entities.clone(),
            };
            Box::new(MongoChangeFeed::new(
                admin.database(&spec.database),
                spec,
                cursors,
            )) as Box<dyn ChangeFeed>
        }),
    }))
}

#[cfg(not(feature = "mongodb"))]
async fn connect_document(
    capture: &CaptureConfig,
    _backoff: BackoffConfig,
) -> Result<Option<ConnectedSource>, ConnectError> {
    match capture.mongo_uri {
        Some(_) => Err(ConnectError::NotEnabled {
            origin: Source::Document,
            feature: "mongodb",
        }),
        None => Ok(None),
    }
}
