//! MongoDB backends: change-stream administration and the resumable change feed.

use std::sync::Arc;

use async_trait::async_trait;
use bronze_backoff::Retryable;
use bronze_checkpoint::{CursorError, CursorStore};
use bronze_types::Source;
use bytes::Bytes;
use mongodb::{
    Database,
    bson::{self, Bson, Document, doc},
    change_stream::{ChangeStream, event::ResumeToken},
    error::ErrorKind,
    options::{ChangeStreamOptions, FullDocumentBeforeChangeType, FullDocumentType},
};
use observability_deps::tracing::{debug, info, warn};
use tokio::sync::Mutex;

use crate::{BackendError, ChangeStreamAdmin, RawChange, Topology, WatchSpec, relay::ChangeFeed};

fn backend_error(e: mongodb::error::Error) -> BackendError {
    match *e.kind {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => BackendError::transient(e),
        _ => BackendError::permanent(e),
    }
}

fn cursor_error(e: CursorError) -> BackendError {
    if e.is_transient() {
        BackendError::transient(e)
    } else {
        BackendError::permanent(e)
    }
}

fn pipeline(spec: &WatchSpec) -> Result<Vec<Document>, BackendError> {
    spec.pipeline()
        .iter()
        .map(|stage| bson::to_document(stage).map_err(BackendError::permanent))
        .collect()
}

fn watch_options() -> ChangeStreamOptions {
    ChangeStreamOptions::builder()
        .full_document(Some(FullDocumentType::UpdateLookup))
        .full_document_before_change(Some(FullDocumentBeforeChangeType::WhenAvailable))
        .build()
}

#[derive(Debug)]
pub struct MongoChangeStreamAdmin {
    client: mongodb::Client,
}

impl MongoChangeStreamAdmin {
    pub async fn connect(uri: &str) -> Result<Self, BackendError> {
        let client = mongodb::Client::with_uri_str(uri)
            .await
            .map_err(backend_error)?;
        info!("connected to mongodb");
        Ok(Self { client })
    }

    pub fn database(&self, name: &str) -> Database {
        self.client.database(name)
    }
}

#[async_trait]
impl ChangeStreamAdmin for MongoChangeStreamAdmin {
    async fn topology(&self) -> Result<Topology, BackendError> {
        let hello = self
            .client
            .database("admin")
            .run_command(doc! { "hello": 1 }, None)
            .await
            .map_err(backend_error)?;

        Ok(if hello.contains_key("setName") {
            Topology::ReplicaSet
        } else if hello.get_str("msg").ok() == Some("isdbgrid") {
            Topology::Sharded
        } else {
            Topology::Standalone
        })
    }

    async fn enable_pre_images(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<(), BackendError> {
        self.client
            .database(database)
            .run_command(
                doc! {
                    "collMod": collection,
                    "changeStreamPreAndPostImages": { "enabled": true },
                },
                None,
            )
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn probe_watch(&self, spec: &WatchSpec) -> Result<(), BackendError> {
        let stream = self
            .client
            .database(&spec.database)
            .watch(pipeline(spec)?, watch_options())
            .await
            .map_err(backend_error)?;
        drop(stream);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FeedState {
    stream: Option<ChangeStream<Document>>,
    /// Cursor of the last polled batch, until it is acknowledged.
    unacknowledged: Option<String>,
}

/// [`ChangeFeed`] over a change stream, resuming from the token kept in a [`CursorStore`].
#[derive(Debug)]
pub struct MongoChangeFeed {
    database: Database,
    spec: WatchSpec,
    cursors: Arc<dyn CursorStore>,
    state: Mutex<FeedState>,
}

impl MongoChangeFeed {
    pub fn new(database: Database, spec: WatchSpec, cursors: Arc<dyn CursorStore>) -> Self {
        Self {
            database,
            spec,
            cursors,
            state: Default::default(),
        }
    }

    async fn open(&self) -> Result<ChangeStream<Document>, BackendError> {
        let mut options = watch_options();
        if let Some(token) = self
            .cursors
            .load(Source::Document, &self.spec.database)
            .await
            .map_err(cursor_error)?
        {
            let token: ResumeToken = bson::from_bson(Bson::Document(doc! { "_data": token.as_str() }))
                .map_err(BackendError::permanent)?;
            options.resume_after = Some(token);
            debug!(database = %self.spec.database, "resuming change stream");
        }

        Ok(self
            .database
            .watch(pipeline(&self.spec)?, options)
            .await
            .map_err(backend_error)?
            .with_type::<Document>())
    }
}

#[async_trait]
impl ChangeFeed for MongoChangeFeed {
    fn source(&self) -> Source {
        Source::Document
    }

    async fn poll(&self, max_changes: usize) -> Result<Vec<RawChange>, BackendError> {
        let mut state = self.state.lock().await;

        // a batch that was never acknowledged must be read again
        if state.unacknowledged.take().is_some() {
            warn!(database = %self.spec.database, "re-reading unacknowledged changes");
            state.stream = None;
        }

        let mut stream = match state.stream.take() {
            Some(s) => s,
            None => self.open().await?,
        };

        let mut changes = vec![];
        while changes.len() < max_changes {
            let Some(event) = stream.next_if_any().await.map_err(backend_error)? else {
                break;
            };

            let entity = event
                .get_document("ns")
                .and_then(|ns| ns.get_str("coll"))
                .unwrap_or_default()
                .to_string();
            let cursor = event
                .get_document("_id")
                .and_then(|id| id.get_str("_data"))
                .map_err(BackendError::permanent)?
                .to_string();
            let payload = Bson::Document(event).into_relaxed_extjson().to_string();

            changes.push(RawChange {
                entity,
                payload: Bytes::from(payload),
                cursor,
            });
        }

        state.unacknowledged = changes.last().map(|c| c.cursor.clone());
        state.stream = Some(stream);

        Ok(changes)
    }

    async fn acknowledge(&self, cursor: &str) -> Result<(), BackendError> {
        self.cursors
            .store(Source::Document, &self.spec.database, cursor)
            .await
            .map_err(cursor_error)?;

        let mut state = self.state.lock().await;
        if state.unacknowledged.as_deref() == Some(cursor) {
            state.unacknowledged = None;
        }
        Ok(())
    }
}
