//! Source-side resume cursors of the capture relays.

use std::sync::Arc;

use async_trait::async_trait;
use bronze_backoff::{BackoffConfig, BackoffError, Retryable};
use bronze_types::Source;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use iox_time::TimeProvider;
use object_store::{ObjectStore, path::Path};
use serde::{Deserialize, Serialize};

use crate::json::{get_bytes, put_bytes};

#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("cursor {path} is not a valid cursor document: {error}")]
    Corrupt {
        path: String,
        error: serde_json::Error,
    },

    #[error("failed to serialize cursor {path}: {error}")]
    Serialize {
        path: String,
        error: serde_json::Error,
    },

    #[error("cursor store operation on {path} failed: {source}")]
    Store {
        path: String,
        source: BackoffError<object_store::Error>,
    },
}

impl Retryable for CursorError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Store { source, .. } => !source.is_permanent(),
            Self::Corrupt { .. } | Self::Serialize { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorDocument {
    cursor: String,
    updated_at: DateTime<Utc>,
}

/// Durable, opaque resume position of a source-side change feed.
#[async_trait]
pub trait CursorStore: Send + Sync + std::fmt::Debug + 'static {
    async fn load(&self, source: Source, name: &str) -> Result<Option<String>, CursorError>;

    async fn store(&self, source: Source, name: &str, cursor: &str) -> Result<(), CursorError>;
}

/// [`CursorStore`] writing `{prefix}/{source}/{name}.json` documents.
#[derive(Debug)]
pub struct ObjectStoreCursorStore {
    object_store: Arc<dyn ObjectStore>,
    prefix: String,
    time_provider: Arc<dyn TimeProvider>,
    backoff: BackoffConfig,
}

impl ObjectStoreCursorStore {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        time_provider: Arc<dyn TimeProvider>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            object_store,
            prefix: prefix.into(),
            time_provider,
            backoff,
        }
    }

    fn path(&self, source: Source, name: &str) -> Path {
        Path::from_iter([
            self.prefix.as_str(),
            source.as_str(),
            format!("{name}.json").as_str(),
        ])
    }
}

#[async_trait]
impl CursorStore for ObjectStoreCursorStore {
    async fn load(&self, source: Source, name: &str) -> Result<Option<String>, CursorError> {
        let path = self.path(source, name);
        let Some(bytes) = get_bytes(&self.object_store, &self.backoff, &path)
            .await
            .map_err(|source| CursorError::Store {
                path: path.to_string(),
                source,
            })?
        else {
            return Ok(None);
        };

        let doc: CursorDocument =
            serde_json::from_slice(&bytes).map_err(|error| CursorError::Corrupt {
                path: path.to_string(),
                error,
            })?;
        Ok(Some(doc.cursor))
    }

    async fn store(&self, source: Source, name: &str, cursor: &str) -> Result<(), CursorError> {
        let path = self.path(source, name);
        let doc = CursorDocument {
            cursor: cursor.to_string(),
            updated_at: self.time_provider.now().date_time(),
        };
        let body = serde_json::to_vec(&doc).map_err(|error| CursorError::Serialize {
            path: path.to_string(),
            error,
        })?;

        put_bytes(&self.object_store, &self.backoff, &path, Bytes::from(body))
            .await
            .map_err(|source| CursorError::Store {
                path: path.to_string(),
                source,
            })
    }
}
