use std::sync::Arc;

use async_trait::async_trait;
use bronze_backoff::{Backoff, BackoffConfig, BackoffError, Retryable};
use bronze_types::ChangeEvent;
use bytes::Bytes;
use object_store::{ObjectStore, PutMode, PutPayload};
use observability_deps::tracing::debug;

use crate::paths::LakeObjectKey;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("failed to serialize change event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write lake object {key}: {source}")]
    Store {
        key: String,
        source: BackoffError<object_store::Error>,
    },
}

impl Retryable for WriteError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Serialize(_) => false,
            Self::Store { source, .. } => !source.is_permanent(),
        }
    }
}

/// Result of a successful lake write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub key: LakeObjectKey,
    /// `false` when an object already existed under the key, i.e. the event was a redelivery.
    pub created: bool,
}

/// Destination of normalized change events.
#[async_trait]
pub trait LakeSink: Send + Sync + std::fmt::Debug + 'static {
    /// Persist `event` under its deterministic key.
    ///
    /// Returns once the object is durable. Writing an event whose key already exists succeeds
    /// without modifying the stored object.
    async fn write(&self, event: &ChangeEvent) -> Result<WriteOutcome, WriteError>;
}

/// [`LakeSink`] on top of an [`ObjectStore`].
///
/// Objects are published with a single create-if-absent put, which is atomic on every
/// [`ObjectStore`] implementation: a reader either sees the complete object or nothing.
#[derive(Debug)]
pub struct LakeWriter {
    object_store: Arc<dyn ObjectStore>,
    backoff: BackoffConfig,
}

impl LakeWriter {
    pub fn new(object_store: Arc<dyn ObjectStore>, backoff: BackoffConfig) -> Self {
        Self {
            object_store,
            backoff,
        }
    }

    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.object_store)
    }
}

#[async_trait]
impl LakeSink for LakeWriter {
    async fn write(&self, event: &ChangeEvent) -> Result<WriteOutcome, WriteError> {
        let key = LakeObjectKey::for_event(event);
        let body = Bytes::from(serde_json::to_vec(event)?);

        let created = Backoff::new(&self.backoff)
            .retry("lake write", || {
                let object_store = Arc::clone(&self.object_store);
                let key = key.clone();
                let body = body.clone();
                async move {
                    match object_store
                        .put_opts(&key, PutPayload::from(body), PutMode::Create.into())
                        .await
                    {
                        Ok(_) => Ok(true),
                        // an earlier delivery, or an earlier attempt that timed out after landing
                        Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
                        Err(e) => Err(e),
                    }
                }
            })
            .await
            .map_err(|source| WriteError::Store {
                key: key.to_string(),
                source,
            })?;

        debug!(
            source = %event.source,
            entity = %event.entity,
            sequence = %event.source_sequence,
            %key,
            created,
            "wrote change event to lake"
        );

        Ok(WriteOutcome { key, created })
    }
}
