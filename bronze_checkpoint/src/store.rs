use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bronze_backoff::{Backoff, BackoffConfig};
use bronze_types::{ConsumerCheckpoint, Position};
use bytes::Bytes;
use futures::TryStreamExt;
use iox_time::TimeProvider;
use object_store::{ObjectStore, path::Path};
use observability_deps::tracing::{debug, info};
use parking_lot::Mutex;

use crate::{
    CheckpointError, CheckpointKey, CheckpointStore,
    json::{get_bytes, put_bytes},
};

/// File extension of checkpoint documents.
pub const CHECKPOINT_FILE_EXTENSION: &str = "json";

/// [`CheckpointStore`] keeping one JSON document per key in an object store:
/// `{prefix}/{group}/{source}/partition_{P:05}.json`.
///
/// A put replaces the whole document at once, so a reader observes either the previous or the
/// new checkpoint.
#[derive(Debug)]
pub struct ObjectStoreCheckpointStore {
    object_store: Arc<dyn ObjectStore>,
    prefix: String,
    time_provider: Arc<dyn TimeProvider>,
    backoff: BackoffConfig,
    /// Last position known to be durable per key.
    committed: Mutex<HashMap<CheckpointKey, Position>>,
}

impl ObjectStoreCheckpointStore {
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
            committed: Default::default(),
        }
    }

    pub fn path(&self, key: &CheckpointKey) -> Path {
        Path::from_iter([
            self.prefix.as_str(),
            key.consumer_group.as_str(),
            key.source.as_str(),
            format!(
                "partition_{:05}.{CHECKPOINT_FILE_EXTENSION}",
                key.partition.get()
            )
            .as_str(),
        ])
    }

    async fn read(&self, path: &Path) -> Result<Option<ConsumerCheckpoint>, CheckpointError> {
        let Some(bytes) = get_bytes(&self.object_store, &self.backoff, path)
            .await
            .map_err(|source| CheckpointError::Store {
                path: path.to_string(),
                source,
            })?
        else {
            return Ok(None);
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|error| CheckpointError::Corrupt {
                path: path.to_string(),
                error,
            })
    }
}

#[async_trait]
impl CheckpointStore for ObjectStoreCheckpointStore {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<ConsumerCheckpoint>, CheckpointError> {
        let checkpoint = self.read(&self.path(key)).await?;

        match &checkpoint {
            Some(c) => {
                self.committed.lock().insert(key.clone(), c.position);
                info!(%key, position = %c.position, "loaded checkpoint");
            }
            None => {
                self.committed.lock().remove(key);
                info!(%key, "no checkpoint found, consuming from the start of the partition");
            }
        }

        Ok(checkpoint)
    }

    async fn commit(
        &self,
        key: &CheckpointKey,
        position: Position,
    ) -> Result<ConsumerCheckpoint, CheckpointError> {
        let path = self.path(key);

        let known = self.committed.lock().get(key).copied();
        let committed = match known {
            Some(p) => Some(p),
            None => self.read(&path).await?.map(|c| c.position),
        };
        if let Some(committed) = committed {
            if position < committed {
                return Err(CheckpointError::Regression {
                    key: key.clone(),
                    committed,
                    attempted: position,
                });
            }
        }

        let checkpoint = ConsumerCheckpoint {
            consumer_group: key.consumer_group.clone(),
            source: key.source,
            partition_id: key.partition,
            position,
            updated_at: self.time_provider.now().date_time(),
        };
        let body = serde_json::to_vec(&checkpoint).map_err(|error| CheckpointError::Serialize {
            key: key.clone(),
            error,
        })?;

        put_bytes(&self.object_store, &self.backoff, &path, Bytes::from(body))
            .await
            .map_err(|source| CheckpointError::Store {
                path: path.to_string(),
                source,
            })?;

        self.committed.lock().insert(key.clone(), position);
        debug!(%key, %position, "committed checkpoint");

        Ok(checkpoint)
    }

    async fn list(&self, consumer_group: &str) -> Result<Vec<ConsumerCheckpoint>, CheckpointError> {
        let dir = Path::from_iter([self.prefix.as_str(), consumer_group]);

        let locations = Backoff::new(&self.backoff)
            .retry("checkpoint list", || {
                let object_store = Arc::clone(&self.object_store);
                let dir = dir.clone();
                async move {
                    object_store
                        .list(Some(&dir))
                        .map_ok(|meta| meta.location)
                        .try_collect::<Vec<_>>()
                        .await
                }
            })
            .await
            .map_err(|source| CheckpointError::Store {
                path: dir.to_string(),
                source,
            })?;

        let mut checkpoints = Vec::with_capacity(locations.len());
        for location in locations {
            if location.extension() != Some(CHECKPOINT_FILE_EXTENSION) {
                continue;
            }
            if let Some(c) = self.read(&location).await? {
                checkpoints.push(c);
            }
        }
        checkpoints.sort_by_key(|c| (c.source, c.partition_id));

        Ok(checkpoints)
    }
}
