use std::sync::Arc;

use bronze_backoff::{Backoff, BackoffConfig, BackoffError};
use bytes::Bytes;
use object_store::{ObjectStore, PutPayload, path::Path};

/// Fetch `path`, retrying transient failures. A missing object is `Ok(None)`.
pub(crate) async fn get_bytes(
    object_store: &Arc<dyn ObjectStore>,
    backoff: &BackoffConfig,
    path: &Path,
) -> Result<Option<Bytes>, BackoffError<object_store::Error>> {
    Backoff::new(backoff)
        .retry("state read", || {
            let object_store = Arc::clone(object_store);
            let path = path.clone();
            async move {
                match object_store.get(&path).await {
                    Ok(res) => res.bytes().await.map(Some),
                    Err(object_store::Error::NotFound { .. }) => Ok(None),
                    Err(e) => Err(e),
                }
            }
        })
        .await
}

/// Overwrite `path` with `body`, retrying transient failures.
pub(crate) async fn put_bytes(
    object_store: &Arc<dyn ObjectStore>,
    backoff: &BackoffConfig,
    path: &Path,
    body: Bytes,
) -> Result<(), BackoffError<object_store::Error>> {
    Backoff::new(backoff)
        .retry("state write", || {
            let object_store = Arc::clone(object_store);
            let path = path.clone();
            let body = body.clone();
            async move {
                object_store
                    .put(&path, PutPayload::from(body))
                    .await
                    .map(|_| ())
            }
        })
        .await
}
