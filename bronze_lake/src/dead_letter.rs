//! Quarantine for change envelopes that cannot be normalized.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bronze_backoff::{Backoff, BackoffConfig, BackoffError, Retryable};
use bronze_types::{PartitionId, Position, Source};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::{ObjectStore, PutPayload};
use observability_deps::tracing::warn;
use serde::{Deserialize, Serialize};

use crate::paths::DeadLetterPath;

/// A raw event that was set aside, along with why and where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub source: Source,
    pub partition_id: PartitionId,
    pub offset: Position,
    /// Short label, e.g. `malformed`.
    pub reason: String,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
    /// The raw envelope, when it is valid UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<String>,
    /// The raw envelope otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload_base64: Option<String>,
}

impl DeadLetterRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Source,
        partition_id: PartitionId,
        offset: Position,
        raw: &[u8],
        reason: &str,
        error: String,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let (raw_payload, raw_payload_base64) = match std::str::from_utf8(raw) {
            Ok(s) => (Some(s.to_string()), None),
            Err(_) => (None, Some(STANDARD.encode(raw))),
        };

        Self {
            source,
            partition_id,
            offset,
            reason: reason.to_string(),
            error,
            recorded_at,
            raw_payload,
            raw_payload_base64,
        }
    }

    /// The raw envelope bytes.
    pub fn raw(&self) -> Option<Vec<u8>> {
        match (&self.raw_payload, &self.raw_payload_base64) {
            (Some(s), _) => Some(s.clone().into_bytes()),
            (None, Some(b64)) => STANDARD.decode(b64).ok(),
            (None, None) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("failed to serialize dead-letter record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write dead-letter record {path}: {source}")]
    Store {
        path: String,
        source: BackoffError<object_store::Error>,
    },
}

impl Retryable for DeadLetterError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Serialize(_) => false,
            Self::Store { source, .. } => !source.is_permanent(),
        }
    }
}

/// Destination of events that failed normalization.
#[async_trait]
pub trait DeadLetterSink: Send + Sync + std::fmt::Debug + 'static {
    /// Durably store `record`. Recording the same channel position twice keeps one record.
    async fn record(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError>;
}

/// [`DeadLetterSink`] writing JSON objects below a prefix of an object store.
#[derive(Debug)]
pub struct ObjectStoreDeadLetterSink {
    object_store: Arc<dyn ObjectStore>,
    prefix: String,
    backoff: BackoffConfig,
}

impl ObjectStoreDeadLetterSink {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            object_store,
            prefix: prefix.into(),
            backoff,
        }
    }
}

#[async_trait]
impl DeadLetterSink for ObjectStoreDeadLetterSink {
    async fn record(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        let path = DeadLetterPath::new(
            &self.prefix,
            record.source,
            record.partition_id,
            record.offset,
        );
        let body = Bytes::from(serde_json::to_vec_pretty(record)?);

        Backoff::new(&self.backoff)
            .retry("dead-letter write", || {
                let object_store = Arc::clone(&self.object_store);
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
            .map_err(|source| DeadLetterError::Store {
                path: path.to_string(),
                source,
            })?;

        warn!(
            source = %record.source,
            partition = %record.partition_id,
            offset = %record.offset,
            reason = %record.reason,
            error = %record.error,
            %path,
            "change event dead-lettered"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use futures::TryStreamExt;
    use object_store::memory::InMemory;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn non_utf8_payloads_are_base64_encoded() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 7, 0, 0, 0).unwrap();
        let text = DeadLetterRecord::new(
            Source::Document,
            PartitionId::new(0),
            Position::new(1),
            b"{oops",
            "malformed",
            "invalid JSON".into(),
            ts,
        );
        assert_eq!(text.raw_payload.as_deref(), Some("{oops"));
        assert_eq!(text.raw_payload_base64, None);

        let binary = DeadLetterRecord::new(
            Source::Document,
            PartitionId::new(0),
            Position::new(2),
            &[0xff, 0xfe, 0x00],
            "malformed",
            "invalid JSON".into(),
            ts,
        );
        assert_eq!(binary.raw_payload, None);
        assert_eq!(binary.raw(), Some(vec![0xff, 0xfe, 0x00]));
    }

    #[tokio::test]
    async fn redelivery_keeps_a_single_record() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let sink = ObjectStoreDeadLetterSink::new(
            Arc::clone(&store),
            "_dead_letter",
            BackoffConfig {
                attempt_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );
        let record = DeadLetterRecord::new(
            Source::Relational,
            PartitionId::new(1),
            Position::new(7),
            br#"{"table": "users"}"#,
            "malformed",
            "missing required field 'lsn'".into(),
            Utc.with_ymd_and_hms(2024, 3, 7, 0, 0, 0).unwrap(),
        );

        sink.record(&record).await.unwrap();
        sink.record(&record).await.unwrap();

        let listed: Vec<_> = store
            .list(Some(&DeadLetterPath::dir("_dead_letter", Source::Relational)))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(
            listed[0].location.to_string(),
            "_dead_letter/relational/partition=1/offset_00000000000000000007.json"
        );

        let stored = store.get(&listed[0].location).await.unwrap().bytes().await.unwrap();
        let stored: DeadLetterRecord = serde_json::from_slice(&stored).unwrap();
        assert_eq!(stored, record);
    }
}
