//! Capture of source changes into the durable channels.
//!
//! An extractor prepares a source database for change capture
//! ([`RelationalExtractor`] configures a logical replication slot and publication,
//! [`DocumentExtractor`] validates and pins a change-stream watch). A [`CaptureRelay`] then moves
//! raw changes from the source-side feed into the source's channel through the
//! [`ChangePublisher`], acknowledging the feed only after the channel accepted the change.

use std::{collections::BTreeSet, error::Error};

use async_trait::async_trait;
use bronze_backoff::{BackoffError, Retryable};
use bronze_types::Source;

pub mod document;
#[cfg(feature = "mongodb")]
pub mod mongo;
pub mod pgoutput;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod publisher;
pub mod relational;
pub mod relay;

pub use document::{ChangeStreamAdmin, DocumentExtractor, Topology, WatchSpec};
pub use publisher::{ChangePublisher, PublishError};
pub use relational::{RelationalCaptureConfig, RelationalExtractor, ReplicationAdmin};
pub use relay::{CaptureRelay, ChangeFeed, RawChange, RelayError};

/// Whether a [`BackendError`] is worth retrying.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Connection loss, timeouts, server overload.
    Transient,
    /// Rejected statements, missing objects, bad credentials.
    Permanent,
}

/// Failure reported by a source database driver.
#[derive(Debug)]
pub struct BackendError {
    kind: BackendErrorKind,
    inner: Box<dyn Error + Sync + Send>,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, e: impl Into<Box<dyn Error + Sync + Send>>) -> Self {
        Self {
            kind,
            inner: e.into(),
        }
    }

    pub fn transient(e: impl Into<Box<dyn Error + Sync + Send>>) -> Self {
        Self::new(BackendErrorKind::Transient, e)
    }

    pub fn permanent(e: impl Into<Box<dyn Error + Sync + Send>>) -> Self {
        Self::new(BackendErrorKind::Permanent, e)
    }

    pub fn kind(&self) -> BackendErrorKind {
        self.kind
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BackendError({:?}): {}", self.kind, self.inner)
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

impl Retryable for BackendError {
    fn is_transient(&self) -> bool {
        self.kind == BackendErrorKind::Transient
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractorError {
    #[error("the entity allow-list is empty, refusing to capture every entity")]
    EmptyAllowList,

    #[error("invalid entity name '{entity}': {reason}")]
    InvalidEntity { entity: String, reason: &'static str },

    /// The source cannot support change capture as configured. Operator action is required.
    #[error("change capture unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("source backend call failed: {0}")]
    Backend(#[from] BackoffError<BackendError>),
}

impl ExtractorError {
    /// Errors that restarting the capture cannot resolve.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::EmptyAllowList | Self::InvalidEntity { .. } | Self::CapabilityUnavailable(_) => {
                true
            }
            Self::Backend(e) => e.is_permanent(),
        }
    }
}

/// Source-side resources capture was enabled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureHandle {
    pub source: Source,
    /// Captured entities, normalized and deduplicated.
    pub entities: BTreeSet<String>,
    /// Replication slot (relational) or database (document) the capture reads from.
    pub resource: String,
    /// `true` if this call created or changed source-side state.
    pub changed: bool,
}

/// A source whose change capture can be switched on.
#[async_trait]
pub trait CaptureExtractor: Send + Sync + std::fmt::Debug + 'static {
    fn source(&self) -> Source;

    /// Prepare the source so that changes of exactly `entities` are captured.
    ///
    /// Idempotent: calling again with the same allow-list changes nothing.
    async fn enable_capture(&self, entities: &[String]) -> Result<CaptureHandle, ExtractorError>;
}

#[async_trait]
impl<A> CaptureExtractor for RelationalExtractor<A>
where
    A: ReplicationAdmin,
{
    fn source(&self) -> Source {
        Source::Relational
    }

    async fn enable_capture(&self, entities: &[String]) -> Result<CaptureHandle, ExtractorError> {
        RelationalExtractor::enable_capture(self, entities).await
    }
}

#[async_trait]
impl<A> CaptureExtractor for DocumentExtractor<A>
where
    A: ChangeStreamAdmin,
{
    fn source(&self) -> Source {
        Source::Document
    }

    async fn enable_capture(&self, entities: &[String]) -> Result<CaptureHandle, ExtractorError> {
        DocumentExtractor::enable_capture(self, entities).await
    }
}

/// Validate an allow-list entry: a plain identifier, or `schema.name` when `allow_qualified`.
pub(crate) fn validate_entity(entity: &str, allow_qualified: bool) -> Result<(), ExtractorError> {
    let invalid = |reason| ExtractorError::InvalidEntity {
        entity: entity.to_string(),
        reason,
    };

    let parts: Vec<&str> = entity.split('.').collect();
    if parts.len() > 2 || (parts.len() == 2 && !allow_qualified) {
        return Err(invalid("too many name qualifiers"));
    }

    for part in parts {
        let mut chars = part.chars();
        match chars.next() {
            None => return Err(invalid("empty name")),
            Some(c) if !(c.is_ascii_alphabetic() || c == '_') => {
                return Err(invalid("must start with a letter or underscore"));
            }
            Some(_) => {}
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '-') {
            return Err(invalid("only letters, digits, '_', '$' and '-' are allowed"));
        }
        if part.len() > 63 {
            return Err(invalid("longer than 63 characters"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn entity_names() {
        validate_entity("users", false).unwrap();
        validate_entity("public.users", true).unwrap();
        validate_entity("_audit$log", false).unwrap();
        validate_entity("app-logs", false).unwrap();

        for bad in ["", "1users", "users; DROP TABLE x", "a.b.c", "\"users\"", "a..b"] {
            assert_matches!(
                validate_entity(bad, true),
                Err(ExtractorError::InvalidEntity { .. }),
                "{bad}"
            );
        }
        assert_matches!(
            validate_entity("public.users", false),
            Err(ExtractorError::InvalidEntity { .. })
        );
    }

    #[test]
    fn fatal_errors() {
        assert!(ExtractorError::CapabilityUnavailable("wal_level".into()).is_fatal());
        assert!(ExtractorError::EmptyAllowList.is_fatal());
    }
}
