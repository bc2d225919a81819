//! Capture setup for the document source: a change-stream watch over the allow-listed
//! collections of one database.

use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use bronze_backoff::{Backoff, BackoffConfig};
use bronze_types::Source;
use observability_deps::tracing::info;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::{BackendError, CaptureHandle, ExtractorError, validate_entity};

/// Operation types the watch admits. `replace` is captured as an update.
pub const CAPTURED_OPERATION_TYPES: [&str; 4] = ["insert", "update", "delete", "replace"];

/// Deployment kind of the document source.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Topology {
    Standalone,
    ReplicaSet,
    Sharded,
}

impl Topology {
    /// Change streams need an oplog, which standalone servers do not keep.
    pub fn supports_change_streams(&self) -> bool {
        !matches!(self, Self::Standalone)
    }
}

/// What a change-stream watch covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSpec {
    pub database: String,
    pub collections: BTreeSet<String>,
}

impl WatchSpec {
    /// The aggregation pipeline restricting the stream to captured operations and collections.
    pub fn pipeline(&self) -> Vec<Value> {
        vec![json!({
            "$match": {
                "operationType": { "$in": CAPTURED_OPERATION_TYPES },
                "ns.coll": { "$in": self.collections },
            }
        })]
    }
}

/// Administrative calls against the document source.
#[async_trait]
pub trait ChangeStreamAdmin: Send + Sync + std::fmt::Debug + 'static {
    async fn topology(&self) -> Result<Topology, BackendError>;

    /// Record pre-images for `collection` so deletes carry the removed document.
    async fn enable_pre_images(&self, database: &str, collection: &str)
    -> Result<(), BackendError>;

    /// Open and close a watch for `spec`, proving the stream is readable with the configured
    /// credentials.
    async fn probe_watch(&self, spec: &WatchSpec) -> Result<(), BackendError>;
}

#[async_trait]
impl<T> ChangeStreamAdmin for Arc<T>
where
    T: ChangeStreamAdmin,
{
    async fn topology(&self) -> Result<Topology, BackendError> {
        (**self).topology().await
    }

    async fn enable_pre_images(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<(), BackendError> {
        (**self).enable_pre_images(database, collection).await
    }

    async fn probe_watch(&self, spec: &WatchSpec) -> Result<(), BackendError> {
        (**self).probe_watch(spec).await
    }
}

#[derive(Debug)]
pub struct DocumentExtractor<A> {
    admin: A,
    database: String,
    backoff: BackoffConfig,
    active: Mutex<Option<(WatchSpec, CaptureHandle)>>,
}

impl<A> DocumentExtractor<A>
where
    A: ChangeStreamAdmin,
{
    pub fn new(admin: A, database: impl Into<String>, backoff: BackoffConfig) -> Self {
        Self {
            admin,
            database: database.into(),
            backoff,
            active: Default::default(),
        }
    }

    /// The watch set up by the last successful [`enable_capture`](Self::enable_capture).
    pub fn active_watch(&self) -> Option<WatchSpec> {
        self.active.lock().as_ref().map(|(spec, _)| spec.clone())
    }

    /// Prepare a watch over exactly `entities`.
    ///
    /// Enabling the same set again returns the existing handle without touching the source.
    pub async fn enable_capture(&self, entities: &[String]) -> Result<CaptureHandle, ExtractorError> {
        if entities.is_empty() {
            return Err(ExtractorError::EmptyAllowList);
        }
        for e in entities {
            validate_entity(e, false)?;
        }
        let spec = WatchSpec {
            database: self.database.clone(),
            collections: entities.iter().cloned().collect(),
        };

        if let Some((active, handle)) = self.active.lock().as_ref() {
            if *active == spec {
                return Ok(CaptureHandle {
                    changed: false,
                    ..handle.clone()
                });
            }
        }

        let mut backoff = Backoff::new(&self.backoff);
        let topology = backoff
            .retry("read deployment topology", || self.admin.topology())
            .await?;
        if !topology.supports_change_streams() {
            return Err(ExtractorError::CapabilityUnavailable(format!(
                "deployment is {topology:?}; change streams require a replica set or sharded cluster"
            )));
        }

        for collection in &spec.collections {
            backoff.reset();
            backoff
                .retry("enable pre-images", || {
                    self.admin.enable_pre_images(&spec.database, collection)
                })
                .await?;
        }

        backoff.reset();
        backoff
            .retry("probe change stream", || self.admin.probe_watch(&spec))
            .await?;

        info!(
            database = %spec.database,
            collections = ?spec.collections,
            "change stream capture enabled"
        );

        let handle = CaptureHandle {
            source: Source::Document,
            entities: spec.collections.clone(),
            resource: spec.database.clone(),
            changed: true,
        };
        *self.active.lock() = Some((spec, handle.clone()));

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug)]
    struct MockAdmin {
        topology: Topology,
        probes: Mutex<Vec<WatchSpec>>,
        pre_images: Mutex<Vec<String>>,
    }

    impl MockAdmin {
        fn new(topology: Topology) -> Arc<Self> {
            Arc::new(Self {
                topology,
                probes: Default::default(),
                pre_images: Default::default(),
            })
        }
    }

    #[async_trait]
    impl ChangeStreamAdmin for MockAdmin {
        async fn topology(&self) -> Result<Topology, BackendError> {
            Ok(self.topology)
        }

        async fn enable_pre_images(
            &self,
            database: &str,
            collection: &str,
        ) -> Result<(), BackendError> {
            self.pre_images
                .lock()
                .push(format!("{database}.{collection}"));
            Ok(())
        }

        async fn probe_watch(&self, spec: &WatchSpec) -> Result<(), BackendError> {
            self.probes.lock().push(spec.clone());
            Ok(())
        }
    }

    fn extractor(admin: Arc<MockAdmin>) -> DocumentExtractor<Arc<MockAdmin>> {
        DocumentExtractor::new(
            admin,
            "app",
            BackoffConfig {
                init_backoff: Duration::from_millis(1),
                max_attempts: 2,
                ..Default::default()
            },
        )
    }

    fn entities(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pipeline_filters_operations_and_collections() {
        let spec = WatchSpec {
            database: "app".into(),
            collections: ["logs", "events"].into_iter().map(String::from).collect(),
        };
        assert_eq!(
            Value::Array(spec.pipeline()),
            json!([{
                "$match": {
                    "operationType": { "$in": ["insert", "update", "delete", "replace"] },
                    "ns.coll": { "$in": ["events", "logs"] },
                }
            }])
        );
    }

    #[tokio::test]
    async fn equal_spec_does_not_open_a_second_watch() {
        let admin = MockAdmin::new(Topology::ReplicaSet);
        let extractor = extractor(Arc::clone(&admin));

        let first = extractor
            .enable_capture(&entities(&["logs", "events"]))
            .await
            .unwrap();
        assert!(first.changed);
        assert_eq!(first.resource, "app");

        let second = extractor
            .enable_capture(&entities(&["events", "logs", "logs"]))
            .await
            .unwrap();
        assert!(!second.changed);
        assert_eq!(second.entities, first.entities);
        assert_eq!(admin.probes.lock().len(), 1);
        assert_eq!(*admin.pre_images.lock(), vec!["app.events", "app.logs"]);

        // a different allow-list replaces the active watch
        extractor
            .enable_capture(&entities(&["logs"]))
            .await
            .unwrap();
        assert_eq!(admin.probes.lock().len(), 2);
        assert_eq!(
            extractor.active_watch().unwrap().collections,
            ["logs".to_string()].into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[tokio::test]
    async fn standalone_server_is_unsupported() {
        let admin = MockAdmin::new(Topology::Standalone);
        let err = extractor(Arc::clone(&admin))
            .enable_capture(&entities(&["logs"]))
            .await
            .unwrap_err();
        assert_matches!(err, ExtractorError::CapabilityUnavailable(_));
        assert!(admin.probes.lock().is_empty());
    }

    #[tokio::test]
    async fn rejects_empty_and_invalid_allow_lists() {
        let extractor = extractor(MockAdmin::new(Topology::Sharded));
        assert_matches!(
            extractor.enable_capture(&[]).await,
            Err(ExtractorError::EmptyAllowList)
        );
        assert_matches!(
            extractor.enable_capture(&entities(&["app.logs"])).await,
            Err(ExtractorError::InvalidEntity { .. })
        );
        assert_eq!(extractor.active_watch(), None);
    }
}
