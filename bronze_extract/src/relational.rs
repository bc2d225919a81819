//! Capture setup for the relational source: a logical replication slot plus a publication
//! scoped to the allow-listed tables.

use std::collections::BTreeSet;

use async_trait::async_trait;
use bronze_backoff::{Backoff, BackoffConfig};
use bronze_types::Source;
use observability_deps::tracing::{debug, info, warn};
use tokio::sync::Mutex;

use crate::{BackendError, CaptureHandle, ExtractorError, validate_entity};

/// How often a resource is looked up again after another session created it concurrently.
const SETUP_ROUNDS: usize = 3;

/// Administrative calls against the relational source.
#[async_trait]
pub trait ReplicationAdmin: Send + Sync + std::fmt::Debug + 'static {
    /// Current `wal_level` setting.
    async fn wal_level(&self) -> Result<String, BackendError>;

    /// Whether the connected role may create replication slots.
    async fn has_replication_privilege(&self) -> Result<bool, BackendError>;

    /// Output plugin of `slot`, or `None` when the slot does not exist.
    async fn slot_plugin(&self, slot: &str) -> Result<Option<String>, BackendError>;

    /// Create `slot`. Returns `false` when another session created it first.
    async fn create_slot(&self, slot: &str, plugin: &str) -> Result<bool, BackendError>;

    /// Schema-qualified tables of `publication`, or `None` when it does not exist.
    async fn publication_tables(
        &self,
        publication: &str,
    ) -> Result<Option<BTreeSet<String>>, BackendError>;

    /// Create `publication`. Returns `false` when another session created it first.
    async fn create_publication(
        &self,
        publication: &str,
        tables: &BTreeSet<String>,
    ) -> Result<bool, BackendError>;

    /// Replace the table set of an existing publication.
    async fn set_publication_tables(
        &self,
        publication: &str,
        tables: &BTreeSet<String>,
    ) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationalCaptureConfig {
    pub slot: String,
    pub plugin: String,
    pub publication: String,
    /// Schema of allow-list entries given without one.
    pub default_schema: String,
}

impl Default for RelationalCaptureConfig {
    fn default() -> Self {
        Self {
            slot: "bronze_slot".to_string(),
            plugin: "pgoutput".to_string(),
            publication: "bronze_pub".to_string(),
            default_schema: "public".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct RelationalExtractor<A> {
    admin: A,
    config: RelationalCaptureConfig,
    backoff: BackoffConfig,
    /// Held for the duration of [`Self::enable_capture`].
    setup: Mutex<()>,
}

impl<A> RelationalExtractor<A>
where
    A: ReplicationAdmin,
{
    pub fn new(admin: A, config: RelationalCaptureConfig, backoff: BackoffConfig) -> Self {
        Self {
            admin,
            config,
            backoff,
            setup: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RelationalCaptureConfig {
        &self.config
    }

    /// Prepare the source so changes of exactly `entities` are captured.
    ///
    /// Safe to call repeatedly and concurrently: existing resources that already match are left
    /// alone, and a resource another session creates first is verified instead of recreated.
    pub async fn enable_capture(&self, entities: &[String]) -> Result<CaptureHandle, ExtractorError> {
        let tables = self.qualified_tables(entities)?;
        let _setup = self.setup.lock().await;
        let mut backoff = Backoff::new(&self.backoff);

        let wal_level = backoff
            .retry("read wal_level", || self.admin.wal_level())
            .await?;
        if wal_level != "logical" {
            return Err(ExtractorError::CapabilityUnavailable(format!(
                "wal_level is '{wal_level}', logical decoding requires 'logical'"
            )));
        }

        backoff.reset();
        let privileged = backoff
            .retry("check replication privilege", || {
                self.admin.has_replication_privilege()
            })
            .await?;
        if !privileged {
            return Err(ExtractorError::CapabilityUnavailable(
                "the connected role lacks the REPLICATION privilege".to_string(),
            ));
        }

        let slot_changed = self.ensure_slot(&mut backoff).await?;
        let publication_changed = self.ensure_publication(&tables, &mut backoff).await?;

        Ok(CaptureHandle {
            source: Source::Relational,
            entities: tables,
            resource: self.config.slot.clone(),
            changed: slot_changed || publication_changed,
        })
    }

    /// Returns `true` if the slot was created by this call.
    async fn ensure_slot(&self, backoff: &mut Backoff) -> Result<bool, ExtractorError> {
        let slot = self.config.slot.as_str();
        let plugin = self.config.plugin.as_str();

        for _ in 0..SETUP_ROUNDS {
            backoff.reset();
            match backoff
                .retry("look up replication slot", || self.admin.slot_plugin(slot))
                .await?
            {
                Some(existing) if existing == plugin => {
                    info!(slot, plugin, "reusing existing replication slot");
                    return Ok(false);
                }
                Some(existing) => {
                    return Err(ExtractorError::CapabilityUnavailable(format!(
                        "replication slot '{slot}' uses output plugin '{existing}', \
                         expected '{plugin}'; drop it or configure another slot name"
                    )));
                }
                None => {}
            }

            backoff.reset();
            if backoff
                .retry("create replication slot", || {
                    self.admin.create_slot(slot, plugin)
                })
                .await?
            {
                info!(slot, plugin, "created replication slot");
                return Ok(true);
            }
            debug!(slot, "replication slot created by another session, verifying");
        }

        Err(ExtractorError::CapabilityUnavailable(format!(
            "replication slot '{slot}' is repeatedly created and dropped by another session"
        )))
    }

    /// Returns `true` if the publication was created or re-scoped by this call.
    async fn ensure_publication(
        &self,
        tables: &BTreeSet<String>,
        backoff: &mut Backoff,
    ) -> Result<bool, ExtractorError> {
        let publication = self.config.publication.as_str();

        for _ in 0..SETUP_ROUNDS {
            backoff.reset();
            match backoff
                .retry("look up publication", || {
                    self.admin.publication_tables(publication)
                })
                .await?
            {
                Some(existing) if existing == *tables => {
                    info!(publication, "publication already covers the configured tables");
                    return Ok(false);
                }
                Some(existing) => {
                    warn!(
                        publication,
                        existing = ?existing,
                        configured = ?tables,
                        "publication table set differs, re-scoping"
                    );
                    backoff.reset();
                    backoff
                        .retry("alter publication", || {
                            self.admin.set_publication_tables(publication, tables)
                        })
                        .await?;
                    return Ok(true);
                }
                None => {}
            }

            backoff.reset();
            if backoff
                .retry("create publication", || {
                    self.admin.create_publication(publication, tables)
                })
                .await?
            {
                info!(publication, tables = ?tables, "created publication");
                return Ok(true);
            }
            debug!(publication, "publication created by another session, verifying");
        }

        Err(ExtractorError::CapabilityUnavailable(format!(
            "publication '{publication}' is repeatedly created and dropped by another session"
        )))
    }

    fn qualified_tables(&self, entities: &[String]) -> Result<BTreeSet<String>, ExtractorError> {
        if entities.is_empty() {
            return Err(ExtractorError::EmptyAllowList);
        }

        entities
            .iter()
            .map(|e| {
                validate_entity(e, true)?;
                Ok(if e.contains('.') {
                    e.clone()
                } else {
                    format!("{}.{e}", self.config.default_schema)
                })
            })
            .collect()
    }
}

#[async_trait]
impl<T> ReplicationAdmin for std::sync::Arc<T>
where
    T: ReplicationAdmin,
{
    async fn wal_level(&self) -> Result<String, BackendError> {
        (**self).wal_level().await
    }

    async fn has_replication_privilege(&self) -> Result<bool, BackendError> {
        (**self).has_replication_privilege().await
    }

    async fn slot_plugin(&self, slot: &str) -> Result<Option<String>, BackendError> {
        (**self).slot_plugin(slot).await
    }

    async fn create_slot(&self, slot: &str, plugin: &str) -> Result<bool, BackendError> {
        (**self).create_slot(slot, plugin).await
    }

    async fn publication_tables(
        &self,
        publication: &str,
    ) -> Result<Option<BTreeSet<String>>, BackendError> {
        (**self).publication_tables(publication).await
    }

    async fn create_publication(
        &self,
        publication: &str,
        tables: &BTreeSet<String>,
    ) -> Result<bool, BackendError> {
        (**self).create_publication(publication, tables).await
    }

    async fn set_publication_tables(
        &self,
        publication: &str,
        tables: &BTreeSet<String>,
    ) -> Result<(), BackendError> {
        (**self).set_publication_tables(publication, tables).await
    }
}
