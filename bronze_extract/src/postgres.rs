//! PostgreSQL backends: replication administration and the slot-peeking change feed.

use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use bronze_types::{Source, SourceSequence};
use observability_deps::tracing::{debug, error, info};
use tokio_postgres::{Client, NoTls, error::SqlState};

use crate::{
    BackendError, RawChange, ReplicationAdmin,
    pgoutput::TransactionBuffer,
    relay::ChangeFeed,
};

/// Largest number of messages one poll peeks while looking for a complete transaction.
const MAX_PEEK_CHANGES: i32 = 1 << 20;

fn backend_error(e: tokio_postgres::Error) -> BackendError {
    let transient = e.is_closed()
        || match e.code() {
            None => true,
            Some(code) => [
                SqlState::ADMIN_SHUTDOWN,
                SqlState::CRASH_SHUTDOWN,
                SqlState::CANNOT_CONNECT_NOW,
                SqlState::TOO_MANY_CONNECTIONS,
                SqlState::T_R_SERIALIZATION_FAILURE,
                SqlState::T_R_DEADLOCK_DETECTED,
                SqlState::OBJECT_IN_USE,
            ]
            .contains(code),
        };
    if transient {
        BackendError::transient(e)
    } else {
        BackendError::permanent(e)
    }
}

/// Connect to `config` (a libpq-style connection string) and drive the connection in the
/// background.
pub async fn connect(config: &str) -> Result<Arc<Client>, BackendError> {
    let (client, connection) = tokio_postgres::connect(config, NoTls)
        .await
        .map_err(backend_error)?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!(error = %e, "postgres connection closed with error");
        }
    });
    info!("connected to postgres");
    Ok(Arc::new(client))
}

/// `Ok(false)` when the object already existed, which happens when another session created it
/// after our lookup.
fn created_unless_duplicate<T>(res: Result<T, tokio_postgres::Error>) -> Result<bool, BackendError> {
    match res {
        Ok(_) => Ok(true),
        Err(e) if e.code() == Some(&SqlState::DUPLICATE_OBJECT) => {
            debug!(error = %e, "object already exists");
            Ok(false)
        }
        Err(e) => Err(backend_error(e)),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_table(table: &str) -> String {
    table
        .split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

fn table_list(tables: &BTreeSet<String>) -> String {
    tables
        .iter()
        .map(|t| quote_table(t))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug)]
pub struct PgReplicationAdmin {
    client: Arc<Client>,
}

impl PgReplicationAdmin {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReplicationAdmin for PgReplicationAdmin {
    async fn wal_level(&self) -> Result<String, BackendError> {
        let row = self
            .client
            .query_one("SHOW wal_level", &[])
            .await
            .map_err(backend_error)?;
        row.try_get(0).map_err(backend_error)
    }

    async fn has_replication_privilege(&self) -> Result<bool, BackendError> {
        let row = self
            .client
            .query_one(
                "SELECT rolreplication OR rolsuper FROM pg_roles WHERE rolname = current_user",
                &[],
            )
            .await
            .map_err(backend_error)?;
        row.try_get(0).map_err(backend_error)
    }

    async fn slot_plugin(&self, slot: &str) -> Result<Option<String>, BackendError> {
        self.client
            .query_opt(
                "SELECT plugin::text FROM pg_replication_slots WHERE slot_name = $1::text",
                &[&slot],
            )
            .await
            .map_err(backend_error)?
            .map(|row| row.try_get(0).map_err(backend_error))
            .transpose()
    }

    async fn create_slot(&self, slot: &str, plugin: &str) -> Result<bool, BackendError> {
        let res = self
            .client
            .execute(
                "SELECT pg_create_logical_replication_slot($1::text, $2::text)",
                &[&slot, &plugin],
            )
            .await;
        created_unless_duplicate(res)
    }

    async fn publication_tables(
        &self,
        publication: &str,
    ) -> Result<Option<BTreeSet<String>>, BackendError> {
        let exists = self
            .client
            .query_opt(
                "SELECT 1 FROM pg_publication WHERE pubname = $1::text",
                &[&publication],
            )
            .await
            .map_err(backend_error)?;
        if exists.is_none() {
            return Ok(None);
        }

        let rows = self
            .client
            .query(
                "SELECT schemaname::text || '.' || tablename::text \
                 FROM pg_publication_tables WHERE pubname = $1::text",
                &[&publication],
            )
            .await
            .map_err(backend_error)?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(backend_error))
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Some)
    }

    async fn create_publication(
        &self,
        publication: &str,
        tables: &BTreeSet<String>,
    ) -> Result<bool, BackendError> {
        let sql = format!(
            "CREATE PUBLICATION {} FOR TABLE {}",
            quote_ident(publication),
            table_list(tables)
        );
        created_unless_duplicate(self.client.batch_execute(&sql).await)
    }

    async fn set_publication_tables(
        &self,
        publication: &str,
        tables: &BTreeSet<String>,
    ) -> Result<(), BackendError> {
        let sql = format!(
            "ALTER PUBLICATION {} SET TABLE {}",
            quote_ident(publication),
            table_list(tables)
        );
        self.client.batch_execute(&sql).await.map_err(backend_error)
    }
}

/// [`ChangeFeed`] over a logical replication slot.
///
/// Polling peeks at the slot without consuming it. Acknowledging advances the slot, which lets
/// the server recycle WAL up to that point.
#[derive(Debug)]
pub struct PgChangeFeed {
    client: Arc<Client>,
    slot: String,
    publication: String,
}

impl PgChangeFeed {
    pub fn new(client: Arc<Client>, slot: impl Into<String>, publication: impl Into<String>) -> Self {
        Self {
            client,
            slot: slot.into(),
            publication: publication.into(),
        }
    }

    async fn peek(&self, limit: i32) -> Result<Vec<(u64, Vec<u8>)>, BackendError> {
        let rows = self
            .client
            .query(
                "SELECT lsn::text, data FROM pg_logical_slot_peek_binary_changes(\
                 $1::text, NULL, $2::int4, 'proto_version', '1', 'publication_names', $3::text)",
                &[&self.slot, &limit, &self.publication],
            )
            .await
            .map_err(backend_error)?;

        rows.iter()
            .map(|row| {
                let lsn: String = row.try_get(0).map_err(backend_error)?;
                let lsn = SourceSequence::lsn_value(&lsn).map_err(BackendError::permanent)?;
                let data: Vec<u8> = row.try_get(1).map_err(backend_error)?;
                Ok((lsn, data))
            })
            .collect()
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    fn source(&self) -> Source {
        Source::Relational
    }

    async fn poll(&self, max_changes: usize) -> Result<Vec<RawChange>, BackendError> {
        let mut limit = i32::try_from(max_changes).unwrap_or(i32::MAX).max(1);

        loop {
            let messages = self.peek(limit).await?;
            let exhausted = messages.len() < limit as usize;

            // relation messages are re-sent in every decoding session, so each peek decodes
            // with a fresh buffer
            let mut buffer = TransactionBuffer::new();
            let mut changes = vec![];
            for (lsn, data) in &messages {
                if let Some(txn) = buffer
                    .push(*lsn, data)
                    .map_err(BackendError::permanent)?
                {
                    changes.extend(txn);
                }
            }

            // a transaction larger than the window: widen it until it commits
            if changes.is_empty() && !exhausted && limit < MAX_PEEK_CHANGES {
                limit = limit.saturating_mul(2).min(MAX_PEEK_CHANGES);
                debug!(slot = %self.slot, limit, "no complete transaction in peek window, widening");
                continue;
            }

            return Ok(changes);
        }
    }

    async fn acknowledge(&self, cursor: &str) -> Result<(), BackendError> {
        self.client
            .execute(
                "SELECT pg_replication_slot_advance($1::text, ($2::text)::pg_lsn)",
                &[&self.slot, &cursor],
            )
            .await
            .map_err(backend_error)?;
        Ok(())
    }
}
