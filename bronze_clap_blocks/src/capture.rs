//! CLI config for the capture sources and the pipeline's durable state.

use std::time::Duration;

use bronze_types::Source;

/// Which entities are captured and where their changes are read from.
#[derive(Debug, Clone, clap::Parser)]
pub struct CaptureConfig {
    /// Comma separated tables to capture. Unqualified names use `--default-schema`.
    #[clap(
        long = "relational-entities",
        env = "BRONZE_RELATIONAL_ENTITIES",
        value_delimiter = ',',
        action
    )]
    pub relational_entities: Vec<String>,

    /// Comma separated collections to capture.
    #[clap(
        long = "document-entities",
        env = "BRONZE_DOCUMENT_ENTITIES",
        value_delimiter = ',',
        action
    )]
    pub document_entities: Vec<String>,

    /// Connection string of the relational source, e.g. `host=db user=bronze dbname=app`.
    #[clap(long = "postgres-url", env = "BRONZE_POSTGRES_URL", action)]
    pub postgres_url: Option<String>,

    /// Logical replication slot changes are read from.
    #[clap(
        long = "replication-slot",
        env = "BRONZE_REPLICATION_SLOT",
        default_value = "bronze_slot",
        action
    )]
    pub replication_slot: String,

    /// Publication scoping the replication slot to the captured tables.
    #[clap(
        long = "publication",
        env = "BRONZE_PUBLICATION",
        default_value = "bronze_pub",
        action
    )]
    pub publication: String,

    /// Schema of unqualified table names.
    #[clap(
        long = "default-schema",
        env = "BRONZE_DEFAULT_SCHEMA",
        default_value = "public",
        action
    )]
    pub default_schema: String,

    /// Connection string of the document source.
    #[clap(long = "mongo-uri", env = "BRONZE_MONGO_URI", action)]
    pub mongo_uri: Option<String>,

    /// Database holding the captured collections.
    #[clap(long = "mongo-database", env = "BRONZE_MONGO_DATABASE", action)]
    pub mongo_database: Option<String>,

    /// Maximum number of changes a capture relay reads per poll.
    #[clap(
        long = "relay-batch-size",
        env = "BRONZE_RELAY_BATCH_SIZE",
        default_value = "500",
        action
    )]
    pub relay_batch_size: usize,

    /// How long a capture relay sleeps after a poll returned nothing.
    #[clap(
        long = "relay-idle-interval",
        env = "BRONZE_RELAY_IDLE_INTERVAL",
        default_value = "1s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub relay_idle_interval: Duration,
}

impl CaptureConfig {
    /// Entity allow-list of `source`.
    pub fn entities(&self, source: Source) -> &[String] {
        match source {
            Source::Relational => &self.relational_entities,
            Source::Document => &self.document_entities,
        }
    }
}

/// Consumer group and object store prefixes of checkpoints, cursors and dead letters.
#[derive(Debug, Clone, clap::Parser)]
pub struct StateConfig {
    /// Consumer group whose checkpoints are loaded and committed.
    #[clap(
        long = "consumer-group",
        env = "BRONZE_CONSUMER_GROUP",
        default_value = "$Default",
        action
    )]
    pub consumer_group: String,

    /// Object store prefix of consumer checkpoints.
    #[clap(
        long = "checkpoint-prefix",
        env = "BRONZE_CHECKPOINT_PREFIX",
        default_value = "_checkpoints",
        action
    )]
    pub checkpoint_prefix: String,

    /// Object store prefix of capture relay cursors.
    #[clap(
        long = "cursor-prefix",
        env = "BRONZE_CURSOR_PREFIX",
        default_value = "_cursors",
        action
    )]
    pub cursor_prefix: String,

    /// Object store prefix of dead-letter records.
    #[clap(
        long = "dead-letter-prefix",
        env = "BRONZE_DEAD_LETTER_PREFIX",
        default_value = "_dead_letter",
        action
    )]
    pub dead_letter_prefix: String,
}
