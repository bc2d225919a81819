//! CLI config for the durable channels between capture and consumers.

use std::{num::NonZeroU32, path::PathBuf, sync::Arc, time::Duration};

use bronze_channel::{ChannelError, ChannelReading, ChannelWriting, file::FileChannel, memory::MemoryChannel};
use bronze_types::Source;
use observability_deps::tracing::info;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ChannelConfigError {
    #[snafu(display("--channel-dir / `BRONZE_CHANNEL_DIR` is required for the file channel"))]
    MissingChannelDir,

    #[snafu(display(
        "--kafka-bootstrap-servers / `BRONZE_KAFKA_BOOTSTRAP_SERVERS` is required for the kafka channel"
    ))]
    MissingBootstrapServers,

    #[snafu(display("kafka channel support not enabled, recompile with the kafka feature"))]
    KafkaNotEnabled,

    #[snafu(display("failed to open channel {}: {}", name, source))]
    Open { name: String, source: ChannelError },
}

/// Channel implementation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub enum ChannelType {
    /// Process-local, lost on exit. Publisher and consumers must run in the same process.
    Memory,

    /// Append-only partition logs in a local directory.
    File,

    /// Kafka (or Event Hubs through its Kafka endpoint) topics.
    Kafka,
}

/// Both ends of one source channel.
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub reader: Arc<dyn ChannelReading>,
    pub writer: Arc<dyn ChannelWriting>,
}

#[derive(Debug, Clone, clap::Parser)]
pub struct ChannelConfig {
    /// Which channel implementation carries raw change events.
    #[clap(
        value_enum,
        long = "channel",
        env = "BRONZE_CHANNEL",
        ignore_case = true,
        default_value = "memory",
        action
    )]
    pub channel_type: ChannelType,

    /// Root directory of file channels.
    #[clap(long = "channel-dir", env = "BRONZE_CHANNEL_DIR", action)]
    pub channel_dir: Option<PathBuf>,

    /// Comma separated Kafka bootstrap servers.
    #[clap(
        long = "kafka-bootstrap-servers",
        env = "BRONZE_KAFKA_BOOTSTRAP_SERVERS",
        action
    )]
    pub kafka_bootstrap_servers: Option<String>,

    /// Partitions of memory and file channels. Kafka topics bring their own partitioning.
    #[clap(
        long = "channel-partitions",
        env = "BRONZE_CHANNEL_PARTITIONS",
        default_value = "4",
        action
    )]
    pub partitions: NonZeroU32,

    /// How often file channel readers look for new records.
    #[clap(
        long = "channel-poll-interval",
        env = "BRONZE_CHANNEL_POLL_INTERVAL",
        default_value = "100ms",
        value_parser = humantime::parse_duration,
        action
    )]
    pub poll_interval: Duration,

    /// How long a Kafka append may wait for acknowledgement.
    #[clap(
        long = "kafka-send-timeout",
        env = "BRONZE_KAFKA_SEND_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub kafka_send_timeout: Duration,

    /// Channel carrying relational changes.
    #[clap(
        long = "relational-channel",
        env = "BRONZE_RELATIONAL_CHANNEL",
        default_value = "postgresql-changes",
        action
    )]
    pub relational_channel: String,

    /// Channel carrying document changes.
    #[clap(
        long = "document-channel",
        env = "BRONZE_DOCUMENT_CHANNEL",
        default_value = "mongodb-changes",
        action
    )]
    pub document_channel: String,
}

impl ChannelConfig {
    pub fn channel_name(&self, source: Source) -> &str {
        match source {
            Source::Relational => &self.relational_channel,
            Source::Document => &self.document_channel,
        }
    }

    /// Open the channel of `source`.
    ///
    /// `consumer_group` names the Kafka consumer group; other channel types ignore it.
    pub async fn make_channel(
        &self,
        source: Source,
        consumer_group: &str,
    ) -> Result<Channel, ChannelConfigError> {
        let name = self.channel_name(source).to_string();
        info!(%source, channel = %name, channel_type = ?self.channel_type, "opening channel");

        match self.channel_type {
            ChannelType::Memory => {
                let channel = MemoryChannel::new(self.partitions);
                Ok(Channel {
                    name,
                    reader: Arc::new(channel.clone()),
                    writer: Arc::new(channel),
                })
            }
            ChannelType::File => {
                let dir = self.channel_dir.as_ref().ok_or(ChannelConfigError::MissingChannelDir)?;
                let channel = FileChannel::open(dir, &name, self.partitions, self.poll_interval)
                    .await
                    .context(OpenSnafu { name: name.clone() })?;
                Ok(Channel {
                    name,
                    reader: Arc::new(channel.clone()),
                    writer: Arc::new(channel),
                })
            }
            ChannelType::Kafka => self.make_kafka(name, consumer_group).await,
        }
    }

    #[cfg(feature = "kafka")]
    async fn make_kafka(
        &self,
        name: String,
        consumer_group: &str,
    ) -> Result<Channel, ChannelConfigError> {
        use bronze_channel::kafka::{KafkaChannelReader, KafkaChannelWriter};

        let servers = self
            .kafka_bootstrap_servers
            .as_deref()
            .ok_or(ChannelConfigError::MissingBootstrapServers)?;

        let writer = KafkaChannelWriter::new(servers, name.as_str(), self.kafka_send_timeout)
            .await
            .context(OpenSnafu { name: name.clone() })?;
        let reader = KafkaChannelReader::new(servers, name.as_str(), consumer_group)
            .await
            .context(OpenSnafu { name: name.clone() })?;

        Ok(Channel {
            name,
            reader: Arc::new(reader),
            writer: Arc::new(writer),
        })
    }

    #[cfg(not(feature = "kafka"))]
    async fn make_kafka(
        &self,
        _name: String,
        _consumer_group: &str,
    ) -> Result<Channel, ChannelConfigError> {
        if self.kafka_bootstrap_servers.is_none() {
            return Err(ChannelConfigError::MissingBootstrapServers);
        }
        Err(ChannelConfigError::KafkaNotEnabled)
    }
}
