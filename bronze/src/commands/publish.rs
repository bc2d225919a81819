//! Append raw change envelopes, one JSON document per line, to the channel of a source.
//!
//! Events are keyed by their entity like the capture relays key them, so the changes of one
//! table or collection keep their order. Lines that cannot be normalized are published anyway;
//! the consumer dead-letters them.

use std::path::PathBuf;

use anyhow::{Context, bail};
use bronze_clap_blocks::{
    capture::StateConfig,
    channel::{ChannelConfig, ChannelType},
    retry::RetryConfig,
};
use bronze_extract::ChangePublisher;
use bronze_normalize::normalize;
use bronze_types::Source;
use bytes::Bytes;
use observability_deps::tracing::{debug, info, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use trogging::cli::LoggingConfig;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    #[clap(flatten)]
    channel_config: ChannelConfig,

    #[clap(flatten)]
    state_config: StateConfig,

    #[clap(flatten)]
    retry_config: RetryConfig,

    /// Source whose channel receives the events.
    #[clap(long = "source", action)]
    source: Source,

    /// File of raw change envelopes, one per line.
    #[clap(short = 'f', long = "file", action)]
    file: PathBuf,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Summary {
    published: usize,
    unnormalizable: usize,
}

pub(crate) async fn command(config: Config) -> anyhow::Result<()> {
    if config.channel_config.channel_type == ChannelType::Memory {
        bail!("memory channels do not outlive this command, use --channel file or kafka");
    }

    let channel = config
        .channel_config
        .make_channel(config.source, &config.state_config.consumer_group)
        .await
        .context("opening channel")?;
    let metrics = metric::Registry::default();
    let publisher = ChangePublisher::new(
        [(channel.name.clone(), channel.writer)],
        config.retry_config.backoff(),
        &metrics,
    );

    let file = tokio::fs::File::open(&config.file)
        .await
        .with_context(|| format!("opening {}", config.file.display()))?;
    let summary = publish_lines(
        &publisher,
        &channel.name,
        config.source,
        BufReader::new(file),
    )
    .await?;

    info!(
        channel = %channel.name,
        published = summary.published,
        unnormalizable = summary.unnormalizable,
        "publish complete"
    );
    println!(
        "published {} events to {} ({} will be dead-lettered)",
        summary.published, channel.name, summary.unnormalizable
    );
    Ok(())
}

async fn publish_lines<R>(
    publisher: &ChangePublisher,
    channel: &str,
    source: Source,
    reader: R,
) -> anyhow::Result<Summary>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut summary = Summary::default();
    let mut lines = reader.lines();
    let mut line_number = 0;

    while let Some(line) = lines.next_line().await.context("reading input")? {
        line_number += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let raw = Bytes::copy_from_slice(line.as_bytes());
        let key = match normalize(source, &raw) {
            Ok(event) => event.entity,
            Err(e) => {
                warn!(line_number, error = %e, "event cannot be normalized");
                summary.unnormalizable += 1;
                String::new()
            }
        };

        let meta = publisher
            .publish_keyed(channel, key.as_bytes(), raw)
            .await
            .with_context(|| format!("publishing line {line_number}"))?;
        debug!(line_number, partition = %meta.partition, position = %meta.position, "published");
        summary.published += 1;
    }

    Ok(summary)
}
