//! List where the consumers of a group resume.

use std::fmt::Write;

use bronze_checkpoint::CheckpointError;
use bronze_clap_blocks::{
    capture::StateConfig,
    object_store::{ObjectStoreConfig, ParseError},
    retry::RetryConfig,
};
use bronze_types::ConsumerCheckpoint;

use super::common::Stores;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("Cannot parse object store config: {0}")]
    ObjectStoreParsing(#[from] ParseError),

    #[error("Cannot list checkpoints: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Cannot encode checkpoints: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum Format {
    Pretty,
    Json,
}

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    object_store_config: ObjectStoreConfig,

    #[clap(flatten)]
    state_config: StateConfig,

    #[clap(flatten)]
    retry_config: RetryConfig,

    /// The format in which to output the checkpoints
    #[clap(value_enum, long = "format", default_value = "pretty")]
    output_format: Format,
}

pub(crate) async fn command(config: Config) -> Result<(), Error> {
    let object_store = config.object_store_config.make_object_store()?;
    let stores = Stores::new(
        object_store,
        &config.state_config,
        config.retry_config.backoff(),
    );

    let checkpoints = stores
        .checkpoints
        .list(&config.state_config.consumer_group)
        .await?;

    let output = match config.output_format {
        Format::Pretty => pretty(&checkpoints),
        Format::Json => serde_json::to_string_pretty(&checkpoints)?,
    };
    println!("{output}");
    Ok(())
}

fn pretty(checkpoints: &[ConsumerCheckpoint]) -> String {
    if checkpoints.is_empty() {
        return "no checkpoints committed".to_string();
    }

    let mut out = format!(
        "{:<12} {:>9} {:>12} {:>12}  {}\n",
        "source", "partition", "position", "resume_from", "updated_at"
    );
    for c in checkpoints {
        let _ = writeln!(
            out,
            "{:<12} {:>9} {:>12} {:>12}  {}",
            c.source.as_str(),
            c.partition_id.get(),
            c.position.get(),
            c.resume_from().get(),
            c.updated_at.to_rfc3339(),
        );
    }
    out.pop();
    out
}

#[cfg(test)]
mod tests {
    use bronze_types::{PartitionId, Position, Source};
    use clap::Parser;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn checkpoints_are_tabulated() {
        let updated_at = "2024-03-07T10:00:00Z".parse().unwrap();
        let checkpoints = [
            ConsumerCheckpoint {
                consumer_group: "$Default".to_string(),
                source: Source::Relational,
                partition_id: PartitionId::new(0),
                position: Position::new(41),
                updated_at,
            },
            ConsumerCheckpoint {
                consumer_group: "$Default".to_string(),
                source: Source::Document,
                partition_id: PartitionId::new(3),
                position: Position::new(7),
                updated_at,
            },
        ];

        assert_eq!(
            pretty(&checkpoints),
            "source       partition     position  resume_from  updated_at\n\
             relational           0           41           42  2024-03-07T10:00:00+00:00\n\
             document             3            7            8  2024-03-07T10:00:00+00:00"
        );
        assert_eq!(pretty(&[]), "no checkpoints committed");
    }

    #[test_log::test(tokio::test)]
    async fn empty_store_lists_nothing() {
        let config = Config::try_parse_from(["checkpoints", "--format", "json"]).unwrap();
        assert_eq!(config.output_format, Format::Json);
        command(config).await.unwrap();
    }
}
