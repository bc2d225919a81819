//! Enable change capture on the configured sources and report what was prepared.

use bronze_clap_blocks::{capture::CaptureConfig, retry::RetryConfig};
use bronze_extract::{CaptureHandle, ExtractorError};
use bronze_types::Source;
use observability_deps::tracing::info;
use trogging::cli::LoggingConfig;

use super::common::{ConnectError, connect_source};

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("failed to enable capture on the {origin} source: {error}")]
    Capture {
        origin: Source,
        error: ExtractorError,
    },

    #[error("no source database configured, set --postgres-url or --mongo-uri")]
    NothingConfigured,
}

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    #[clap(flatten)]
    capture_config: CaptureConfig,

    #[clap(flatten)]
    retry_config: RetryConfig,
}

pub(crate) async fn command(config: Config) -> Result<(), Error> {
    let backoff = config.retry_config.backoff();

    let mut handles = vec![];
    for source in Source::ALL {
        let Some(connected) = connect_source(source, &config.capture_config, backoff).await? else {
            continue;
        };

        let entities = config.capture_config.entities(source);
        let handle = connected
            .extractor
            .enable_capture(entities)
            .await
            .map_err(|error| Error::Capture {
                origin: source,
                error,
            })?;
        info!(%source, resource = %handle.resource, changed = handle.changed, "capture enabled");
        handles.push(handle);
    }

    if handles.is_empty() {
        return Err(Error::NothingConfigured);
    }

    for handle in &handles {
        println!("{}", describe(handle));
    }
    Ok(())
}

fn describe(handle: &CaptureHandle) -> String {
    let entities = handle
        .entities
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    let state = if handle.changed { "enabled" } else { "unchanged" };
    format!(
        "{}: capture {state} on {} for {entities}",
        handle.source, handle.resource
    )
}
