//! Entrypoint of the bronze binary

use bronze_clap_blocks::tokio::TokioIoConfig;
use dotenvy::dotenv;
use trogging::{
    TroggingGuard,
    cli::LoggingConfigBuilderExt,
    tracing_subscriber::{Registry, prelude::*},
};

mod commands {
    pub(crate) mod checkpoints;
    pub(crate) mod common;
    pub(crate) mod publish;
    pub(crate) mod run;
    pub(crate) mod setup;
}
mod http;

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "bronze",
    version,
    disable_help_flag = true,
    arg(
        clap::Arg::new("help")
            .short('h')
            .long("help")
            .help("Print help information")
            .action(clap::ArgAction::Help)
            .global(true)
    ),
    about = "Change data capture into the bronze layer of a data lake",
    long_about = r#"Change data capture into the bronze layer of a data lake

Changes of a relational and a document database are relayed into durable channels, normalized
into one event shape and written to the lake as one JSON object per change.

Examples:
    # Prepare both sources for capture
    bronze setup --postgres-url "host=db user=bronze dbname=app" --relational-entities users,orders \
        --mongo-uri mongodb://mongo:27017 --mongo-database app --document-entities profiles

    # Run the relays and consumers, writing the lake to a local directory
    bronze run --relay --object-store file --lake-dir ~/.bronze/lake \
        --channel file --channel-dir ~/.bronze/channels

    # Append raw change envelopes from a file to the relational channel
    bronze publish --source relational --file changes.jsonl --channel file --channel-dir ~/.bronze/channels

    # Show where every partition resumes
    bronze checkpoints --object-store file --lake-dir ~/.bronze/lake

    # Run with full debug logging specified with LOG_FILTER
    LOG_FILTER=debug bronze run
"#
)]
struct Config {
    #[clap(flatten)]
    runtime_config: TokioIoConfig,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, clap::Parser)]
enum Command {
    /// Run the capture relays and the per-source consumers
    Run(commands::run::Config),

    /// Enable change capture on the configured sources
    Setup(commands::setup::Config),

    /// Append raw change envelopes to a source channel
    Publish(commands::publish::Config),

    /// List the committed consumer checkpoints
    Checkpoints(commands::checkpoints::Config),
}

fn main() -> Result<(), std::io::Error> {
    #[cfg(unix)]
    install_crash_handler(); // attempt to render a useful stacktrace to stderr

    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    let tokio_runtime = config.runtime_config.builder()?.build()?;

    tokio_runtime.block_on(async move {
        fn handle_init_logs(r: Result<TroggingGuard, trogging::Error>) -> TroggingGuard {
            match r {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("Initializing logs failed: {e}");
                    std::process::exit(ReturnCode::Failure as _);
                }
            }
        }

        match config.command {
            None => println!("command required, -h/--help for help"),
            Some(Command::Run(config)) => {
                let _tracing_guard =
                    handle_init_logs(init_logs_and_tracing(&config.logging_config));
                if let Err(e) = commands::run::command(config).await {
                    eprintln!("Run command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Setup(config)) => {
                let _tracing_guard =
                    handle_init_logs(init_logs_and_tracing(&config.logging_config));
                if let Err(e) = commands::setup::command(config).await {
                    eprintln!("Setup command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Publish(config)) => {
                let _tracing_guard =
                    handle_init_logs(init_logs_and_tracing(&config.logging_config));
                if let Err(e) = commands::publish::command(config).await {
                    eprintln!("Publish command failed: {e:#}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Checkpoints(config)) => {
                if let Err(e) = commands::checkpoints::command(config).await {
                    eprintln!("Checkpoints command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
        }
    });

    Ok(())
}

/// Source the .env file before initialising the Config struct, so that the file can provide any
/// `BRONZE_*` setting.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // a missing env file is fine, clap applies the defaults
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(1);
        }
    };
}

#[cfg(unix)]
fn install_crash_handler() {
    unsafe {
        set_signal_handler(libc::SIGSEGV, signal_handler); // handle segfaults
        set_signal_handler(libc::SIGILL, signal_handler); // handle stack overflow and unsupported CPUs
        set_signal_handler(libc::SIGBUS, signal_handler); // handle invalid memory access
    }
}

#[cfg(unix)]
unsafe extern "C" fn signal_handler(sig: i32) {
    use backtrace::Backtrace;
    use std::process::abort;
    let name = std::thread::current()
        .name()
        .map(|n| format!(" for thread \"{n}\""))
        .unwrap_or_default();
    eprintln!("Signal {sig}, Stack trace{name}\n{:?}", Backtrace::new());
    abort();
}

#[cfg(unix)]
unsafe fn set_signal_handler(signal: libc::c_int, handler: unsafe extern "C" fn(libc::c_int)) {
    use libc::{sigaction, sigfillset, sighandler_t};

    unsafe {
        let mut sigset = std::mem::zeroed();

        // block all signals while the handler runs
        if sigfillset(&mut sigset) != -1 {
            let mut action: sigaction = std::mem::zeroed();
            action.sa_mask = sigset;
            action.sa_sigaction = handler as sighandler_t;

            sigaction(signal, &action, std::ptr::null_mut());
        }
    }
}

fn init_logs_and_tracing(
    config: &trogging::cli::LoggingConfig,
) -> Result<TroggingGuard, trogging::Error> {
    let log_layer = trogging::Builder::new()
        .with_default_log_filter("info")
        .with_logging_config(config)
        .build()?;

    let subscriber = Registry::default().with(log_layer);
    trogging::install_global(subscriber)
}
