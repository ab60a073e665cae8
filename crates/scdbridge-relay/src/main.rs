//! `scdaemon-relay`
//!
//! Runs next to the real scdaemon and forwards stdin/stdout to it. Logs go
//! to stderr or a file; stdout carries the Assuan stream.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use scdbridge_core::config::load_config;
use scdbridge_core::relay::Endpoint;
use scdbridge_core::tracing_init::{LogSink, init_tracing};
use scdbridge_relay::run_stdio_relay;

#[derive(Parser, Debug)]
#[command(name = "scdaemon-relay")]
#[command(version, about = "scdaemon relay - connects stdin/stdout to the local scdaemon")]
struct Args {
    /// Settings file layered over the global one
    #[arg(long, env = "SCDBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, env = "SCDBRIDGE_VERBOSE")]
    verbose: bool,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "SCDBRIDGE_LOG_JSON")]
    log_json: bool,

    /// Log file (stderr when unset)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(args));
    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "scdaemon-relay failed");
    }
    // A stdin read parked on the blocking pool must not hold up exit
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    config.log.json |= args.log_json;
    if args.log_file.is_some() {
        config.log.file = args.log_file;
    }

    let level = if args.verbose {
        "debug"
    } else {
        config.log.level.as_str()
    };
    let log_filter = format!("scdbridge_relay={level},scdbridge_core={level}");
    init_tracing(
        &log_filter,
        config.log.json,
        &LogSink::from_path(config.log.file.clone()),
    )?;

    let scope = CancellationToken::new();
    let interrupt = scope.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C shutdown signal");
            interrupt.cancel();
        }
    });

    let outcome = run_stdio_relay(&config, Endpoint::stdio(), &scope).await?;
    info!(closed_by = ?outcome.closed_by, "Relay finished");
    Ok(())
}
