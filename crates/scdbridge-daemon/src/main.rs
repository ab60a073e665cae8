//! `scdaemon-bridge`
//!
//! Stands in for scdaemon on the guest: starts the real scdaemon on the
//! host and relays local clients to it over loopback TCP.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use scdbridge_core::config::load_config;
use scdbridge_core::relay::Endpoint;
use scdbridge_core::tracing_init::{LogSink, init_tracing};
use scdbridge_daemon::bridge::{Bridge, Mode};
use scdbridge_daemon::paths::{BridgePaths, default_log_file};
use scdbridge_daemon::shutdown::shutdown_signal;

#[derive(Parser, Debug)]
#[command(name = "scdaemon-bridge")]
#[command(version, about = "scdaemon bridge - relays a host smartcard daemon to local clients")]
struct Args {
    /// Serve one client over stdin/stdout (foreground)
    #[arg(long)]
    server: bool,

    /// Publish a loopback socket for local clients (default)
    #[arg(long)]
    daemon: bool,

    /// Serve stdin/stdout and publish the loopback socket
    #[arg(long, alias = "multiserver")]
    multi_server: bool,

    /// Settings file layered over the global one
    #[arg(long, env = "SCDBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging to `<gnupg homedir>/scdaemon-bridge.log` and a
    /// verbose agent
    #[arg(short, long, env = "SCDBRIDGE_VERBOSE")]
    verbose: bool,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "SCDBRIDGE_LOG_JSON")]
    log_json: bool,

    /// Log file (stderr when unset)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Host address of the agent, instead of the resolv.conf nameserver
    #[arg(long)]
    host: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(args));
    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "scdaemon-bridge failed");
    }
    // A stdin read parked on the blocking pool must not hold up exit
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    config.agent.verbose |= args.verbose;
    config.log.json |= args.log_json;
    if args.log_file.is_some() {
        config.log.file = args.log_file;
    }
    if args.host.is_some() {
        config.network.host_address = args.host;
    }

    let mut log_file_error = None;
    if config.agent.verbose && config.log.file.is_none() {
        match default_log_file(&config.gpgconf).await {
            Ok(path) => config.log.file = Some(path),
            Err(e) => log_file_error = Some(e),
        }
    }

    let level = if config.agent.verbose {
        "debug"
    } else {
        config.log.level.as_str()
    };
    let log_filter = format!("scdbridge_daemon={level},scdbridge_core={level}");
    init_tracing(
        &log_filter,
        config.log.json,
        &LogSink::from_path(config.log.file.clone()),
    )
    .context("Unable to open log file")?;
    if let Some(e) = log_file_error {
        warn!(error = %e, "No gnupg homedir for the log file, logging to stderr");
    }

    let mode = Mode::from_flags(args.server, args.daemon, args.multi_server);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        ?mode,
        "Starting scdaemon-bridge"
    );

    let paths = BridgePaths::resolve(&config)
        .await
        .context("Unable to resolve gpgconf paths")?;
    let shutdown = shutdown_signal()?;
    let bridge = Bridge::start(&config, paths).await?;

    let stdio = mode.serves_stdio().then(Endpoint::stdio);
    bridge
        .run(&config, mode, stdio, async {
            let signal = shutdown.await;
            info!(signal, "Received shutdown signal");
        })
        .await
}
