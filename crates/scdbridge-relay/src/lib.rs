//! scdbridge Relay Library
//!
//! Host side of the bridge: connects this process's stdin/stdout to the
//! local scdaemon through its socket descriptor.

use std::path::PathBuf;

use anyhow::Context;
use scdbridge_core::assuan::AssuanDialer;
use scdbridge_core::config::Config;
use scdbridge_core::host::{GpgConf, QueryError};
use scdbridge_core::relay::{Endpoint, RelayOutcome, RelaySession};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Path of the scdaemon socket descriptor on this machine.
pub async fn locate_descriptor(config: &Config) -> Result<PathBuf, QueryError> {
    let dir = match &config.socket.local_dir {
        Some(dir) => dir.clone(),
        None => {
            GpgConf::new(&config.gpgconf.local)
                .local_directory("socketdir")
                .await?
        }
    };
    Ok(dir.join(&config.socket.filename))
}

/// Relay `client` to the local scdaemon until either side ends or `scope`
/// is cancelled.
pub async fn run_stdio_relay(
    config: &Config,
    client: Endpoint,
    scope: &CancellationToken,
) -> anyhow::Result<RelayOutcome> {
    let path = locate_descriptor(config)
        .await
        .context("Failed to get socketdir from gpgconf")?;
    debug!(socket = %path.display(), "Starting scdaemon relay");

    let server = AssuanDialer::localhost(&config.network)
        .dial_file(&path)
        .await
        .context("Error opening TCP connection to assuan server")?;

    Ok(RelaySession::new(client, Endpoint::from(server))
        .run(scope)
        .await)
}
