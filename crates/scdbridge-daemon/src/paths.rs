//! Resolution of the files the bridge works with.

use std::path::PathBuf;

use scdbridge_core::config::{Config, GpgConfConfig};
use scdbridge_core::host::{GpgConf, PathTranslator, QueryError, decode_gpgconf_path};
use tracing::debug;

/// Log file written next to the local GnuPG home when verbose.
pub const VERBOSE_LOG_FILENAME: &str = "scdaemon-bridge.log";

/// Locations resolved at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgePaths {
    /// Host agent executable, translated to a local path.
    pub agent_binary: PathBuf,
    /// Descriptor published by the host agent.
    pub host_socket: PathBuf,
    /// Descriptor this bridge publishes for local clients.
    pub local_socket: PathBuf,
}

impl BridgePaths {
    /// Resolve all paths, querying gpgconf for anything not configured.
    pub async fn resolve(config: &Config) -> Result<Self, QueryError> {
        let host = GpgConf::new(&config.gpgconf.host);
        let translator = host_translator(&config.gpgconf);

        let agent_binary = match &config.agent.binary {
            Some(path) => path.clone(),
            None => {
                let raw = host.resolve_binary(&config.agent.component).await?;
                translator.translate(&decode_gpgconf_path(&raw)).await?
            }
        };

        let host_dir = match &config.socket.host_dir {
            Some(dir) => dir.clone(),
            None => {
                let raw = host.resolve_directory("socketdir").await?;
                translator.translate(&decode_gpgconf_path(&raw)).await?
            }
        };

        let local_dir = match &config.socket.local_dir {
            Some(dir) => dir.clone(),
            None => {
                GpgConf::new(&config.gpgconf.local)
                    .local_directory("socketdir")
                    .await?
            }
        };

        let paths = Self {
            agent_binary,
            host_socket: host_dir.join(&config.socket.filename),
            local_socket: local_dir.join(&config.socket.filename),
        };
        debug!(?paths, "Resolved bridge paths");
        Ok(paths)
    }
}

/// Translator for paths reported by the host gpgconf.
///
/// An empty `wslpath` means both sides share one filesystem namespace.
pub fn host_translator(config: &GpgConfConfig) -> PathTranslator {
    if config.wslpath.is_empty() {
        PathTranslator::Identity
    } else {
        PathTranslator::wsl(&config.wslpath)
    }
}

/// `<local gnupg homedir>/scdaemon-bridge.log`.
pub async fn default_log_file(config: &GpgConfConfig) -> Result<PathBuf, QueryError> {
    let home = GpgConf::new(&config.local).local_directory("homedir").await?;
    Ok(home.join(VERBOSE_LOG_FILENAME))
}
