//! Configuration resolution for scdbridge.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/scdbridge/settings.json`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`SCDBRIDGE_*`)
//! 5. CLI arguments (highest priority, applied by the binaries)
//!
//! The resolved value is built once at startup and handed to each
//! component's constructor by reference.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Well-known file name of the scdaemon socket descriptor.
pub const SCDAEMON_SOCKET_FILENAME: &str = "S.scdaemon";

/// Complete scdbridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub gpgconf: GpgConfConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// The supervised agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Explicit agent binary; resolved through the host gpgconf when unset.
    pub binary: Option<PathBuf>,
    /// gpgconf component name of the agent.
    pub component: String,
    pub args: Vec<String>,
    /// Run the agent with `--debug-level guru` and forward its output to the log.
    pub verbose: bool,
    /// Seconds to wait after the interrupt signal before force-killing.
    /// Zero disables escalation.
    pub terminate_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: None,
            component: "scdaemon".to_string(),
            args: vec!["--daemon".to_string()],
            verbose: false,
            terminate_timeout_secs: 5,
        }
    }
}

impl AgentConfig {
    /// Arguments passed to the agent, including verbosity flags.
    pub fn effective_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if self.verbose {
            args.extend(["--debug-level".to_string(), "guru".to_string()]);
        }
        args
    }

    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

/// Configuration-query tools on both sides of the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpgConfConfig {
    /// gpgconf of the side this process runs on.
    pub local: String,
    /// gpgconf of the host side, reached through interop.
    pub host: String,
    /// Path translation tool for host paths.
    pub wslpath: String,
}

impl Default for GpgConfConfig {
    fn default() -> Self {
        Self {
            local: "gpgconf".to_string(),
            host: "gpgconf.exe".to_string(),
            wslpath: "wslpath".to_string(),
        }
    }
}

/// Socket descriptor locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub filename: String,
    /// Local socket directory; `gpgconf --list-dirs socketdir` when unset.
    pub local_dir: Option<PathBuf>,
    /// Host socket directory (already translated); resolved via the host gpgconf when unset.
    pub host_dir: Option<PathBuf>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            filename: SCDAEMON_SOCKET_FILENAME.to_string(),
            local_dir: None,
            host_dir: None,
        }
    }
}

/// Handshake, dial and host discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host address of the agent; discovered from `resolv_conf` when unset.
    pub host_address: Option<String>,
    pub resolv_conf: PathBuf,
    /// Deadline for a client to present its nonce.
    pub handshake_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// How long to wait for the agent to publish its descriptor.
    pub descriptor_wait_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host_address: None,
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            handshake_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            descriptor_wait_ms: 10_000,
        }
    }
}

impl NetworkConfig {
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub const fn descriptor_wait(&self) -> Duration {
        Duration::from_millis(self.descriptor_wait_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let global = global_config_path().filter(|path| path.exists());
    let mut config = load_layers(global.as_deref().into_iter().chain(explicit))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("scdbridge").join("settings.json"))
}

/// Stack settings files in order; later files only override the keys they set.
fn load_layers<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Result<Config> {
    let mut merged = Value::Object(serde_json::Map::new());
    for path in paths {
        merge_value(&mut merged, load_config_file(path)?);
    }
    Ok(serde_json::from_value(merged)?)
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    // Validate each file on its own so errors name the offending path
    serde_json::from_value::<Config>(value.clone()).map_err(|e| {
        Error::Config(format!("Invalid config file {}: {}", path.display(), e))
    })?;
    Ok(value)
}

/// Deep-merge `overlay` into `base`. Objects merge key by key; any other
/// overlay value, `null` included, replaces the base value.
fn merge_value(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config, env: impl Fn(&str) -> Option<String>) {
    if let Some(val) = env("SCDBRIDGE_HOST_ADDRESS") {
        config.network.host_address = Some(val);
    }
    if let Some(n) = env("SCDBRIDGE_HANDSHAKE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.network.handshake_timeout_ms = n;
    }
    if let Some(n) = env("SCDBRIDGE_CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.network.connect_timeout_ms = n;
    }
    if let Some(n) = env("SCDBRIDGE_TERMINATE_TIMEOUT").and_then(|v| v.parse().ok()) {
        config.agent.terminate_timeout_secs = n;
    }
    if let Some(val) = env("SCDBRIDGE_GPGCONF") {
        config.gpgconf.local = val;
    }
    if let Some(val) = env("SCDBRIDGE_HOST_GPGCONF") {
        config.gpgconf.host = val;
    }
    if let Some(val) = env("SCDBRIDGE_LOG_LEVEL") {
        config.log.level = val;
    }
    if let Some(val) = env("SCDBRIDGE_LOG_FILE") {
        config.log.file = Some(PathBuf::from(val));
    }
}
