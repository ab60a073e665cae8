//! Shared tracing/logging initialization.
//!
//! Both `scdaemon-bridge` and `scdaemon-relay` set up `tracing_subscriber`
//! with an env-filter and optional JSON output. Stdout is never a sink:
//! in foreground mode it carries the relayed Assuan stream.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Where log lines are written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LogSink {
    #[default]
    Stderr,
    /// Append to a file, created if missing.
    File(PathBuf),
}

impl LogSink {
    /// Pick the file sink when a path is given, stderr otherwise.
    pub fn from_path(path: Option<PathBuf>) -> Self {
        path.map_or(Self::Stderr, Self::File)
    }

    fn make_writer(&self) -> std::io::Result<(BoxMakeWriter, bool)> {
        match self {
            Self::Stderr => Ok((BoxMakeWriter::new(std::io::stderr), true)),
            Self::File(path) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok((BoxMakeWriter::new(Mutex::new(file)), false))
            }
        }
    }
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"scdbridge_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
/// * `sink` -- stderr or an append-mode log file.
pub fn init_tracing(default_filter: &str, log_json: bool, sink: &LogSink) -> std::io::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let (writer, ansi) = sink.make_writer()?;
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi),
            )
            .init();
    }
    Ok(())
}
