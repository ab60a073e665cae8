//! Lookups against the surrounding system: gpgconf queries, path
//! translation between the guest and host filesystems, and the host's
//! network address.

pub mod gpgconf;
pub mod path;
pub mod resolv;

use std::path::PathBuf;
use std::process::ExitStatus;

use tokio::process::Command;
use tracing::debug;

pub use gpgconf::GpgConf;
pub use path::{PathTranslator, decode_gpgconf_path};
pub use resolv::{parse_nameserver, resolve_host_address};

/// Errors from host lookups.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Failed to execute {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed ({status}): {stderr}")]
    Command {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("{program} did not report {key}")]
    KeyNotFound { program: String, key: String },

    #[error("Failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No nameserver entry in {path}")]
    NoNameserver { path: PathBuf },
}

/// Run `program` and capture its stdout.
pub(crate) async fn run_output(program: &str, args: &[&str]) -> Result<String, QueryError> {
    debug!("exec (capture): {program} {}", args.join(" "));

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| QueryError::Exec {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(QueryError::Command {
            program: program.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
