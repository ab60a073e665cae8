//! Error types for the `scdbridge` core library.
//!
//! Each component reports its own error type (`DescriptorError`,
//! `ListenerError`, `DialError`, `SupervisorError`, `QueryError`); this one
//! covers configuration loading.

use thiserror::Error;

/// Result type alias using the core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Merged settings do not form a valid configuration
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
