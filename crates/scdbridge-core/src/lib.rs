//! `scdbridge` Core Library
//!
//! Shared functionality for the scdaemon bridge components:
//! - Assuan socket descriptors and the nonce handshake (listener + dialer)
//! - Byte-transparent, cancellable relay sessions
//! - Supervision of the real agent process
//! - Host collaborators (gpgconf, path translation, host address)
//! - Configuration resolution and tracing setup

pub mod assuan;
pub mod config;
pub mod error;
pub mod host;
pub mod relay;
pub mod supervisor;
pub mod tracing_init;

pub use assuan::{AssuanDialer, AssuanListener, Descriptor, Nonce};
pub use config::Config;
pub use error::{Error, Result};
pub use relay::{RelayOutcome, RelaySession, ResponseFilter};
pub use supervisor::ProcessSupervisor;
