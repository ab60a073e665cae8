//! Client side of the nonce handshake.

use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use super::descriptor::{Descriptor, DescriptorError, read_descriptor};
use crate::config::NetworkConfig;

/// Errors from dialing an Assuan endpoint.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error("Unable to connect to assuan server {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connecting to assuan server {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("Error sending nonce to assuan server {addr}: {source}")]
    HandshakeWrite {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Connects to Assuan endpoints on a fixed host.
#[derive(Debug, Clone)]
pub struct AssuanDialer {
    host: String,
    connect_timeout: Duration,
}

impl AssuanDialer {
    pub fn new(host: impl Into<String>, config: &NetworkConfig) -> Self {
        Self {
            host: host.into(),
            connect_timeout: config.connect_timeout(),
        }
    }

    /// Dialer for endpoints on this machine.
    pub fn localhost(config: &NetworkConfig) -> Self {
        Self::new("localhost", config)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Connect to `descriptor.port` and send the nonce.
    ///
    /// The returned stream is ready to relay; the server sends no
    /// acknowledgement.
    pub async fn dial(&self, descriptor: &Descriptor) -> Result<TcpStream, DialError> {
        let addr = format!("{}:{}", self.host, descriptor.port);
        let mut stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), descriptor.port)),
        )
        .await
        .map_err(|_| DialError::ConnectTimeout {
            addr: addr.clone(),
            timeout: self.connect_timeout,
        })?
        .map_err(|source| DialError::Connect {
            addr: addr.clone(),
            source,
        })?;
        stream.set_nodelay(true).ok();

        // A short write surfaces as `WriteZero`; the stream is dropped with the error.
        stream
            .write_all(descriptor.nonce.as_bytes())
            .await
            .map_err(|source| DialError::HandshakeWrite {
                addr: addr.clone(),
                source,
            })?;

        debug!(%addr, "Connected to assuan server");
        Ok(stream)
    }

    /// Read the descriptor at `path` and dial it.
    pub async fn dial_file(&self, path: &Path) -> Result<TcpStream, DialError> {
        let descriptor = read_descriptor(path).await?;
        self.dial(&descriptor).await
    }
}
