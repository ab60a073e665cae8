//! Loopback Assuan listener gated by the nonce handshake.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::descriptor::{
    Descriptor, DescriptorError, NONCE_LEN, Nonce, read_descriptor, write_descriptor,
};
use crate::config::NetworkConfig;

/// Pause after a failed `accept` so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// A connection whose peer presented the listener's nonce.
#[derive(Debug)]
pub struct AuthenticatedConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl AuthenticatedConnection {
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// Errors from the listener.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Handshake from {peer} did not present the expected nonce")]
    HandshakeMismatch { peer: SocketAddr },

    #[error("Handshake from {peer} timed out after {timeout:?}")]
    HandshakeTimeout { peer: SocketAddr, timeout: Duration },

    #[error("Failed to read nonce from {peer}: {source}")]
    HandshakeRead {
        peer: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Publish(#[from] DescriptorError),
}

/// Ephemeral loopback endpoint that emulates an Assuan socket.
pub struct AssuanListener {
    listener: TcpListener,
    descriptor: Descriptor,
    handshake_timeout: Duration,
    published: Option<PathBuf>,
}

impl AssuanListener {
    /// Bind an OS-assigned port on `127.0.0.1` with a freshly generated nonce.
    pub async fn bind(config: &NetworkConfig) -> Result<Self, ListenerError> {
        Self::bind_with(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            Nonce::generate(),
            config.handshake_timeout(),
        )
        .await
    }

    async fn bind_with(
        addr: SocketAddr,
        nonce: Nonce,
        handshake_timeout: Duration,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr, source })?
            .port();
        info!(port, "Assuan listener bound");
        Ok(Self {
            listener,
            descriptor: Descriptor::new(port, nonce),
            handshake_timeout,
            published: None,
        })
    }

    pub const fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Write this listener's descriptor to `path`, replacing any previous one.
    pub fn publish(&mut self, path: &Path) -> Result<(), ListenerError> {
        write_descriptor(path, &self.descriptor)?;
        info!(path = %path.display(), port = self.descriptor.port, "Published socket descriptor");
        self.published = Some(path.to_path_buf());
        Ok(())
    }

    /// Remove the published descriptor if it still belongs to this listener.
    ///
    /// A file rewritten by a newer incarnation is left alone.
    pub async fn unpublish(&mut self) {
        let Some(path) = self.published.take() else {
            return;
        };
        match read_descriptor(&path).await {
            Ok(current) if current == self.descriptor => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "Failed to remove socket descriptor");
                } else {
                    debug!(path = %path.display(), "Removed socket descriptor");
                }
            }
            Ok(_) => debug!(path = %path.display(), "Descriptor replaced by another listener"),
            Err(e) => debug!(path = %path.display(), error = %e, "Descriptor already gone"),
        }
    }

    /// Accept the next TCP connection, logging and retrying failed accepts.
    pub async fn accept(&self) -> (TcpStream, SocketAddr) {
        loop {
            match self.listener.accept().await {
                Ok(conn) => return conn,
                Err(e) => {
                    warn!(error = %e, "Could not accept connection");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Accept connections until one passes the handshake.
    ///
    /// Handshakes run inline; use [`serve`](Self::serve) to keep accepting
    /// while slow clients are being checked.
    pub async fn next_authenticated(&self) -> AuthenticatedConnection {
        loop {
            let (stream, peer) = self.accept().await;
            match authenticate(stream, peer, &self.descriptor.nonce, self.handshake_timeout).await
            {
                Ok(conn) => return conn,
                Err(e) => log_rejected(&e),
            }
        }
    }

    /// Run the accept loop until `scope` is cancelled.
    ///
    /// Every accepted connection gets its own task that performs the
    /// handshake and, on success, hands the connection to `handler`. When the
    /// loop ends the descriptor is unpublished and the socket closed.
    pub async fn serve<F, Fut>(mut self, scope: CancellationToken, handler: F)
    where
        F: Fn(AuthenticatedConnection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = std::sync::Arc::new(handler);
        loop {
            let (stream, peer) = tokio::select! {
                () = scope.cancelled() => break,
                conn = self.accept() => conn,
            };
            debug!(%peer, "Accepted connection");

            let nonce = self.descriptor.nonce;
            let timeout = self.handshake_timeout;
            let handler = std::sync::Arc::clone(&handler);
            let scope = scope.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    () = scope.cancelled() => return,
                    result = authenticate(stream, peer, &nonce, timeout) => result,
                };
                match result {
                    Ok(conn) => {
                        info!(%peer, "Received authenticated connection");
                        (*handler)(conn).await;
                    }
                    Err(e) => log_rejected(&e),
                }
            });
        }

        info!(port = self.descriptor.port, "Assuan listener shutting down");
        self.unpublish().await;
    }
}

/// Read exactly [`NONCE_LEN`] bytes from `stream` within `timeout` and
/// compare them against `expected`.
///
/// On any failure the stream is dropped, closing the connection.
pub async fn authenticate(
    mut stream: TcpStream,
    peer: SocketAddr,
    expected: &Nonce,
    timeout: Duration,
) -> Result<AuthenticatedConnection, ListenerError> {
    let mut candidate = [0u8; NONCE_LEN];
    match tokio::time::timeout(timeout, stream.read_exact(&mut candidate)).await {
        Err(_) => return Err(ListenerError::HandshakeTimeout { peer, timeout }),
        Ok(Err(source)) => return Err(ListenerError::HandshakeRead { peer, source }),
        Ok(Ok(_)) => {}
    }

    if Nonce::from_bytes(candidate) != *expected {
        debug!(%peer, prefix = %hex::encode(&candidate[..4]), "Nonce mismatch");
        return Err(ListenerError::HandshakeMismatch { peer });
    }

    Ok(AuthenticatedConnection { stream, peer })
}

fn log_rejected(error: &ListenerError) {
    warn!(error = %error, "Rejected connection");
}
