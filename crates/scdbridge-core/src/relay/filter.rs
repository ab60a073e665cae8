//! Optional response injection for one relay direction.
//!
//! A filter sees every chunk read from the client side before it is
//! forwarded. It can answer a chunk itself; the reply is written back to the
//! client and the answered bytes never reach the server.

use std::path::Path;

/// A chunk prefix the filter answered locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interception {
    /// Bytes written back to the client.
    pub reply: Vec<u8>,
    /// Number of leading chunk bytes that are swallowed. The remainder is
    /// forwarded as usual.
    pub consumed: usize,
}

/// Predicate-plus-replacement stage installed with
/// [`RelaySession::with_filter`](super::RelaySession::with_filter).
pub trait ResponseFilter: Send + Sync {
    /// Return `None` to forward `chunk` untouched.
    fn intercept(&self, chunk: &[u8]) -> Option<Interception>;
}

/// Answers `GETINFO socket_name` with the bridged socket path.
///
/// The real agent would report its own, host-side socket, which is
/// meaningless to clients on the other side of the bridge.
#[derive(Debug, Clone)]
pub struct SocketNameOverride {
    command: Vec<u8>,
    reply: Vec<u8>,
}

impl SocketNameOverride {
    pub fn new(socket_path: &Path) -> Self {
        Self {
            command: b"GETINFO socket_name\n".to_vec(),
            reply: format!("D {}\nOK\n", socket_path.display()).into_bytes(),
        }
    }
}

impl ResponseFilter for SocketNameOverride {
    fn intercept(&self, chunk: &[u8]) -> Option<Interception> {
        chunk.starts_with(&self.command).then(|| Interception {
            reply: self.reply.clone(),
            consumed: self.command.len(),
        })
    }
}
