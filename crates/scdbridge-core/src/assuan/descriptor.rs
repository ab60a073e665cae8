//! Socket descriptor codec: `<decimal port>\n<16 raw nonce bytes>`.
//!
//! The layout is fixed by the agents that write these files and must stay
//! byte-exact.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use tokio::time::Instant;

/// Length of the handshake nonce in bytes.
pub const NONCE_LEN: usize = 16;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared secret a client must present before the connection is relayed.
///
/// Comparison is constant-time and `Debug` never prints the bytes.
#[derive(Clone, Copy)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    /// Generate a fresh nonce from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

impl PartialEq for Nonce {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for Nonce {}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Nonce(..)")
    }
}

/// Rendezvous information for one relay endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub port: u16,
    pub nonce: Nonce,
}

impl Descriptor {
    pub const fn new(port: u16, nonce: Nonce) -> Self {
        Self { port, nonce }
    }

    /// Encode as `ASCII(port) + "\n" + nonce`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{}\n", self.port).into_bytes();
        out.extend_from_slice(&self.nonce.0);
        out
    }

    /// Decode a descriptor. Bytes after the nonce are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let newline = bytes.iter().position(|&b| b == b'\n').ok_or_else(|| {
            DescriptorError::Malformed {
                line: printable(bytes),
            }
        })?;
        let line = &bytes[..newline];
        let port = std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.trim().parse::<u16>().ok())
            .ok_or_else(|| DescriptorError::Malformed {
                line: printable(line),
            })?;

        let rest = &bytes[newline + 1..];
        let nonce: [u8; NONCE_LEN] = rest
            .get(..NONCE_LEN)
            .and_then(|n| n.try_into().ok())
            .ok_or(DescriptorError::Truncated {
                expected: NONCE_LEN,
                actual: rest.len(),
            })?;

        Ok(Self::new(port, Nonce(nonce)))
    }
}

fn printable(bytes: &[u8]) -> String {
    let shown = &bytes[..bytes.len().min(32)];
    String::from_utf8_lossy(shown).into_owned()
}

/// Errors reading, writing or decoding descriptor files.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("Malformed descriptor: {line:?} is not a valid port line")]
    Malformed { line: String },

    #[error("Truncated descriptor: expected {expected} nonce bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Failed to read descriptor {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write descriptor {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {waited:?} waiting for descriptor {}", path.display())]
    Timeout { path: PathBuf, waited: Duration },
}

/// Read the whole descriptor file, then decode it.
pub async fn read_descriptor(path: &Path) -> Result<Descriptor, DescriptorError> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|source| DescriptorError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    Descriptor::decode(&data)
}

/// Read a descriptor, polling while the file does not exist yet.
///
/// Only absence is retried; a file that exists but does not decode is
/// returned as an error straight away.
pub async fn wait_for_descriptor(
    path: &Path,
    timeout: Duration,
) -> Result<Descriptor, DescriptorError> {
    wait_for_fresh_descriptor(path, None, timeout).await
}

/// Raw contents of the descriptor at `path`, if there is one.
///
/// Taken before starting an agent so that a file left behind by an earlier
/// listener can be told apart from the new one.
pub async fn stale_descriptor(path: &Path) -> Option<Vec<u8>> {
    tokio::fs::read(path).await.ok()
}

/// Like [`wait_for_descriptor`], but a file whose bytes equal `stale` is
/// treated as absent. A new listener always publishes a new nonce, so its
/// descriptor never matches the stale one.
pub async fn wait_for_fresh_descriptor(
    path: &Path,
    stale: Option<&[u8]>,
    timeout: Duration,
) -> Result<Descriptor, DescriptorError> {
    let deadline = Instant::now() + timeout;
    loop {
        match tokio::fs::read(path).await {
            Ok(data) if stale != Some(data.as_slice()) => return Descriptor::decode(&data),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(DescriptorError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
        if Instant::now() >= deadline {
            return Err(DescriptorError::Timeout {
                path: path.to_path_buf(),
                waited: timeout,
            });
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}

/// Write a descriptor with owner-only permissions.
///
/// The bytes go to a temporary file in the same directory which is then
/// renamed over `path`, so readers see either the old file or the complete
/// new one.
pub fn write_descriptor(path: &Path, descriptor: &Descriptor) -> Result<(), DescriptorError> {
    let write_err = |source| DescriptorError::Write {
        path: path.to_path_buf(),
        source,
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| {
            write_err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "descriptor path has no file name",
            ))
        })?
        .to_string_lossy();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));

    let result = (|| {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(&descriptor.encode())?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();

    if result.is_err() {
        std::fs::remove_file(&tmp).ok();
    }
    result.map_err(write_err)
}
