//! Byte-transparent relay between two connected endpoints.

pub mod filter;
pub mod session;

pub use filter::{Interception, ResponseFilter, SocketNameOverride};
pub use session::{ClosedBy, Endpoint, RelayOutcome, RelaySession};
