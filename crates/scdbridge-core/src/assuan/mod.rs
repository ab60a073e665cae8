//! Assuan socket emulation over loopback TCP.
//!
//! Where Unix sockets cannot cross the boundary, an Assuan server listens on
//! an ephemeral TCP port and writes a small descriptor file (`<port>\n` plus a
//! 16-byte nonce) where the socket would normally live. A client reads the
//! file, connects, and sends the nonce before any protocol traffic.

pub mod descriptor;
pub mod dialer;
pub mod listener;

pub use descriptor::{
    Descriptor, DescriptorError, NONCE_LEN, Nonce, read_descriptor, stale_descriptor,
    wait_for_descriptor, wait_for_fresh_descriptor, write_descriptor,
};
pub use dialer::{AssuanDialer, DialError};
pub use listener::{AssuanListener, AuthenticatedConnection, ListenerError};
