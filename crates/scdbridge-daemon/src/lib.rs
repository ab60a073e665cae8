//! scdbridge Daemon Library
//!
//! Guest side of the bridge:
//! - Path resolution through the local and host gpgconf
//! - Agent startup and the loopback listener / stdio session
//! - Signal-driven shutdown

pub mod bridge;
pub mod paths;
pub mod shutdown;
