//! Host address discovery from the guest's resolver configuration.
//!
//! Under WSL2 the host is the guest's DNS server.

use std::net::IpAddr;
use std::path::Path;

use tracing::debug;

use super::QueryError;

/// First `nameserver` entry that parses as an IP address.
pub fn parse_nameserver(contents: &str) -> Option<IpAddr> {
    contents.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("nameserver"), Some(addr)) => addr.parse().ok(),
            _ => None,
        }
    })
}

pub async fn resolve_host_address(resolv_conf: &Path) -> Result<IpAddr, QueryError> {
    let contents = tokio::fs::read_to_string(resolv_conf)
        .await
        .map_err(|source| QueryError::ReadFile {
            path: resolv_conf.to_path_buf(),
            source,
        })?;
    let addr = parse_nameserver(&contents).ok_or_else(|| QueryError::NoNameserver {
        path: resolv_conf.to_path_buf(),
    })?;
    debug!(%addr, path = %resolv_conf.display(), "Resolved host address");
    Ok(addr)
}
