#![allow(clippy::unwrap_used)]

use std::time::Duration;

use scdbridge_core::assuan::{AssuanListener, AuthenticatedConnection};
use scdbridge_core::config::Config;
use scdbridge_core::relay::{ClosedBy, Endpoint};
use scdbridge_relay::{locate_descriptor, run_stdio_relay};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

fn config_for(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.socket.local_dir = Some(dir.to_path_buf());
    config
}

/// Stand-in scdaemon answering every line with `OK`.
async fn start_agent(config: &Config, scope: CancellationToken) {
    let path = locate_descriptor(config).await.unwrap();
    let mut listener = AssuanListener::bind(&config.network).await.unwrap();
    listener.publish(&path).unwrap();
    tokio::spawn(listener.serve(scope, |conn: AuthenticatedConnection| async move {
        let mut stream = conn.into_stream();
        let mut buf = [0u8; 256];
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
            let lines = buf[..n].iter().filter(|b| **b == b'\n').count();
            for _ in 0..lines {
                if stream.write_all(b"OK\n").await.is_err() {
                    return;
                }
            }
        }
    }));
}

#[tokio::test]
async fn relays_stdio_to_agent() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path());
    let agent_scope = CancellationToken::new();
    start_agent(&config, agent_scope.clone()).await;

    let (mut client, stdio) = tokio::io::duplex(1024);
    let scope = CancellationToken::new();
    let relay = tokio::spawn({
        let config = config.clone();
        async move { run_stdio_relay(&config, Endpoint::new(stdio), &scope).await }
    });

    client.write_all(b"SERIALNO\n").await.unwrap();
    let mut reply = [0u8; 3];
    tokio::time::timeout(TIMEOUT, client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"OK\n");

    // Closing stdin ends the relay
    drop(client);
    let outcome = tokio::time::timeout(TIMEOUT, relay)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.closed_by, ClosedBy::A);
    assert_eq!(outcome.a_to_b, 9);
    assert_eq!(outcome.b_to_a, 3);
    agent_scope.cancel();
}

#[tokio::test]
async fn cancelled_scope_ends_relay() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path());
    let agent_scope = CancellationToken::new();
    start_agent(&config, agent_scope.clone()).await;

    let (mut client, stdio) = tokio::io::duplex(1024);
    let scope = CancellationToken::new();
    let relay = tokio::spawn({
        let config = config.clone();
        let scope = scope.clone();
        async move { run_stdio_relay(&config, Endpoint::new(stdio), &scope).await }
    });

    client.write_all(b"GETINFO version\n").await.unwrap();
    let mut reply = [0u8; 3];
    tokio::time::timeout(TIMEOUT, client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();

    scope.cancel();
    let outcome = tokio::time::timeout(TIMEOUT, relay)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.closed_by, ClosedBy::Scope);
    agent_scope.cancel();
}

#[tokio::test]
async fn missing_descriptor_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path());
    let (_client, stdio) = tokio::io::duplex(64);

    let err = run_stdio_relay(&config, Endpoint::new(stdio), &CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(format!("{err:#}").contains("assuan server"));
}
