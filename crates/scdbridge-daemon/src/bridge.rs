//! Guest-side orchestration.
//!
//! Starts the host agent, waits for its descriptor and then exposes it to
//! local clients: through a loopback listener with its own descriptor,
//! through this process's stdin/stdout, or both. Every relay session is
//! anchored to the agent supervisor's scope.

use std::sync::Arc;

use anyhow::Context;
use scdbridge_core::ProcessSupervisor;
use scdbridge_core::assuan::{
    AssuanDialer, AssuanListener, AuthenticatedConnection, Descriptor, stale_descriptor,
    wait_for_fresh_descriptor,
};
use scdbridge_core::config::Config;
use scdbridge_core::host::resolve_host_address;
use scdbridge_core::relay::{Endpoint, RelaySession, SocketNameOverride};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::paths::BridgePaths;

/// Which surfaces the bridge exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A single session over stdin/stdout; the bridge stops when it ends.
    Server,
    /// Loopback listener published at the local socket path.
    Daemon,
    /// Listener plus a stdin/stdout session; runs until stopped.
    MultiServer,
}

impl Mode {
    pub fn from_flags(server: bool, daemon: bool, multi_server: bool) -> Self {
        match (server, daemon, multi_server) {
            (_, _, true) | (true, true, _) => Self::MultiServer,
            (true, false, false) => Self::Server,
            _ => Self::Daemon,
        }
    }

    pub const fn listens(self) -> bool {
        matches!(self, Self::Daemon | Self::MultiServer)
    }

    pub const fn serves_stdio(self) -> bool {
        matches!(self, Self::Server | Self::MultiServer)
    }
}

/// Authenticated route to the host agent.
#[derive(Debug, Clone)]
pub struct Upstream {
    dialer: AssuanDialer,
    descriptor: Descriptor,
}

impl Upstream {
    pub const fn new(dialer: AssuanDialer, descriptor: Descriptor) -> Self {
        Self { dialer, descriptor }
    }

    pub async fn connect(&self) -> Result<TcpStream, scdbridge_core::assuan::DialError> {
        self.dialer.dial(&self.descriptor).await
    }
}

/// A started bridge.
pub struct Bridge {
    supervisor: ProcessSupervisor,
    upstream: Upstream,
    paths: BridgePaths,
}

impl Bridge {
    /// Start the agent and connect the bridge to it.
    ///
    /// Every failure here is fatal; the agent is stopped again if it was
    /// already running.
    pub async fn start(config: &Config, paths: BridgePaths) -> anyhow::Result<Self> {
        // A descriptor already on disk belongs to an earlier agent
        let stale = stale_descriptor(&paths.host_socket).await;
        if stale.is_some() {
            debug!(
                path = %paths.host_socket.display(),
                "Ignoring existing agent descriptor until it is replaced"
            );
        }

        let supervisor = ProcessSupervisor::start(
            &paths.agent_binary,
            &config.agent.effective_args(),
            &config.agent,
        )?;

        match Self::connect_upstream(config, &paths, stale.as_deref()).await {
            Ok(upstream) => Ok(Self {
                supervisor,
                upstream,
                paths,
            }),
            Err(e) => {
                supervisor.close().await;
                Err(e)
            }
        }
    }

    async fn connect_upstream(
        config: &Config,
        paths: &BridgePaths,
        stale: Option<&[u8]>,
    ) -> anyhow::Result<Upstream> {
        let host = match &config.network.host_address {
            Some(host) => host.clone(),
            None => resolve_host_address(&config.network.resolv_conf)
                .await
                .context("Unable to determine the host address")?
                .to_string(),
        };

        let descriptor =
            wait_for_fresh_descriptor(&paths.host_socket, stale, config.network.descriptor_wait())
                .await
                .context("Unable to read the agent's socket descriptor")?;
        info!(%host, port = descriptor.port, "Agent endpoint ready");

        Ok(Upstream::new(
            AssuanDialer::new(host, &config.network),
            descriptor,
        ))
    }

    /// Supervisor scope; fires when the agent is gone or being stopped.
    pub fn scope(&self) -> CancellationToken {
        self.supervisor.scope()
    }

    /// Expose the agent per `mode` until `shutdown` resolves, the agent
    /// exits, or (in server mode) the stdio session ends.
    pub async fn run(
        self,
        config: &Config,
        mode: Mode,
        stdio: Option<Endpoint>,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let scope = self.supervisor.scope();

        let listener = if mode.listens() {
            match self.listen(config).await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    self.supervisor.close().await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let stdio_session = match (mode.serves_stdio(), stdio) {
            (true, Some(stdio)) => Some(self.spawn_stdio_session(stdio, &scope)),
            _ => None,
        };
        let stops_with_stdio = mode == Mode::Server;

        tokio::select! {
            () = shutdown => {}
            () = self.supervisor.closed() => warn!("Agent stopped, shutting down"),
            () = wait_stdio(stdio_session), if stops_with_stdio => {
                info!("Client session ended");
            }
        }

        self.supervisor.close().await;
        if let Some(listener) = listener {
            // The accept loop ends with the scope and removes the descriptor
            listener.await.ok();
        }
        info!("Bridge stopped");
        Ok(())
    }

    async fn listen(&self, config: &Config) -> anyhow::Result<JoinHandle<()>> {
        let mut listener = AssuanListener::bind(&config.network).await?;
        if let Some(dir) = self.paths.local_socket.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Unable to create {}", dir.display()))?;
        }
        listener.publish(&self.paths.local_socket)?;

        let upstream = self.upstream.clone();
        let scope = self.supervisor.scope();
        let sessions = scope.clone();
        let handle = tokio::spawn(listener.serve(scope, move |conn| {
            relay_to_upstream(conn, upstream.clone(), sessions.clone())
        }));

        notify_ready();
        info!(socket = %self.paths.local_socket.display(), "Listening for clients");
        Ok(handle)
    }

    fn spawn_stdio_session(&self, stdio: Endpoint, scope: &CancellationToken) -> JoinHandle<()> {
        let upstream = self.upstream.clone();
        let filter = Arc::new(SocketNameOverride::new(&self.paths.local_socket));
        let scope = scope.clone();
        tokio::spawn(async move {
            let server = match upstream.connect().await {
                Ok(server) => server,
                Err(e) => {
                    warn!(error = %e, "Unable to reach agent for client session");
                    return;
                }
            };
            RelaySession::new(stdio, Endpoint::from(server))
                .with_filter(filter)
                .run(&scope)
                .await;
        })
    }
}

async fn relay_to_upstream(
    conn: AuthenticatedConnection,
    upstream: Upstream,
    scope: CancellationToken,
) {
    let peer = conn.peer();
    let server = match upstream.connect().await {
        Ok(server) => server,
        Err(e) => {
            warn!(%peer, error = %e, "Unable to reach agent, dropping client");
            return;
        }
    };
    RelaySession::new(Endpoint::from(conn.into_stream()), Endpoint::from(server))
        .run(&scope)
        .await;
}

async fn wait_stdio(session: Option<JoinHandle<()>>) {
    match session {
        Some(handle) => {
            handle.await.ok();
        }
        None => std::future::pending().await,
    }
}

fn notify_ready() {
    // `true` unsets $NOTIFY_SOCKET so the agent does not inherit it
    #[cfg(unix)]
    if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %e, "Failed to notify systemd");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_from_flags() {
        assert_eq!(Mode::from_flags(false, false, false), Mode::Daemon);
        assert_eq!(Mode::from_flags(true, false, false), Mode::Server);
        assert_eq!(Mode::from_flags(false, true, false), Mode::Daemon);
        assert_eq!(Mode::from_flags(true, true, false), Mode::MultiServer);
        assert_eq!(Mode::from_flags(false, false, true), Mode::MultiServer);
    }

    #[test]
    fn mode_surfaces() {
        assert!(Mode::Server.serves_stdio() && !Mode::Server.listens());
        assert!(Mode::Daemon.listens() && !Mode::Daemon.serves_stdio());
        assert!(Mode::MultiServer.listens() && Mode::MultiServer.serves_stdio());
    }
}
