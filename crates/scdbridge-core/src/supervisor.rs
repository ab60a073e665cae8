//! Agent process lifecycle.
//!
//! The supervisor owns the child and a cancellation scope. The scope fires
//! when the child exits on its own or when [`ProcessSupervisor::close`] is
//! called; every relay session anchored to it unwinds at that point.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;

/// How often an unescalated stall is reported.
const STALL_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Errors from supervising the agent process.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Handle to the running agent.
pub struct ProcessSupervisor {
    program: PathBuf,
    pid: Option<u32>,
    scope: CancellationToken,
    watcher: Mutex<Option<JoinHandle<Option<ExitStatus>>>>,
}

impl ProcessSupervisor {
    /// Launch `program` with `args`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        program: &Path,
        args: &[String],
        config: &AgentConfig,
    ) -> Result<Self, SupervisorError> {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        if config.verbose {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        info!(program = %program.display(), ?args, "Starting agent process");
        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            forward_lines(pid, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(pid, "stderr", stderr);
        }

        let scope = CancellationToken::new();
        let watcher = tokio::spawn(watch(child, scope.clone(), config.terminate_timeout()));

        Ok(Self {
            program: program.to_path_buf(),
            pid,
            scope,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Scope that fires when the agent is gone or being stopped.
    pub fn scope(&self) -> CancellationToken {
        self.scope.clone()
    }

    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Wait until the scope fires.
    pub async fn closed(&self) {
        self.scope.cancelled().await;
    }

    /// Cancel the scope, interrupt the agent and wait for it to exit.
    ///
    /// Returns the exit status on the first call if it could be collected;
    /// later calls return `None` immediately.
    pub async fn close(&self) -> Option<ExitStatus> {
        self.scope.cancel();
        let watcher = self.watcher.lock().await.take()?;
        match watcher.await {
            Ok(status) => status,
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "Agent watcher task failed");
                None
            }
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

async fn watch(
    mut child: Child,
    scope: CancellationToken,
    terminate_timeout: Duration,
) -> Option<ExitStatus> {
    let pid = child.id();
    tokio::select! {
        status = child.wait() => {
            match &status {
                Ok(status) => warn!(?pid, %status, "Agent process exited"),
                Err(e) => warn!(?pid, error = %e, "Error waiting for agent process"),
            }
            scope.cancel();
            status.ok()
        }
        () = scope.cancelled() => terminate(&mut child, terminate_timeout).await,
    }
}

async fn terminate(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let pid = child.id();
    debug!(?pid, "Terminating agent process");
    interrupt(child);

    if timeout.is_zero() {
        loop {
            match tokio::time::timeout(STALL_REPORT_INTERVAL, child.wait()).await {
                Ok(status) => {
                    info!(?pid, ?status, "Agent process exited");
                    return status.ok();
                }
                Err(_) => warn!(?pid, "Agent process still running after interrupt"),
            }
        }
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            info!(?pid, %status, "Agent process exited gracefully");
            return Some(status);
        }
        Ok(Err(e)) => warn!(?pid, error = %e, "Error waiting for agent process, killing"),
        Err(_) => warn!(?pid, ?timeout, "Timeout waiting for graceful shutdown, killing"),
    }
    child.kill().await.ok();
    child.wait().await.ok()
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: pid is a valid process ID obtained from our own Child handle.
        // kill(2) with SIGINT is safe to call on any owned subprocess.
        #[allow(unsafe_code)]
        #[allow(clippy::cast_possible_wrap)]
        let ret = unsafe { libc::kill(pid as i32, libc::SIGINT) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            warn!(pid, error = %err, "Failed to send SIGINT");
        }
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    // No interrupt signal for other processes here
    if let Err(e) = child.start_kill() {
        warn!(pid = ?child.id(), error = %e, "Failed to kill agent process");
    }
}

fn forward_lines<R>(pid: Option<u32>, stream: &'static str, reader: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(?pid, stream, "{}", line);
        }
    });
}
