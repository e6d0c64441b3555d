//! The seam through which the pool obtains worker transports.
//!
//! Production launches the `polyserve-worker` binary with piped stdio;
//! tests provide an in-process launcher running the worker library over
//! duplex pipes (see `polyserve_test_utils`).

use crate::error::DispatchError;
use async_trait::async_trait;
use polyserve_protocol::{defaults, ErrorKind, WorkerConfig};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::debug;

/// A freshly launched worker: its framed transport plus a guard that can
/// wait for or force its exit.
pub struct LaunchedWorker {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub guard: Box<dyn WorkerGuard>,
}

#[async_trait]
pub trait WorkerGuard: Send {
    /// Wait for the worker to exit on its own.
    async fn wait(&mut self);

    /// Force the worker down. Idempotent.
    async fn kill(&mut self);
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(
        &self,
        app_dir: &Path,
        config: &WorkerConfig,
    ) -> Result<LaunchedWorker, DispatchError>;
}

/// Launches worker processes with the protocol on stdin/stdout. Worker
/// stderr is inherited so app logs land in the dispatcher's stderr.
pub struct ProcessLauncher {
    worker_bin: PathBuf,
}

impl ProcessLauncher {
    pub fn new(worker_bin: PathBuf) -> Self {
        Self { worker_bin }
    }

    /// `POLYSERVE_WORKER_BIN`, or `polyserve-worker` next to the current
    /// executable.
    pub fn from_env() -> Self {
        let worker_bin = std::env::var_os("POLYSERVE_WORKER_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::current_exe()
                    .ok()
                    .and_then(|exe| exe.parent().map(|dir| dir.join("polyserve-worker")))
                    .unwrap_or_else(|| PathBuf::from("polyserve-worker"))
            });
        Self { worker_bin }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        app_dir: &Path,
        config: &WorkerConfig,
    ) -> Result<LaunchedWorker, DispatchError> {
        debug!(worker_bin = %self.worker_bin.display(), app_dir = %app_dir.display(), "spawning worker");

        let mut child = Command::new(&self.worker_bin)
            .env(defaults::ENV_APP_DIR, app_dir)
            .env(defaults::ENV_WORKER_CONFIG, config.to_env_string())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                DispatchError::new(
                    ErrorKind::WorkerSpawnFailed,
                    format!("failed to spawn {}: {err}", self.worker_bin.display()),
                )
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            DispatchError::new(ErrorKind::WorkerSpawnFailed, "worker stdin unavailable")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            DispatchError::new(ErrorKind::WorkerSpawnFailed, "worker stdout unavailable")
        })?;

        Ok(LaunchedWorker {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            guard: Box::new(ChildGuard { child }),
        })
    }
}

struct ChildGuard {
    child: Child,
}

#[async_trait]
impl WorkerGuard for ChildGuard {
    async fn wait(&mut self) {
        let _ = self.child.wait().await;
    }

    async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}
