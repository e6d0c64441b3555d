//! Test infrastructure: temp app trees, an in-process worker launcher,
//! and a stub upstream server for proxy tests.

use async_trait::async_trait;
use axum::Router;
use polyserve_dispatcher::{DispatchError, LaunchedWorker, WorkerGuard, WorkerLauncher};
use polyserve_protocol::WorkerConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// App tree fixtures
// ---------------------------------------------------------------------------

/// A temporary `APPS_DIR` with `{name}/{semver}/` app directories.
pub struct AppsFixture {
    root: TempDir,
}

impl AppsFixture {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().expect("failed to create temp apps dir"),
        }
    }

    pub fn apps_dir(&self) -> &Path {
        self.root.path()
    }

    /// Create `{name}/{version}/` and return a builder for its contents.
    pub fn add_app(&self, name: &str, version: &str) -> AppBuilder {
        let dir = self.root.path().join(name).join(version);
        std::fs::create_dir_all(&dir).expect("failed to create app dir");
        AppBuilder { dir }
    }
}

impl Default for AppsFixture {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AppBuilder {
    dir: PathBuf,
}

impl AppBuilder {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn with_file(self, rel_path: &str, contents: &str) -> Self {
        let path = self.dir.join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create app subdir");
        }
        std::fs::write(path, contents).expect("failed to write app file");
        self
    }

    /// Write `worker.config.json` verbatim.
    pub fn with_config(self, json: &str) -> Self {
        self.with_file("worker.config.json", json)
    }

    /// Config with just a `builtin:<name>` entrypoint.
    pub fn with_builtin(self, name: &str) -> Self {
        let config = serde_json::json!({ "entrypoint": format!("builtin:{name}") });
        self.with_file("worker.config.json", &config.to_string())
    }

    /// Write a `routes.json` manifest verbatim.
    pub fn with_routes(self, json: &str) -> Self {
        self.with_file("routes.json", json)
    }
}

// ---------------------------------------------------------------------------
// In-process worker launcher
// ---------------------------------------------------------------------------

/// Runs the real worker loop as a tokio task over in-memory duplex
/// pipes. The pool sees the same protocol a worker process speaks, with
/// no external binary to manage; the guard aborts the task in place of a
/// process kill.
pub struct InProcessLauncher;

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(
        &self,
        app_dir: &Path,
        config: &WorkerConfig,
    ) -> Result<LaunchedWorker, DispatchError> {
        let (dispatcher_writes, worker_reads) = tokio::io::duplex(256 * 1024);
        let (worker_writes, dispatcher_reads) = tokio::io::duplex(256 * 1024);

        let app_dir = app_dir.to_path_buf();
        let config = config.clone();
        let task = tokio::spawn(async move {
            let _ =
                polyserve_worker::Worker::serve(app_dir, config, worker_reads, worker_writes).await;
        });

        Ok(LaunchedWorker {
            reader: Box::new(dispatcher_reads),
            writer: Box::new(dispatcher_writes),
            guard: Box::new(TaskGuard { task: Some(task) }),
        })
    }
}

/// An in-process launcher that records each worker's abort handle so a
/// test can break the transport mid-request, as a process crash would.
#[derive(Default)]
pub struct KillableLauncher {
    workers: std::sync::Mutex<Vec<tokio::task::AbortHandle>>,
}

impl KillableLauncher {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Abort every worker launched so far; their pipes close and the
    /// dispatcher observes a crash.
    pub fn kill_all(&self) {
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for worker in workers.iter() {
            worker.abort();
        }
    }
}

#[async_trait]
impl WorkerLauncher for KillableLauncher {
    async fn launch(
        &self,
        app_dir: &Path,
        config: &WorkerConfig,
    ) -> Result<LaunchedWorker, DispatchError> {
        let (dispatcher_writes, worker_reads) = tokio::io::duplex(256 * 1024);
        let (worker_writes, dispatcher_reads) = tokio::io::duplex(256 * 1024);

        let app_dir = app_dir.to_path_buf();
        let config = config.clone();
        let task = tokio::spawn(async move {
            let _ =
                polyserve_worker::Worker::serve(app_dir, config, worker_reads, worker_writes).await;
        });
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task.abort_handle());

        Ok(LaunchedWorker {
            reader: Box::new(dispatcher_reads),
            writer: Box::new(dispatcher_writes),
            guard: Box::new(TaskGuard { task: Some(task) }),
        })
    }
}

struct TaskGuard {
    task: Option<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl WorkerGuard for TaskGuard {
    async fn wait(&mut self) {
        // Keep the handle on cancellation so a later kill still lands.
        if let Some(task) = self.task.as_mut() {
            let _ = task.await;
            self.task = None;
        }
    }

    async fn kill(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Stub upstream server
// ---------------------------------------------------------------------------

/// A real HTTP server on an ephemeral local port, for proxy tests.
pub struct StubUpstream {
    pub addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl StubUpstream {
    pub async fn start(router: Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind stub upstream");
        let addr = listener.local_addr().expect("no local addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Self { addr, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for StubUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}
