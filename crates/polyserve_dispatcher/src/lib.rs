//! Polyserve dispatcher: resolves versioned apps, pools worker
//! processes, proxies configured routes, and serves metrics.

pub mod apps;
pub mod config;
pub mod error;
pub mod http;
pub mod launcher;
pub mod metrics;
pub mod pool;
pub mod proxy;
pub mod resolver;
pub mod worker_handle;

pub use config::RuntimeConfig;
pub use error::DispatchError;
pub use http::{router, ServerState, SharedState};
pub use launcher::{LaunchedWorker, ProcessLauncher, WorkerGuard, WorkerLauncher};
pub use pool::Pool;
