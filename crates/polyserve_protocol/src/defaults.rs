//! Canonical default values shared across the dispatcher and workers.

/// Per-app config file, highest precedence.
pub const WORKER_CONFIG_FILE: &str = "worker.config.json";
/// Fallback config source: the `workerConfig` field of this file.
pub const PACKAGE_JSON_FILE: &str = "package.json";
/// Routes-table handler manifest.
pub const ROUTES_MANIFEST_FILE: &str = "routes.json";
/// Static-site SPA entrypoint.
pub const INDEX_HTML_FILE: &str = "index.html";
/// Optional dependency-install hook run when `autoInstall` is set.
pub const INSTALL_HOOK_FILE: &str = "install.sh";

pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_TTL_MS: u64 = 0;
pub const DEFAULT_MAX_REQUESTS: u64 = 1_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_POOL_SIZE: usize = 10;
/// Back-off granularity for pool waits (creation races, capacity waits).
pub const DEFAULT_DELAY_MS: u64 = 100;

/// Grace period a worker gets between TERMINATE and a forced kill.
pub const TERMINATE_GRACE_MS: u64 = 5_000;

/// Environment bindings handed to a spawned worker process.
pub const ENV_APP_DIR: &str = "POLYSERVE_APP_DIR";
pub const ENV_WORKER_CONFIG: &str = "POLYSERVE_WORKER_CONFIG";

/// Header injected by the dispatcher carrying the matched app name.
pub const APP_NAME_HEADER: &str = "x-app-name";
