//! Per-request app materialization: resolved directory, worker config,
//! compiled proxy rules.

use crate::error::DispatchError;
use crate::pool::Pool;
use crate::proxy::{self, CompiledProxyRule};
use crate::resolver::ResolvedApp;
use polyserve_protocol::{app_config, ErrorKind, WorkerConfig};

pub struct LoadedApp {
    pub resolved: ResolvedApp,
    pub config: WorkerConfig,
    pub proxy: Vec<CompiledProxyRule>,
}

/// Load config for a resolved app. A live worker's cached config wins;
/// otherwise the config is read from disk (each miss re-reads, so config
/// edits take effect with the next worker).
pub fn load(resolved: ResolvedApp, pool: &Pool) -> Result<LoadedApp, DispatchError> {
    let config = match pool.cached_config(&resolved.dir) {
        Some(config) => config,
        None => app_config::load(&resolved.dir)
            .map_err(|err| DispatchError::new(ErrorKind::InvalidConfig, err.to_string()))?,
    };
    let proxy = proxy::compile_rules(&config);
    Ok(LoadedApp {
        resolved,
        config,
        proxy,
    })
}
