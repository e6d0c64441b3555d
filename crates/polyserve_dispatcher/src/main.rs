//! Polyserve: multi-tenant app runtime.
//!
//! Usage:
//!     polyserve --apps-dir /srv/apps --port 8080

use anyhow::{Context, Result};
use clap::Parser;
use polyserve_dispatcher::http::{self, ServerState};
use polyserve_dispatcher::proxy::ProxyClients;
use polyserve_dispatcher::{Pool, ProcessLauncher, RuntimeConfig};
use polyserve_protocol::defaults;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "polyserve", about = "Multi-tenant app runtime")]
struct Args {
    /// Root of the app tree ({name}/{semver}/ directories)
    #[arg(long, env = "APPS_DIR")]
    apps_dir: PathBuf,

    /// Listen port
    #[arg(long, env = "PORT", default_value_t = defaults::DEFAULT_PORT)]
    port: u16,

    /// Maximum concurrent workers
    #[arg(long, env = "POOL_SIZE", default_value_t = defaults::DEFAULT_POOL_SIZE)]
    pool_size: usize,

    /// App serving the root path when no /:app prefix matches
    #[arg(long, env = "APP_SHELL")]
    app_shell: Option<String>,

    /// Back-off granularity (ms) for pool waits
    #[arg(long, env = "DELAY_MS", default_value_t = defaults::DEFAULT_DELAY_MS)]
    delay_ms: u64,

    /// Informational environment name
    #[arg(long, env = "NODE_ENV", default_value = "development")]
    node_env: String,

    /// Mirror the full log filter to stderr
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    polyserve_logging::init_logging(polyserve_logging::LogConfig {
        app_name: "polyserve",
        verbose: args.verbose,
        quiet: false,
    })?;

    let config = RuntimeConfig {
        apps_dir: args.apps_dir,
        port: args.port,
        pool_size: args.pool_size,
        app_shell: args.app_shell,
        delay_ms: args.delay_ms,
        node_env: args.node_env,
    };
    config.validate()?;

    tracing::info!("Starting polyserve");
    tracing::info!("  Apps dir: {}", config.apps_dir.display());
    tracing::info!("  Port: {}", config.port);
    tracing::info!("  Pool size: {}", config.pool_size);
    if let Some(shell) = &config.app_shell {
        tracing::info!("  App shell: {}", shell);
    }

    let launcher = Arc::new(ProcessLauncher::from_env());
    let pool = Pool::new(launcher, config.pool_size, config.delay_ms);
    pool.spawn_reaper();

    let state = Arc::new(ServerState {
        proxy_clients: ProxyClients::new().context("failed to build proxy clients")?,
        pool: Arc::clone(&pool),
        config: config.clone(),
    });

    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    let shutdown_pool = Arc::clone(&pool);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            tracing::info!("Shutdown signal received; draining pool");
            shutdown_pool.shutdown().await;
        })
        .await
        .context("server error")?;

    tracing::info!("Polyserve stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
