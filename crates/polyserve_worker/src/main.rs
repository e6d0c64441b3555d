//! Polyserve worker process.
//!
//! Spawned by the dispatcher with the app directory and serialized
//! config as environment bindings; speaks the framed protocol on
//! stdin/stdout. Stdout belongs to the protocol, so logs go to stderr
//! and the shared log file only.

use anyhow::{Context, Result};
use clap::Parser;
use polyserve_protocol::defaults;
use polyserve_protocol::WorkerConfig;
use polyserve_worker::Worker;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "polyserve-worker", about = "Polyserve app worker")]
struct Args {
    /// App directory to serve
    #[arg(long, env = defaults::ENV_APP_DIR)]
    app_dir: PathBuf,

    /// Serialized worker config (JSON); defaults apply when absent
    #[arg(long, env = defaults::ENV_WORKER_CONFIG)]
    config: Option<String>,

    /// Mirror the full log filter to stderr
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    polyserve_logging::init_logging(polyserve_logging::LogConfig {
        app_name: "polyserve-worker",
        verbose: args.verbose,
        quiet: !args.verbose,
    })?;

    let config = match args.config.as_deref() {
        Some(raw) => WorkerConfig::from_env_string(raw).context("invalid worker config")?,
        None => WorkerConfig::default(),
    };

    tracing::info!(app_dir = %args.app_dir.display(), "starting worker");

    Worker::serve(
        args.app_dir,
        config,
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await
}
