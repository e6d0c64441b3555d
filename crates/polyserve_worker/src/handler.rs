//! App handler providers.
//!
//! The contract: given an app directory and its config, produce a
//! function that maps request -> response. Three provider shapes are
//! supported, selected from the entrypoint (or inferred from the app
//! directory):
//!
//! - static site: entrypoint ends in `.html` (or `index.html` exists);
//!   files served from the app directory with SPA fallback.
//! - routes table: a `routes.json` manifest of path -> response entries.
//! - builtin: `builtin:<name>` from a fixed registry.

use crate::builtin::Builtin;
use crate::routes::RoutesTable;
use crate::static_site::StaticSite;
use anyhow::{bail, Result};
use async_trait::async_trait;
use polyserve_protocol::defaults;
use polyserve_protocol::{WireRequest, WireResponse, WorkerConfig};
use std::path::Path;

/// One app's request handler plus its lifecycle hooks.
#[async_trait]
pub trait AppHandler: Send + Sync {
    async fn fetch(&self, req: &WireRequest) -> Result<WireResponse>;

    /// Advisory: the dispatcher considers this worker idle.
    async fn on_idle(&self) {}

    /// Invoked on TERMINATE, bounded by the terminate grace period.
    async fn on_terminate(&self) {}
}

/// Select and construct the provider for `app_dir`.
pub async fn build(app_dir: &Path, config: &WorkerConfig) -> Result<Box<dyn AppHandler>> {
    if let Some(entrypoint) = config.entrypoint.as_deref() {
        if let Some(name) = entrypoint.strip_prefix("builtin:") {
            return match Builtin::lookup(name) {
                Some(b) => Ok(Box::new(b)),
                None => bail!("unknown builtin handler: {name}"),
            };
        }
        if entrypoint.ends_with(".html") {
            return Ok(Box::new(StaticSite::new(app_dir, entrypoint)?));
        }
        if entrypoint.ends_with(".json") {
            return Ok(Box::new(RoutesTable::load(app_dir, entrypoint).await?));
        }
        bail!("unsupported entrypoint: {entrypoint}");
    }

    if app_dir.join(defaults::ROUTES_MANIFEST_FILE).exists() {
        return Ok(Box::new(
            RoutesTable::load(app_dir, defaults::ROUTES_MANIFEST_FILE).await?,
        ));
    }
    if app_dir.join(defaults::INDEX_HTML_FILE).exists() {
        return Ok(Box::new(StaticSite::new(
            app_dir,
            defaults::INDEX_HTML_FILE,
        )?));
    }

    bail!(
        "no entrypoint for app at {}: expected {}, {} or an explicit entrypoint",
        app_dir.display(),
        defaults::ROUTES_MANIFEST_FILE,
        defaults::INDEX_HTML_FILE,
    )
}
