//! Static-site provider: serve files from the app directory with SPA
//! fallback to the entrypoint HTML.

use crate::handler::AppHandler;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use polyserve_protocol::{WireRequest, WireResponse};
use std::path::{Component, Path, PathBuf};

pub struct StaticSite {
    root: PathBuf,
    index: PathBuf,
}

impl StaticSite {
    pub fn new(app_dir: &Path, entrypoint: &str) -> Result<Self> {
        let index = app_dir.join(entrypoint);
        if !index.exists() {
            bail!("entrypoint not found: {}", index.display());
        }
        Ok(Self {
            root: app_dir.to_path_buf(),
            index,
        })
    }

    /// Map a request path to a file under the root. Rejects traversal.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() {
            return Some(self.index.clone());
        }
        let candidate = Path::new(trimmed);
        for component in candidate.components() {
            match component {
                Component::Normal(_) => {}
                _ => return None,
            }
        }
        Some(self.root.join(candidate))
    }
}

#[async_trait]
impl AppHandler for StaticSite {
    async fn fetch(&self, req: &WireRequest) -> Result<WireResponse> {
        let path = req.uri.split('?').next().unwrap_or("/");
        let Some(candidate) = self.resolve(path) else {
            return Ok(WireResponse::new(403).with_body("text/plain", "forbidden"));
        };

        // SPA fallback: unknown paths get the entrypoint HTML so client
        // routing can take over.
        let file = if candidate.is_file() {
            candidate
        } else {
            self.index.clone()
        };

        let body = tokio::fs::read(&file)
            .await
            .with_context(|| format!("failed to read {}", file.display()))?;
        Ok(WireResponse::new(200).with_body(content_type_for(&file), body))
    }
}

/// Content type by extension. Unknown extensions fall back to
/// octet-stream.
fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") | Some("mjs") => "text/javascript",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        Some("wasm") => "application/wasm",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}
