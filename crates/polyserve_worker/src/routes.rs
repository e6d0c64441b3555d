//! Routes-table provider: a declarative `routes.json` manifest mapping
//! paths to static responses, method maps, or file-backed bodies.
//!
//! ```json
//! {
//!   "routes": {
//!     "/": { "status": 200, "body": "hi", "headers": {"content-type": "text/plain"} },
//!     "/api/things": {
//!       "GET":  { "status": 200, "body": "[]" },
//!       "POST": { "status": 201, "body": "made" }
//!     },
//!     "/page": { "file": "page.html" }
//!   },
//!   "fallback": { "status": 404, "body": "no such route" }
//! }
//! ```

use crate::handler::AppHandler;
use anyhow::{Context, Result};
use async_trait::async_trait;
use polyserve_protocol::{WireRequest, WireResponse};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub struct RoutesTable {
    app_dir: PathBuf,
    manifest: Manifest,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    routes: BTreeMap<String, RouteEntry>,
    fallback: Option<RouteResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RouteEntry {
    Response(RouteResponse),
    /// Uppercase HTTP verb -> response.
    MethodMap(BTreeMap<String, RouteResponse>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteResponse {
    status: Option<u16>,
    body: Option<String>,
    /// Body read from a file relative to the app directory; wins over
    /// `body` when both are present.
    file: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

impl RoutesTable {
    pub async fn load(app_dir: &Path, manifest_name: &str) -> Result<Self> {
        let path = app_dir.join(manifest_name);
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&text)
            .with_context(|| format!("malformed routes manifest {}", path.display()))?;
        Ok(Self {
            app_dir: app_dir.to_path_buf(),
            manifest,
        })
    }

    async fn render(&self, route: &RouteResponse) -> Result<WireResponse> {
        let mut res = WireResponse::new(route.status.unwrap_or(200));
        for (name, value) in &route.headers {
            res.headers.push((name.clone(), value.clone()));
        }
        if let Some(file) = &route.file {
            let path = self.app_dir.join(file);
            res.body = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
        } else if let Some(body) = &route.body {
            res.body = body.clone().into_bytes();
        }
        if res.header("content-type").is_none() && !res.body.is_empty() {
            res.headers
                .push(("content-type".to_string(), "text/plain; charset=utf-8".to_string()));
        }
        Ok(res)
    }
}

#[async_trait]
impl AppHandler for RoutesTable {
    async fn fetch(&self, req: &WireRequest) -> Result<WireResponse> {
        let path = req.uri.split('?').next().unwrap_or("/");

        if let Some(entry) = self.manifest.routes.get(path) {
            match entry {
                RouteEntry::Response(route) => return self.render(route).await,
                RouteEntry::MethodMap(map) => {
                    if let Some(route) = map.get(&req.method.to_ascii_uppercase()) {
                        return self.render(route).await;
                    }
                    return Ok(WireResponse::new(405).with_body("text/plain", "method not allowed"));
                }
            }
        }

        match &self.manifest.fallback {
            Some(route) => self.render(route).await,
            None => Ok(WireResponse::new(404).with_body("text/plain", "not found")),
        }
    }
}
