//! HTTP entry point: internal routes, the `/:app` catch-all, proxy and
//! worker stages, metrics snapshots and the SSE stream.
//!
//! Internal `/_/…` routes are registered explicitly, so they bind before
//! the catch-all. App dispatch lives in the router fallback: it handles
//! every path shape (`/app`, `/app/`, `/app@1.2/deep/path`) without
//! fighting route-matcher edge cases.

use crate::apps::{self, LoadedApp};
use crate::config::RuntimeConfig;
use crate::error::DispatchError;
use crate::pool::Pool;
use crate::proxy::{self, ProxyClients};
use crate::resolver::{self, AppKey};
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use percent_encoding::percent_decode_str;
use polyserve_protocol::{defaults, WireRequest, WireResponse};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Maximum buffered request body (bodies cross the worker channel as one
/// message).
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub struct ServerState {
    pub config: RuntimeConfig,
    pub pool: Arc<Pool>,
    pub proxy_clients: ProxyClients,
}

pub type SharedState = Arc<ServerState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/_/metrics", get(metrics_handler))
        .route("/_/stats", get(stats_handler))
        .route("/_/sse", get(sse_handler))
        .fallback(dispatch_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics_handler(State(state): State<SharedState>) -> Response {
    Json(state.pool.metrics()).into_response()
}

async fn stats_handler(State(state): State<SharedState>) -> Response {
    Json(state.pool.stats()).into_response()
}

/// One stats snapshot immediately, then one per second. Nothing is
/// buffered for slow clients; the stream ends when they disconnect.
async fn sse_handler(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let interval = tokio::time::interval(Duration::from_secs(1));
    let stream = futures::stream::unfold((state, interval), |(state, mut interval)| async move {
        interval.tick().await;
        let snapshot = state.pool.stats();
        let event = Event::default()
            .json_data(&snapshot)
            .unwrap_or_else(|_| Event::default().data("{}"));
        Some((Ok(event), (state, interval)))
    });
    Sse::new(stream)
}

/// Everything that is not an internal route: `/`, `/:app`, `/:app/*`.
async fn dispatch_handler(
    State(state): State<SharedState>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    let response = dispatch(state.clone(), ws, req)
        .await
        .unwrap_or_else(|err| err.into_response());

    // Terminal non-2xx outcomes count as errors, whatever their source.
    // 1xx is not an outcome (WebSocket upgrades answer 101).
    let status = response.status();
    if !status.is_success() && !status.is_informational() {
        state.pool.counters().inc_total_errors();
    }
    response
}

async fn dispatch(
    state: SharedState,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Result<Response, DispatchError> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    let target = match split_app_path(&path) {
        Some((app_raw, inner_path)) => {
            let key = AppKey::parse(&app_raw);
            match resolver::resolve(&state.config.apps_dir, &key) {
                Ok(resolved) => Some((resolved, inner_path)),
                Err(err) => Some(shell_target(&state, req.method(), &path).ok_or(err)?),
            }
        }
        // Bare root: the app shell serves it when configured.
        None => shell_target(&state, req.method(), &path),
    };

    let Some((resolved, inner_path)) = target else {
        return Ok(banner());
    };

    let app = apps::load(resolved, &state.pool)?;

    // Proxy stage: first matching rule short-circuits the worker pool.
    if let Some((rule, rewritten)) = proxy::match_rule(&app.proxy, &inner_path) {
        state.pool.counters().inc_proxied_requests();
        debug!(app = %app.resolved.name, pattern = %rule.rule.pattern, "proxy rule matched");

        if let Some(ws) = ws {
            if rule.rule.ws {
                return Ok(proxy::ws_forward(ws, rule, &rewritten, query.as_deref()));
            }
        }

        let method = req.method().clone();
        let headers = req.headers().clone();
        let body = read_body(req).await?;
        return proxy::http_forward(
            &state.proxy_clients,
            rule,
            &rewritten,
            query.as_deref(),
            method,
            &headers,
            body,
        )
        .await;
    }

    // Worker stage.
    let wire_req = build_wire_request(&app, inner_path, query, req).await?;
    let wire_res = state
        .pool
        .serve(&app.resolved.dir, &app.config, &wire_req)
        .await?;
    Ok(wire_to_response(wire_res))
}

/// When the app shell is configured, unmatched GETs fall back to it with
/// the original path intact.
fn shell_target(
    state: &SharedState,
    method: &Method,
    full_path: &str,
) -> Option<(resolver::ResolvedApp, String)> {
    if *method != Method::GET {
        return None;
    }
    let shell = state.config.app_shell.as_deref()?;
    let key = AppKey::parse(shell);
    let resolved = resolver::resolve(&state.config.apps_dir, &key).ok()?;
    let inner = if full_path.is_empty() {
        "/".to_string()
    } else {
        full_path.to_string()
    };
    Some((resolved, inner))
}

fn banner() -> Response {
    let body = format!("polyserve {}\n", env!("CARGO_PKG_VERSION"));
    (StatusCode::OK, body).into_response()
}

/// `/name@sel/deep/path` -> (`name@sel`, `/deep/path`). Root paths
/// return `None`. Only the app segment is percent-decoded; the inner
/// path is forwarded as received.
fn split_app_path(path: &str) -> Option<(String, String)> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return None;
    }
    let (app_raw, rest) = match trimmed.split_once('/') {
        Some((app, rest)) => (app, rest),
        None => (trimmed, ""),
    };
    let app = percent_decode_str(app_raw).decode_utf8_lossy().to_string();
    Some((app, format!("/{rest}")))
}

async fn read_body(req: Request) -> Result<Vec<u8>, DispatchError> {
    let bytes = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|err| {
            DispatchError::new(
                polyserve_protocol::ErrorKind::AppError,
                format!("unreadable request body: {err}"),
            )
        })?;
    Ok(bytes.to_vec())
}

async fn build_wire_request(
    app: &LoadedApp,
    inner_path: String,
    query: Option<String>,
    req: Request,
) -> Result<WireRequest, DispatchError> {
    let method = req.method().as_str().to_string();
    let uri = match query {
        Some(query) => format!("{inner_path}?{query}"),
        None => inner_path,
    };

    let mut headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter(|(name, _)| *name != defaults::APP_NAME_HEADER)
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    headers.push((
        defaults::APP_NAME_HEADER.to_string(),
        app.resolved.name.clone(),
    ));

    let body = read_body(req).await?;
    Ok(WireRequest {
        method,
        uri,
        headers,
        body,
    })
}

fn wire_to_response(wire: WireResponse) -> Response {
    let status = StatusCode::from_u16(wire.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers = HeaderMap::new();
    for (name, value) in &wire.headers {
        // The buffered body is authoritative; framing headers from the
        // worker would conflict with it.
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }

    let mut response = Response::new(Body::from(wire.body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_app_path() {
        assert_eq!(split_app_path("/"), None);
        assert_eq!(split_app_path(""), None);
        assert_eq!(
            split_app_path("/hello"),
            Some(("hello".to_string(), "/".to_string()))
        );
        assert_eq!(
            split_app_path("/hello/"),
            Some(("hello".to_string(), "/".to_string()))
        );
        assert_eq!(
            split_app_path("/api/things/1"),
            Some(("api".to_string(), "/things/1".to_string()))
        );
    }

    #[test]
    fn test_split_decodes_app_segment_only() {
        assert_eq!(
            split_app_path("/api%401.2/x%20y"),
            Some(("api@1.2".to_string(), "/x%20y".to_string()))
        );
    }

    #[test]
    fn test_wire_to_response_drops_framing_headers() {
        let mut wire = WireResponse::new(201).with_body("text/plain", "made");
        wire.headers
            .push(("content-length".to_string(), "999".to_string()));
        let response = wire_to_response(wire);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get("content-length").is_none());
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain"
        );
    }
}
