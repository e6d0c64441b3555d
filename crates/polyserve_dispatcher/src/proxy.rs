//! Per-app reverse-proxy layer.
//!
//! Rules are tested in order against the app-relative path; the first
//! match wins and the request never reaches the worker pool. HTTP
//! forwards stream the upstream response; WebSocket upgrades are piped
//! frame-for-frame until either side closes.

use crate::error::DispatchError;
use axum::body::Body;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use polyserve_protocol::{ErrorKind, ProxyRule, WorkerConfig};
use regex::Regex;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tracing::{debug, warn};

/// A rule with its pattern compiled. Patterns were validated at config
/// load, so compilation here cannot fail in practice.
pub struct CompiledProxyRule {
    pub regex: Regex,
    pub rule: ProxyRule,
}

pub fn compile_rules(config: &WorkerConfig) -> Vec<CompiledProxyRule> {
    config
        .proxy
        .iter()
        .filter_map(|rule| match Regex::new(&rule.pattern) {
            Ok(regex) => Some(CompiledProxyRule {
                regex,
                rule: rule.clone(),
            }),
            Err(err) => {
                warn!(pattern = %rule.pattern, %err, "skipping uncompilable proxy rule");
                None
            }
        })
        .collect()
}

/// First matching rule and the rewritten path (`$1…$N` substituted when
/// the rule carries a rewrite template).
pub fn match_rule<'a>(
    rules: &'a [CompiledProxyRule],
    inner_path: &str,
) -> Option<(&'a CompiledProxyRule, String)> {
    for compiled in rules {
        if let Some(caps) = compiled.regex.captures(inner_path) {
            let path = match &compiled.rule.rewrite {
                Some(template) => {
                    let mut out = String::new();
                    caps.expand(template, &mut out);
                    out
                }
                None => inner_path.to_string(),
            };
            return Some((compiled, path));
        }
    }
    None
}

/// Shared upstream clients; `insecure` skips TLS verification for rules
/// with `secure: false`.
pub struct ProxyClients {
    secure: reqwest::Client,
    insecure: reqwest::Client,
}

impl ProxyClients {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            secure: reqwest::Client::builder().build()?,
            insecure: reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .build()?,
        })
    }

    fn for_rule(&self, rule: &ProxyRule) -> &reqwest::Client {
        if rule.secure {
            &self.secure
        } else {
            &self.insecure
        }
    }
}

/// Forward an HTTP request to the rule's target, streaming the response
/// body back.
#[allow(clippy::too_many_arguments)]
pub async fn http_forward(
    clients: &ProxyClients,
    compiled: &CompiledProxyRule,
    rewritten_path: &str,
    query: Option<&str>,
    method: Method,
    headers: &HeaderMap,
    body: Vec<u8>,
) -> Result<Response, DispatchError> {
    let rule = &compiled.rule;
    let url = build_target_url(&rule.target, rewritten_path, query);
    debug!(%url, "proxying request upstream");

    let mut outbound = clients
        .for_rule(rule)
        .request(
            reqwest::Method::from_bytes(method.as_str().as_bytes()).map_err(|_| {
                DispatchError::new(ErrorKind::ProxyUpstreamFailed, "unsupported method")
            })?,
            &url,
        )
        .body(body);

    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        // With changeOrigin the upstream host comes from the target URL.
        if name == axum::http::header::HOST && rule.change_origin {
            continue;
        }
        if let Ok(value) = value.to_str() {
            outbound = outbound.header(name.as_str(), value);
        }
    }
    for (name, value) in &rule.headers {
        outbound = outbound.header(name, value);
    }

    let upstream = outbound.send().await.map_err(|err| {
        DispatchError::new(
            ErrorKind::ProxyUpstreamFailed,
            format!("upstream request failed: {err}"),
        )
    })?;

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response_headers.insert(name, value);
        }
    }

    let body = Body::from_stream(upstream.bytes_stream());
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// Upgrade the client connection and pipe frames to/from the upstream
/// WebSocket until either side closes.
pub fn ws_forward(
    ws: WebSocketUpgrade,
    compiled: &CompiledProxyRule,
    rewritten_path: &str,
    query: Option<&str>,
) -> Response {
    let url = ws_target_url(&compiled.rule.target, rewritten_path, query);
    ws.on_upgrade(move |client| async move {
        match connect_async(url.as_str()).await {
            Ok((upstream, _)) => pipe_ws(client, upstream).await,
            Err(err) => {
                warn!(%url, %err, "websocket upstream connect failed");
            }
        }
    })
    .into_response()
}

async fn pipe_ws(
    client: WebSocket,
    upstream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let Some(converted) = client_to_tungstenite(msg) else {
                break;
            };
            if upstream_tx.send(converted).await.is_err() {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let Some(converted) = tungstenite_to_client(msg) else {
                break;
            };
            if client_tx.send(converted).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::join!(client_to_upstream, upstream_to_client);
}

fn client_to_tungstenite(msg: WsMessage) -> Option<TungsteniteMessage> {
    match msg {
        WsMessage::Text(text) => Some(TungsteniteMessage::Text(text)),
        WsMessage::Binary(bytes) => Some(TungsteniteMessage::Binary(bytes)),
        WsMessage::Ping(bytes) => Some(TungsteniteMessage::Ping(bytes)),
        WsMessage::Pong(bytes) => Some(TungsteniteMessage::Pong(bytes)),
        WsMessage::Close(_) => None,
    }
}

fn tungstenite_to_client(msg: TungsteniteMessage) -> Option<WsMessage> {
    match msg {
        TungsteniteMessage::Text(text) => Some(WsMessage::Text(text)),
        TungsteniteMessage::Binary(bytes) => Some(WsMessage::Binary(bytes)),
        TungsteniteMessage::Ping(bytes) => Some(WsMessage::Ping(bytes)),
        TungsteniteMessage::Pong(bytes) => Some(WsMessage::Pong(bytes)),
        TungsteniteMessage::Close(_) | TungsteniteMessage::Frame(_) => None,
    }
}

fn build_target_url(target: &str, path: &str, query: Option<&str>) -> String {
    let base = target.trim_end_matches('/');
    match query {
        Some(query) => format!("{base}{path}?{query}"),
        None => format!("{base}{path}"),
    }
}

fn ws_target_url(target: &str, path: &str, query: Option<&str>) -> String {
    let url = build_target_url(target, path, query);
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}
