//! Built-in handlers, selected with a `builtin:<name>` entrypoint.
//!
//! These exist for operator probes and for exercising the runtime
//! without app content: `hello` and `echo` answer immediately, `sleep`
//! waits for `?ms=N` before answering, `hang` never answers.

use crate::handler::AppHandler;
use anyhow::Result;
use async_trait::async_trait;
use polyserve_protocol::{WireRequest, WireResponse};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Hello,
    Echo,
    Sleep,
    Hang,
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Self> {
        match name {
            "hello" => Some(Builtin::Hello),
            "echo" => Some(Builtin::Echo),
            "sleep" => Some(Builtin::Sleep),
            "hang" => Some(Builtin::Hang),
            _ => None,
        }
    }
}

#[async_trait]
impl AppHandler for Builtin {
    async fn fetch(&self, req: &WireRequest) -> Result<WireResponse> {
        match self {
            Builtin::Hello => Ok(WireResponse::new(200).with_body("text/plain", "hi")),
            Builtin::Echo => {
                let payload = json!({
                    "method": req.method,
                    "uri": req.uri,
                    "headers": req.headers,
                    "body": String::from_utf8_lossy(&req.body),
                });
                Ok(WireResponse::new(200)
                    .with_body("application/json", serde_json::to_vec(&payload)?))
            }
            Builtin::Sleep => {
                let ms = query_param(&req.uri, "ms")
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(100);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(WireResponse::new(200).with_body("text/plain", format!("slept {ms}ms")))
            }
            Builtin::Hang => {
                std::future::pending::<()>().await;
                unreachable!("pending future never resolves")
            }
        }
    }
}

fn query_param<'a>(uri: &'a str, name: &str) -> Option<&'a str> {
    let query = uri.split_once('?')?.1;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_request(uri: &str) -> WireRequest {
        WireRequest {
            method: "GET".to_string(),
            uri: uri.to_string(),
            headers: Vec::new(),
            body: b"ping".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_hello() {
        let res = Builtin::Hello.fetch(&make_request("/")).await.unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.body, b"hi");
    }

    #[tokio::test]
    async fn test_echo_reflects_request() {
        let res = Builtin::Echo.fetch(&make_request("/x?q=1")).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&res.body).unwrap();
        assert_eq!(value["method"], "GET");
        assert_eq!(value["uri"], "/x?q=1");
        assert_eq!(value["body"], "ping");
    }

    #[tokio::test]
    async fn test_sleep_honors_ms_param() {
        let start = std::time::Instant::now();
        let res = Builtin::Sleep
            .fetch(&make_request("/?ms=20"))
            .await
            .unwrap();
        assert_eq!(res.status, 200);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_lookup() {
        assert_eq!(Builtin::lookup("hang"), Some(Builtin::Hang));
        assert_eq!(Builtin::lookup("nope"), None);
    }
}
