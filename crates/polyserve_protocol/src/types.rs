//! Typed payloads carried inside protocol frames.

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};

/// An HTTP request crossing the dispatcher -> worker boundary.
///
/// The URI is already stripped of the `/:app` prefix; the worker sees its
/// own root at `/`. Bodies travel base64-encoded inside the JSON payload
/// (single message, no streaming).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub method: String,
    /// Path and query, e.g. `/api/things?limit=3`
    pub uri: String,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_bytes", default)]
    pub body: Vec<u8>,
}

impl WireRequest {
    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// An HTTP response crossing the worker -> dispatcher boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_bytes", default)]
    pub body: Vec<u8>,
}

impl WireResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.headers
            .push(("content-type".to_string(), content_type.to_string()));
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: String) {
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }
}

/// READY handshake payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub pid: Option<u32>,
    pub app_dir: String,
}

/// ERROR payload, bidirectional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Worker lifecycle state as the pool sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Spawning,
    Ready,
    Busy,
    Draining,
    Terminated,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Spawning => "spawning",
            WorkerStatus::Ready => "ready",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Draining => "draining",
            WorkerStatus::Terminated => "terminated",
        }
    }

    /// States that count as "live" for the one-worker-per-key invariant.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Spawning | WorkerStatus::Ready | WorkerStatus::Busy
        )
    }
}

mod body_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_request_body_roundtrip() {
        let req = WireRequest {
            method: "POST".to_string(),
            uri: "/things?limit=3".to_string(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: vec![0, 159, 146, 150], // not valid UTF-8 on purpose
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: WireRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.body, req.body);
        assert_eq!(back.header("Content-Type"), Some("application/json"));
    }

    #[test]
    fn test_wire_response_set_header_replaces() {
        let mut res = WireResponse::new(200).with_body("text/html", "<html></html>");
        res.set_header("Content-Type", "text/plain".to_string());
        assert_eq!(res.header("content-type"), Some("text/plain"));
        assert_eq!(res.headers.len(), 1);
    }

    #[test]
    fn test_worker_status_live_states() {
        assert!(WorkerStatus::Spawning.is_live());
        assert!(WorkerStatus::Ready.is_live());
        assert!(WorkerStatus::Busy.is_live());
        assert!(!WorkerStatus::Draining.is_live());
        assert!(!WorkerStatus::Terminated.is_live());
    }
}
