//! Dispatcher error type: a taxonomy kind plus a human message.
//!
//! The kind decides the HTTP status; the body is always
//! `{"error": "<message>"}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use polyserve_protocol::ErrorKind;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct DispatchError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DispatchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn app_not_found(key: &str) -> Self {
        Self::new(ErrorKind::AppNotFound, format!("App not found: {key}"))
    }

    pub fn shutting_down() -> Self {
        Self::new(ErrorKind::PoolShuttingDown, "Runtime is shutting down")
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            DispatchError::app_not_found("x").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            DispatchError::new(ErrorKind::WorkerTimeout, "t").status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            DispatchError::shutting_down().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_not_found_message_shape() {
        let err = DispatchError::app_not_found("api@3");
        assert_eq!(err.message, "App not found: api@3");
    }
}
