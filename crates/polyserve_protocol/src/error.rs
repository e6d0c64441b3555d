//! Protocol errors and the runtime error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Frame-level protocol failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid opcode: 0x{0:02x}")]
    InvalidOpCode(u8),

    #[error("header too short: expected {expected} bytes, got {got}")]
    HeaderTooShort { expected: usize, got: usize },

    #[error("protocol version mismatch: expected 0x{expected:02x}, got 0x{got:02x}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("payload length mismatch: header says {expected}, got {got}")]
    PayloadLengthMismatch { expected: usize, got: usize },

    #[error("payload codec error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure kinds surfaced to clients. The kebab-case names are part of
/// the contract and round-trip across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    AppNotFound,
    InvalidConfig,
    WorkerSpawnFailed,
    WorkerTimeout,
    WorkerCrashed,
    ProxyUpstreamFailed,
    PoolShuttingDown,
    /// App handler failure inside a worker. Surfaced as a 500 carrying
    /// the handler's error message.
    AppError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AppNotFound => "app-not-found",
            ErrorKind::InvalidConfig => "invalid-config",
            ErrorKind::WorkerSpawnFailed => "worker-spawn-failed",
            ErrorKind::WorkerTimeout => "worker-timeout",
            ErrorKind::WorkerCrashed => "worker-crashed",
            ErrorKind::ProxyUpstreamFailed => "proxy-upstream-failed",
            ErrorKind::PoolShuttingDown => "pool-shutting-down",
            ErrorKind::AppError => "app-error",
        }
    }

    /// HTTP status the kind maps to.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::AppNotFound => 404,
            ErrorKind::InvalidConfig => 500,
            ErrorKind::WorkerSpawnFailed => 500,
            ErrorKind::WorkerTimeout => 504,
            ErrorKind::WorkerCrashed => 502,
            ErrorKind::ProxyUpstreamFailed => 502,
            ErrorKind::PoolShuttingDown => 503,
            ErrorKind::AppError => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
