//! Per-app worker configuration: schema, loading, validation.
//!
//! Sources, highest precedence first: `worker.config.json`, the
//! `workerConfig` field of `package.json`, built-in defaults. The chosen
//! source is used whole; there is no deep-merge across sources.
//!
//! Durations in source files are seconds when numeric; string forms
//! (`"500ms"`, `"30s"`, `"1m"`, `"24h"`) are also accepted. Internally
//! everything is milliseconds.

use crate::defaults;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed config in {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid config in {path}: {message}")]
    Schema { path: String, message: String },
}

/// Validated immutable per-app configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub entrypoint: Option<String>,
    pub idle_timeout_ms: u64,
    pub ttl_ms: u64,
    pub max_requests: u64,
    pub timeout_ms: u64,
    pub auto_install: bool,
    pub low_memory: bool,
    pub proxy: Vec<ProxyRule>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            entrypoint: None,
            idle_timeout_ms: defaults::DEFAULT_IDLE_TIMEOUT_MS,
            ttl_ms: defaults::DEFAULT_TTL_MS,
            max_requests: defaults::DEFAULT_MAX_REQUESTS,
            timeout_ms: defaults::DEFAULT_REQUEST_TIMEOUT_MS,
            auto_install: false,
            low_memory: false,
            proxy: Vec::new(),
        }
    }
}

impl WorkerConfig {
    /// Serialize for the worker-process environment binding.
    pub fn to_env_string(&self) -> String {
        // WorkerConfig serializes with derived serde; infallible for this shape.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_env_string(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// One proxy rule. Patterns are validated at load time, so `pattern`
/// always compiles; `target` already has `${NAME}` placeholders resolved.
/// Order is significant: first match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRule {
    pub pattern: String,
    pub target: String,
    pub rewrite: Option<String>,
    pub change_origin: bool,
    /// `false` skips upstream TLS verification.
    pub secure: bool,
    /// Whether WebSocket upgrades may take this rule.
    pub ws: bool,
    pub headers: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Raw on-disk schema (camelCase keys, duration fields in seconds/strings)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    entrypoint: Option<String>,
    idle_timeout: Option<DurationField>,
    ttl: Option<DurationField>,
    max_requests: Option<i64>,
    timeout: Option<DurationField>,
    #[serde(default)]
    auto_install: bool,
    #[serde(default)]
    low_memory: bool,
    #[serde(default)]
    proxy: Vec<RawProxyRule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProxyRule {
    pattern: String,
    target: String,
    rewrite: Option<String>,
    change_origin: Option<bool>,
    secure: Option<bool>,
    ws: Option<bool>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

/// Seconds when numeric, duration-string otherwise.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DurationField {
    Seconds(f64),
    Text(String),
}

impl DurationField {
    fn to_millis(&self, field: &str, path: &str) -> Result<u64, ConfigError> {
        match self {
            DurationField::Seconds(secs) => {
                if *secs < 0.0 || !secs.is_finite() {
                    return Err(ConfigError::Schema {
                        path: path.to_string(),
                        message: format!("{field} must be a non-negative number of seconds"),
                    });
                }
                Ok((secs * 1000.0).round() as u64)
            }
            DurationField::Text(text) => {
                parse_duration_ms(text).ok_or_else(|| ConfigError::Schema {
                    path: path.to_string(),
                    message: format!("{field} has unrecognized duration: {text:?}"),
                })
            }
        }
    }
}

/// Parse `"500ms"`, `"30s"`, `"1m"`, `"24h"` into milliseconds.
pub fn parse_duration_ms(text: &str) -> Option<u64> {
    let text = text.trim();
    let (value, unit) = match text.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => text.split_at(idx),
        None => return None,
    };
    let value: f64 = value.trim().parse().ok()?;
    if value < 0.0 || !value.is_finite() {
        return None;
    }
    let scale = match unit {
        "ms" => 1.0,
        "s" => 1_000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        _ => return None,
    };
    Some((value * scale).round() as u64)
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load the app's worker configuration from `app_dir`.
pub fn load(app_dir: &Path) -> Result<WorkerConfig, ConfigError> {
    let config_path = app_dir.join(defaults::WORKER_CONFIG_FILE);
    if config_path.exists() {
        let raw = read_json::<RawConfig>(&config_path)?;
        return validate(raw, &config_path.display().to_string());
    }

    let package_path = app_dir.join(defaults::PACKAGE_JSON_FILE);
    if package_path.exists() {
        let package: serde_json::Value = read_json(&package_path)?;
        if let Some(section) = package.get("workerConfig") {
            let path = format!("{}#workerConfig", package_path.display());
            let raw: RawConfig =
                serde_json::from_value(section.clone()).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?;
            return validate(raw, &path);
        }
    }

    Ok(WorkerConfig::default())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn validate(raw: RawConfig, path: &str) -> Result<WorkerConfig, ConfigError> {
    let mut config = WorkerConfig::default();
    config.entrypoint = raw.entrypoint;

    if let Some(field) = raw.idle_timeout {
        config.idle_timeout_ms = field.to_millis("idleTimeout", path)?;
    }
    if let Some(field) = raw.ttl {
        config.ttl_ms = field.to_millis("ttl", path)?;
    }
    if let Some(field) = raw.timeout {
        config.timeout_ms = field.to_millis("timeout", path)?;
    }
    if let Some(max) = raw.max_requests {
        if max < 0 {
            return Err(ConfigError::Schema {
                path: path.to_string(),
                message: "maxRequests must be non-negative".to_string(),
            });
        }
        config.max_requests = max as u64;
    }
    config.auto_install = raw.auto_install;
    config.low_memory = raw.low_memory;

    for rule in raw.proxy {
        if let Err(err) = regex::Regex::new(&rule.pattern) {
            warn!(pattern = %rule.pattern, %err, "dropping proxy rule with invalid pattern");
            continue;
        }
        config.proxy.push(ProxyRule {
            pattern: rule.pattern,
            target: substitute_env(&rule.target),
            rewrite: rule.rewrite,
            change_origin: rule.change_origin.unwrap_or(false),
            secure: rule.secure.unwrap_or(true),
            ws: rule.ws.unwrap_or(true),
            headers: rule.headers,
        });
    }

    Ok(config)
}

/// Resolve `${NAME}` placeholders from the host environment. Unset
/// variables become the empty string.
fn substitute_env(target: &str) -> String {
    static PLACEHOLDER: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern")
    });
    re.replace_all(target, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}
