//! Runtime configuration, environment-driven.

use anyhow::{bail, Result};
use polyserve_protocol::defaults;
use std::path::PathBuf;

/// Settings for one dispatcher instance, assembled in `main` and passed
/// down explicitly.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root of the app tree: `{apps_dir}/{name}/{semver}/`.
    pub apps_dir: PathBuf,
    pub port: u16,
    /// Maximum concurrent workers.
    pub pool_size: usize,
    /// App serving the root path when no `/:app` prefix matches.
    pub app_shell: Option<String>,
    /// Back-off granularity for pool waits.
    pub delay_ms: u64,
    /// Informational only.
    pub node_env: String,
}

impl RuntimeConfig {
    pub fn new(apps_dir: PathBuf) -> Self {
        Self {
            apps_dir,
            port: defaults::DEFAULT_PORT,
            pool_size: defaults::DEFAULT_POOL_SIZE,
            app_shell: None,
            delay_ms: defaults::DEFAULT_DELAY_MS,
            node_env: "development".to_string(),
        }
    }

    /// Fatal-at-startup checks.
    pub fn validate(&self) -> Result<()> {
        if !self.apps_dir.is_dir() {
            bail!("APPS_DIR does not exist: {}", self.apps_dir.display());
        }
        if self.pool_size == 0 {
            bail!("POOL_SIZE must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::new(PathBuf::from("/tmp"));
        assert_eq!(config.port, 8080);
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.delay_ms, 100);
        assert!(config.app_shell.is_none());
    }

    #[test]
    fn test_validate_missing_apps_dir() {
        let config = RuntimeConfig::new(PathBuf::from("/definitely/not/here"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_pool_size() {
        let dir = TempDir::new().unwrap();
        let mut config = RuntimeConfig::new(dir.path().to_path_buf());
        config.pool_size = 0;
        assert!(config.validate().is_err());
    }
}
