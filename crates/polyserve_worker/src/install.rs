//! Dependency-install hook, run before handler construction when
//! `autoInstall` is set.

use anyhow::{bail, Context, Result};
use polyserve_protocol::defaults;
use std::path::Path;
use tracing::info;

/// Run `{app_dir}/install.sh` if present. A missing hook is a no-op; a
/// non-zero exit aborts worker startup.
pub async fn run_install_hook(app_dir: &Path) -> Result<()> {
    let hook = app_dir.join(defaults::INSTALL_HOOK_FILE);
    if !hook.exists() {
        return Ok(());
    }

    info!(hook = %hook.display(), "running install hook");
    let status = tokio::process::Command::new("sh")
        .arg(&hook)
        .current_dir(app_dir)
        .status()
        .await
        .with_context(|| format!("failed to run {}", hook.display()))?;

    if !status.success() {
        bail!("install hook exited with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_hook_is_noop() {
        let dir = TempDir::new().unwrap();
        assert!(run_install_hook(dir.path()).await.is_ok());
    }

    #[tokio::test]
    async fn test_successful_hook() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("install.sh"), "touch installed.marker\n").unwrap();
        run_install_hook(dir.path()).await.unwrap();
        assert!(dir.path().join("installed.marker").exists());
    }

    #[tokio::test]
    async fn test_failing_hook_aborts() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("install.sh"), "exit 3\n").unwrap();
        assert!(run_install_hook(dir.path()).await.is_err());
    }
}
