//! App resolution: `name[@selector]` -> concrete versioned directory.

use crate::error::DispatchError;
use semver::{Version, VersionReq};
use std::path::{Path, PathBuf};

/// The user-facing identifier from the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppKey {
    pub name: String,
    pub selector: Option<String>,
}

impl AppKey {
    /// Split at the last `@`. No `@` means "highest available".
    pub fn parse(raw: &str) -> Self {
        match raw.rsplit_once('@') {
            Some((name, selector)) if !name.is_empty() && !selector.is_empty() => Self {
                name: name.to_string(),
                selector: Some(selector.to_string()),
            },
            _ => Self {
                name: raw.to_string(),
                selector: None,
            },
        }
    }
}

impl std::fmt::Display for AppKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.selector {
            Some(selector) => write!(f, "{}@{}", self.name, selector),
            None => f.write_str(&self.name),
        }
    }
}

/// A resolved app: name, the version that won, and its directory.
#[derive(Debug, Clone)]
pub struct ResolvedApp {
    pub name: String,
    pub version: Version,
    pub dir: PathBuf,
}

/// Resolve an AppKey against the app tree. Subdirectories that do not
/// parse as semver are ignored; the maximum version satisfying the
/// selector wins (pre-releases rank below their release counterparts).
pub fn resolve(apps_dir: &Path, key: &AppKey) -> Result<ResolvedApp, DispatchError> {
    let not_found = || DispatchError::app_not_found(&key.to_string());

    let app_root = apps_dir.join(&key.name);
    let entries = std::fs::read_dir(&app_root).map_err(|_| not_found())?;

    let mut versions: Vec<Version> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().and_then(|s| Version::parse(s).ok()))
        .collect();
    versions.sort();

    let chosen = match &key.selector {
        None => versions.pop(),
        Some(selector) => {
            let req = selector_to_req(selector).ok_or_else(not_found)?;
            versions.into_iter().filter(|v| req.matches(v)).max()
        }
    };

    let version = chosen.ok_or_else(not_found)?;
    let dir = app_root.join(version.to_string());
    Ok(ResolvedApp {
        name: key.name.clone(),
        version,
        dir,
    })
}

/// Selector interpretation: a full version matches exactly; bare `N` is
/// `>=N.0.0 <(N+1).0.0`; bare `N.M` is `>=N.M.0 <N.(M+1).0`; anything
/// else is a standard range expression.
fn selector_to_req(selector: &str) -> Option<VersionReq> {
    let selector = selector.trim();

    if Version::parse(selector).is_ok() {
        return VersionReq::parse(&format!("={selector}")).ok();
    }
    if selector.chars().all(|c| c.is_ascii_digit()) && !selector.is_empty() {
        return VersionReq::parse(&format!("^{selector}")).ok();
    }
    if let Some((major, minor)) = selector.split_once('.') {
        let both_numeric = !major.is_empty()
            && !minor.is_empty()
            && major.chars().all(|c| c.is_ascii_digit())
            && minor.chars().all(|c| c.is_ascii_digit());
        if both_numeric {
            return VersionReq::parse(&format!("~{selector}")).ok();
        }
    }
    VersionReq::parse(selector).ok()
}
