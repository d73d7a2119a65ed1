//! Lockfile reading: the resolved version of a named dependency.

use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use crate::error::{FleetError, Result};

/// Resolves a dependency's locked version inside a working copy.
#[async_trait]
pub trait ManifestReader: Send + Sync {
    /// `Ok(None)` when the lockfile or the dependency entry is absent.
    async fn resolved_version(&self, dir: &Path, dependency: &str) -> Result<Option<String>>;
}

/// Reads Bundler `Gemfile.lock` or Cargo `Cargo.lock` files, chosen by file name.
#[derive(Debug, Clone)]
pub struct LockfileReader {
    lockfile: String,
}

impl LockfileReader {
    pub fn new(lockfile: impl Into<String>) -> Self {
        Self {
            lockfile: lockfile.into(),
        }
    }

    fn parse(&self, contents: &str, dependency: &str) -> Result<Option<String>> {
        if self.lockfile.ends_with("Cargo.lock") {
            cargo_lock_version(contents, dependency)
        } else {
            Ok(gemfile_lock_version(contents, dependency))
        }
    }
}

#[async_trait]
impl ManifestReader for LockfileReader {
    async fn resolved_version(&self, dir: &Path, dependency: &str) -> Result<Option<String>> {
        let path = dir.join(&self.lockfile);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.parse(&contents, dependency).map_err(|e| FleetError::Manifest {
            repo: dir.display().to_string(),
            detail: e.to_string(),
        })
    }
}

/// Locked version from a Bundler lockfile's `specs:` entries (four-space
/// indented `name (version)` lines). A platform suffix is dropped.
pub fn gemfile_lock_version(contents: &str, dependency: &str) -> Option<String> {
    let spec_line = Regex::new(r"^    ([^\s(]+) \(([^)]+)\)\s*$").ok()?;
    contents
        .lines()
        .filter_map(|line| spec_line.captures(line))
        .find(|caps| &caps[1] == dependency)
        .map(|caps| {
            let version = &caps[2];
            version
                .split_once('-')
                .map(|(v, _platform)| v)
                .unwrap_or(version)
                .to_string()
        })
}

#[derive(Debug, Deserialize)]
struct CargoLock {
    #[serde(default)]
    package: Vec<CargoLockPackage>,
}

#[derive(Debug, Deserialize)]
struct CargoLockPackage {
    name: String,
    version: String,
}

/// Locked version from a `Cargo.lock`. When several versions of the crate are
/// locked, the first entry wins.
pub fn cargo_lock_version(contents: &str, dependency: &str) -> Result<Option<String>> {
    let lock: CargoLock = toml::from_str(contents)?;
    Ok(lock
        .package
        .into_iter()
        .find(|p| p.name == dependency)
        .map(|p| p.version))
}
