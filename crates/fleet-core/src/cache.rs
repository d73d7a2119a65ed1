//! Local working-copy cache.
//!
//! One directory per repository under `cache_root`, named after the
//! repository slug. Directory presence is the only state kept between runs.
//! [`RepoCache::sync`] clones a missing copy or fetches and hard-resets an
//! existing one onto the remote default branch; either failure is fatal.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::model::Repository;
use crate::obs::{emit_cache_pruned, emit_cache_synced};
use crate::vcs::VersionControl;

/// A synced working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingCopy {
    pub repo: String,
    pub path: PathBuf,
    /// Commit HEAD resolved to after the sync.
    pub commit: String,
    /// `true` when this sync cloned the repository.
    pub created: bool,
}

/// Owns the on-disk working copies of the configured repositories.
#[derive(Clone)]
pub struct RepoCache {
    config: Arc<FleetConfig>,
    vcs: Arc<dyn VersionControl>,
}

impl RepoCache {
    pub fn new(config: Arc<FleetConfig>, vcs: Arc<dyn VersionControl>) -> Self {
        Self { config, vcs }
    }

    pub fn root(&self) -> &Path {
        &self.config.cache_root
    }

    pub fn vcs(&self) -> &Arc<dyn VersionControl> {
        &self.vcs
    }

    /// Working-copy directory for a repository slug.
    pub fn repo_dir(&self, name: &str) -> PathBuf {
        self.config.cache_root.join(name)
    }

    /// Create or refresh the working copy of `repo`.
    ///
    /// Idempotent: with no remote change, repeated calls resolve to the same
    /// commit.
    pub async fn sync(&self, repo: &Repository) -> Result<WorkingCopy> {
        let dir = self.repo_dir(&repo.name);
        let created = !dir.exists();
        if created {
            self.create(repo, &dir).await?;
        } else {
            self.refresh(repo, &dir).await?;
        }

        let head = self.vcs.head_commit(&dir).await;
        if !head.success {
            return Err(FleetError::CacheRefresh {
                repo: repo.name.clone(),
                path: dir,
                output: head.output,
            });
        }
        let commit = head.trimmed().to_string();
        emit_cache_synced(&repo.name, created, &commit);

        Ok(WorkingCopy {
            repo: repo.name.clone(),
            path: dir,
            commit,
            created,
        })
    }

    async fn create(&self, repo: &Repository, dir: &Path) -> Result<()> {
        info!(repo = %repo.name, path = %dir.display(), "creating cached git repository");
        tokio::fs::create_dir_all(dir).await?;

        let url = self.config.remote_url(&repo.name);
        let depth = match self.config.clone_depth {
            0 => None,
            n => Some(n),
        };
        let out = self.vcs.clone_repo(&url, dir, depth).await;
        if !out.success {
            // Presence marks a valid copy; drop the partial clone.
            tokio::fs::remove_dir_all(dir).await.ok();
            return Err(FleetError::CacheCreate {
                repo: repo.name.clone(),
                path: dir.to_path_buf(),
                output: out.output,
            });
        }
        Ok(())
    }

    async fn refresh(&self, repo: &Repository, dir: &Path) -> Result<()> {
        debug!(repo = %repo.name, path = %dir.display(), "updating cached git repository");
        let fetch = self.vcs.fetch(dir).await;
        if !fetch.success {
            return Err(FleetError::CacheRefresh {
                repo: repo.name.clone(),
                path: dir.to_path_buf(),
                output: fetch.output,
            });
        }
        let reset = self.vcs.reset_to_remote_default(dir).await;
        if !reset.success {
            return Err(FleetError::CacheRefresh {
                repo: repo.name.clone(),
                path: dir.to_path_buf(),
                output: reset.output,
            });
        }
        Ok(())
    }

    /// Sync every repository with bounded parallelism. Every sync runs to
    /// completion; the first failure (in completion order) is then returned.
    /// Results are sorted by repository name.
    pub async fn sync_all(&self, repos: &[Repository]) -> Result<Vec<WorkingCopy>> {
        let outcomes: Vec<Result<WorkingCopy>> = stream::iter(repos.iter())
            .map(|repo| self.sync(repo))
            .buffer_unordered(self.config.parallelism())
            .collect()
            .await;
        let mut copies = outcomes.into_iter().collect::<Result<Vec<_>>>()?;
        copies.sort_by(|a, b| a.repo.cmp(&b.repo));
        Ok(copies)
    }

    /// Delete cached directories whose slug is not in `active`.
    ///
    /// Directories that are a path prefix of an active slug (the "org" level
    /// of "org/project") are descended into, never deleted. Loose files are
    /// left alone. Returns the removed paths.
    pub fn prune(&self, active: &[Repository]) -> Result<Vec<PathBuf>> {
        let root = self.root();
        if !root.exists() {
            return Ok(Vec::new());
        }
        let names: BTreeSet<&str> = active.iter().map(|r| r.name.as_str()).collect();
        let mut removed = Vec::new();
        prune_dir(root, "", &names, &mut removed)?;
        removed.sort();
        Ok(removed)
    }
}

fn prune_dir(
    dir: &Path,
    prefix: &str,
    active: &BTreeSet<&str>,
    removed: &mut Vec<PathBuf>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };

        if active.contains(rel.as_str()) {
            continue;
        }
        let nested = format!("{rel}/");
        if active.iter().any(|a| a.starts_with(&nested)) {
            prune_dir(&entry.path(), &rel, active, removed)?;
            continue;
        }

        let path = entry.path();
        std::fs::remove_dir_all(&path)?;
        emit_cache_pruned(&path.display().to_string());
        removed.push(path);
    }
    Ok(())
}
