//! Release tags across the fleet.
//!
//! Create, delete and verify run per repository in parallel and are
//! failure-isolated: one repository's error never stops the others, and the
//! caller gets one outcome per repository.

use std::collections::BTreeMap;
use std::fmt;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::RepoCache;
use crate::error::{FleetError, Result};
use crate::model::Repository;

/// Fail with [`FleetError::MissingTag`] unless every working copy has `tag`.
pub async fn ensure_tag_present(cache: &RepoCache, tag: &str, repos: &[Repository]) -> Result<()> {
    let mut missing = Vec::new();
    for repo in repos {
        let dir = cache.repo_dir(&repo.name);
        if !cache.vcs().tag_exists(&dir, tag).await {
            missing.push(repo.name.clone());
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(FleetError::MissingTag {
            tag: tag.to_string(),
            repos: missing,
        })
    }
}

/// Outcome of creating or deleting a tag in one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagOutcome {
    pub repo: String,
    pub success: bool,
    pub output: String,
}

/// Whether a repository carries a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TagStatus {
    Found,
    NotFound,
    /// The repository could not be queried.
    Error(String),
}

impl fmt::Display for TagStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Found => f.write_str("found"),
            Self::NotFound => f.write_str("NOT FOUND"),
            Self::Error(detail) => write!(f, "error: {detail}"),
        }
    }
}

pub struct TagManager {
    cache: RepoCache,
    parallelism: usize,
}

impl TagManager {
    pub fn new(cache: RepoCache, parallelism: usize) -> Self {
        Self {
            cache,
            parallelism: parallelism.max(1),
        }
    }

    /// Create an annotated tag at each working copy's HEAD and push it.
    pub async fn create(&self, tag: &str, message: &str, repos: &[Repository]) -> Vec<TagOutcome> {
        info!(tag = %tag, repos = repos.len(), "creating tag");
        let mut outcomes: Vec<TagOutcome> = stream::iter(repos.iter())
            .map(|repo| self.create_one(tag, message, repo))
            .buffer_unordered(self.parallelism)
            .collect()
            .await;
        outcomes.sort_by(|a, b| a.repo.cmp(&b.repo));
        outcomes
    }

    async fn create_one(&self, tag: &str, message: &str, repo: &Repository) -> TagOutcome {
        let dir = self.cache.repo_dir(&repo.name);
        let vcs = self.cache.vcs();

        let created = vcs.create_tag(&dir, tag, message).await;
        if !created.success {
            warn!(repo = %repo.name, tag = %tag, "tag creation failed");
            return TagOutcome {
                repo: repo.name.clone(),
                success: false,
                output: created.output,
            };
        }
        let pushed = vcs.push_tag(&dir, tag).await;
        if !pushed.success {
            warn!(repo = %repo.name, tag = %tag, "tag push failed");
        }
        TagOutcome {
            repo: repo.name.clone(),
            success: pushed.success,
            output: format!("{}{}", created.output, pushed.output),
        }
    }

    /// Delete `tag` locally (when present) and from the remote.
    pub async fn delete(&self, tag: &str, repos: &[Repository]) -> Vec<TagOutcome> {
        info!(tag = %tag, repos = repos.len(), "deleting tag");
        let mut outcomes: Vec<TagOutcome> = stream::iter(repos.iter())
            .map(|repo| self.delete_one(tag, repo))
            .buffer_unordered(self.parallelism)
            .collect()
            .await;
        outcomes.sort_by(|a, b| a.repo.cmp(&b.repo));
        outcomes
    }

    async fn delete_one(&self, tag: &str, repo: &Repository) -> TagOutcome {
        let dir = self.cache.repo_dir(&repo.name);
        let vcs = self.cache.vcs();

        let mut output = String::new();
        if vcs.tag_exists(&dir, tag).await {
            let local = vcs.delete_tag(&dir, tag).await;
            output.push_str(&local.output);
            if !local.success {
                return TagOutcome {
                    repo: repo.name.clone(),
                    success: false,
                    output,
                };
            }
        }
        let remote = vcs.delete_remote_tag(&dir, tag).await;
        output.push_str(&remote.output);
        if !remote.success {
            warn!(repo = %repo.name, tag = %tag, "remote tag deletion failed");
        }
        TagOutcome {
            repo: repo.name.clone(),
            success: remote.success,
            output,
        }
    }

    /// Fetch each working copy and report whether it carries `tag`.
    pub async fn verify(&self, tag: &str, repos: &[Repository]) -> BTreeMap<String, TagStatus> {
        stream::iter(repos.iter())
            .map(|repo| async move { (repo.name.clone(), self.verify_one(tag, repo).await) })
            .buffer_unordered(self.parallelism)
            .collect()
            .await
    }

    async fn verify_one(&self, tag: &str, repo: &Repository) -> TagStatus {
        let dir = self.cache.repo_dir(&repo.name);
        let vcs = self.cache.vcs();

        let fetched = vcs.fetch(&dir).await;
        if !fetched.success {
            return TagStatus::Error(fetched.trimmed().to_string());
        }
        if vcs.tag_exists(&dir, tag).await {
            TagStatus::Found
        } else {
            TagStatus::NotFound
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;
    use crate::config::FleetConfig;
    use crate::fakes::FakeVcs;

    async fn synced(root: &Path, vcs: Arc<FakeVcs>, names: &[&str]) -> (RepoCache, Vec<Repository>) {
        let config = FleetConfig {
            cache_root: root.to_path_buf(),
            ..Default::default()
        };
        let cache = RepoCache::new(Arc::new(config), vcs);
        let repos: Vec<Repository> = names.iter().map(|n| Repository::new(*n)).collect();
        cache.sync_all(&repos).await.unwrap();
        (cache, repos)
    }

    #[tokio::test]
    async fn test_ensure_tag_present_names_missing_repos() {
        let tmp = tempfile::tempdir().unwrap();
        let vcs = Arc::new(FakeVcs::new());
        vcs.add_remote("org/a", "a1");
        vcs.add_remote("org/b", "b1");
        vcs.add_remote_tag("org/a", "rel-1", "a1");
        let (cache, repos) = synced(tmp.path(), vcs, &["org/a", "org/b"]).await;

        let err = ensure_tag_present(&cache, "rel-1", &repos).await.unwrap_err();
        match err {
            FleetError::MissingTag { tag, repos } => {
                assert_eq!(tag, "rel-1");
                assert_eq!(repos, vec!["org/b".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_create_pushes_and_isolates_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let vcs = Arc::new(FakeVcs::new());
        for name in ["org/a", "org/b", "org/c"] {
            vcs.add_remote(name, "c1");
        }
        let (cache, repos) = synced(tmp.path(), vcs.clone(), &["org/a", "org/b", "org/c"]).await;
        vcs.fail_operation_for("push_tag", "org/b");

        let outcomes = TagManager::new(cache, 2).create("rel-2", "created by fleet", &repos).await;

        let ok: Vec<_> = outcomes.iter().map(|o| (o.repo.as_str(), o.success)).collect();
        assert_eq!(ok, vec![("org/a", true), ("org/b", false), ("org/c", true)]);
        assert!(vcs.remote_has_tag("org/a", "rel-2"));
        assert!(!vcs.remote_has_tag("org/b", "rel-2"));
    }

    #[tokio::test]
    async fn test_verify_reports_every_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let vcs = Arc::new(FakeVcs::new());
        for name in ["org/a", "org/b", "org/c"] {
            vcs.add_remote(name, "c1");
        }
        let (cache, repos) = synced(tmp.path(), vcs.clone(), &["org/a", "org/b", "org/c"]).await;
        vcs.add_remote_tag("org/a", "rel-3", "c1");
        vcs.add_remote_tag("org/c", "rel-3", "c1");

        let statuses = TagManager::new(cache, 3).verify("rel-3", &repos).await;
        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses["org/a"], TagStatus::Found);
        assert_eq!(statuses["org/b"], TagStatus::NotFound);
        assert_eq!(statuses["org/c"], TagStatus::Found);
    }

    #[tokio::test]
    async fn test_delete_removes_remote_tag() {
        let tmp = tempfile::tempdir().unwrap();
        let vcs = Arc::new(FakeVcs::new());
        vcs.add_remote("org/a", "c1");
        vcs.add_remote_tag("org/a", "rel-4", "c1");
        let (cache, repos) = synced(tmp.path(), vcs.clone(), &["org/a"]).await;

        let outcomes = TagManager::new(cache, 1).delete("rel-4", &repos).await;
        assert!(outcomes[0].success);
        assert!(!vcs.remote_has_tag("org/a", "rel-4"));
    }
}
