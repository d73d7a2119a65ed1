//! Version-control capability.
//!
//! [`VersionControl`] is the narrow seam between orchestration logic and the
//! `git` executable. [`GitCli`] shells out; tests inject
//! [`crate::fakes::FakeVcs`].

use std::path::Path;

use async_trait::async_trait;

use crate::exec::{CommandOutput, Invocation};

/// Black-box version-control operations, each reporting success plus text.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Clone `url` into the (existing, empty) directory `dir`.
    /// `depth` of `None` clones full history.
    async fn clone_repo(&self, url: &str, dir: &Path, depth: Option<u32>) -> CommandOutput;

    /// Fetch all refs and tags from the remote.
    async fn fetch(&self, dir: &Path) -> CommandOutput;

    /// Discard local state and move onto the tip of the remote's default branch.
    async fn reset_to_remote_default(&self, dir: &Path) -> CommandOutput;

    /// Resolved commit id of HEAD.
    async fn head_commit(&self, dir: &Path) -> CommandOutput;

    /// Branch name when on a branch, otherwise the detached commit id.
    async fn current_ref(&self, dir: &Path) -> CommandOutput;

    /// Check out a branch, tag, or commit (tags and commits detach HEAD).
    async fn checkout(&self, dir: &Path, reference: &str) -> CommandOutput;

    async fn tag_exists(&self, dir: &Path, tag: &str) -> bool;

    /// Create an annotated tag locally.
    async fn create_tag(&self, dir: &Path, tag: &str, message: &str) -> CommandOutput;

    async fn push_tag(&self, dir: &Path, tag: &str) -> CommandOutput;

    async fn delete_tag(&self, dir: &Path, tag: &str) -> CommandOutput;

    async fn delete_remote_tag(&self, dir: &Path, tag: &str) -> CommandOutput;
}

/// [`VersionControl`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    fn git(&self, dir: &Path) -> Invocation {
        Invocation::new(&self.program).current_dir(dir)
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn clone_repo(&self, url: &str, dir: &Path, depth: Option<u32>) -> CommandOutput {
        let mut inv = self.git(dir).arg("clone").arg("-q");
        if let Some(depth) = depth {
            inv = inv.arg(format!("--depth={depth}"));
        }
        inv.arg(url).arg(".").run().await
    }

    async fn fetch(&self, dir: &Path) -> CommandOutput {
        self.git(dir)
            .args(["fetch", "-q", "--tags", "--force", "--prune", "origin"])
            .run()
            .await
    }

    async fn reset_to_remote_default(&self, dir: &Path) -> CommandOutput {
        let default_ref = self
            .git(dir)
            .args(["symbolic-ref", "refs/remotes/origin/HEAD"])
            .run()
            .await;
        if !default_ref.success {
            return default_ref;
        }
        let remote_ref = default_ref.trimmed().to_string();
        let branch = remote_ref
            .strip_prefix("refs/remotes/origin/")
            .unwrap_or(&remote_ref)
            .to_string();

        self.git(dir)
            .args(["checkout", "-q", "--force", "-B"])
            .arg(branch)
            .arg(remote_ref)
            .run()
            .await
    }

    async fn head_commit(&self, dir: &Path) -> CommandOutput {
        self.git(dir).args(["rev-parse", "HEAD"]).run().await
    }

    async fn current_ref(&self, dir: &Path) -> CommandOutput {
        let branch = self
            .git(dir)
            .args(["symbolic-ref", "-q", "--short", "HEAD"])
            .run()
            .await;
        if branch.success {
            return branch;
        }
        self.head_commit(dir).await
    }

    async fn checkout(&self, dir: &Path, reference: &str) -> CommandOutput {
        self.git(dir)
            .args(["checkout", "-q"])
            .arg(reference)
            .run()
            .await
    }

    async fn tag_exists(&self, dir: &Path, tag: &str) -> bool {
        self.git(dir)
            .args(["show-ref", "-q", "--verify"])
            .arg(format!("refs/tags/{tag}"))
            .run()
            .await
            .success
    }

    async fn create_tag(&self, dir: &Path, tag: &str, message: &str) -> CommandOutput {
        self.git(dir)
            .args(["tag", "-a"])
            .arg(tag)
            .arg("-m")
            .arg(message)
            .run()
            .await
    }

    async fn push_tag(&self, dir: &Path, tag: &str) -> CommandOutput {
        self.git(dir)
            .args(["push", "-q", "origin"])
            .arg(format!("refs/tags/{tag}"))
            .run()
            .await
    }

    async fn delete_tag(&self, dir: &Path, tag: &str) -> CommandOutput {
        self.git(dir).args(["tag", "-d"]).arg(tag).run().await
    }

    async fn delete_remote_tag(&self, dir: &Path, tag: &str) -> CommandOutput {
        self.git(dir)
            .args(["push", "-q", "--delete", "origin"])
            .arg(format!("refs/tags/{tag}"))
            .run()
            .await
    }
}
