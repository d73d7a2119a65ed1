//! SSH reachability checks.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::RepoCache;
use crate::exec::{CommandOutput, Invocation};
use crate::model::{DeployResult, DeployUnit, Repository, UnitState};
use crate::release::ReleaseTool;

/// `ssh -O check HOST`: succeeds when a control-master session is up.
pub async fn check_control_master(host: &str) -> CommandOutput {
    Invocation::new("ssh").args(["-O", "check"]).arg(host).run().await
}

/// Runs the release tool's `ssh_check` task per repository.
pub struct SshChecker {
    cache: RepoCache,
    release: Arc<dyn ReleaseTool>,
}

impl SshChecker {
    pub fn new(cache: RepoCache, release: Arc<dyn ReleaseTool>) -> Self {
        Self { cache, release }
    }

    /// One sequential check per repository, each preceded by the release
    /// tool's prepare step. A failure is recorded and the next repository is
    /// still checked.
    pub async fn check_all(&self, repos: &[Repository], environment: &str) -> Vec<DeployResult> {
        info!(repos = repos.len(), environment = %environment, "checking ssh connections");
        let mut results = Vec::with_capacity(repos.len());
        for repo in repos {
            let dir = self.cache.repo_dir(&repo.name);
            let prepared = self.release.prepare(&dir).await;
            if !prepared.success {
                warn!(repo = %repo.name, output = %prepared.trimmed(), "release tool prepare failed");
            }
            let out = self.release.ssh_check(&dir, environment).await;
            if !out.success {
                warn!(repo = %repo.name, environment = %environment, "ssh check failed");
            }
            results.push(DeployResult {
                unit: DeployUnit {
                    repo: repo.name.clone(),
                    environment: environment.to_string(),
                    primary: true,
                },
                state: UnitState::Running.finish(out.success),
                output: out.output,
            });
        }
        results.sort_by(|a, b| a.unit.repo.cmp(&b.unit.repo));
        results
    }
}
