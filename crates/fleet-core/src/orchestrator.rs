//! Fleet deploy orchestration.
//!
//! A run goes through fixed phases, and only the last one dispatches work:
//!
//! 1. select repositories and drop those that skip the environment
//! 2. sync and prepare working copies (and prune when the whole fleet is
//!    selected)
//! 3. dependency consistency gate
//! 4. tag presence pre-flight
//! 5. confirmation gate
//! 6. parallel fan-out of deploy units, each repository audited once its
//!    units are done when an audit tool is attached
//!
//! Phases 1-5 fail fast with a [`FleetError`]. Once dispatch begins every
//! unit runs to completion and failures are data in [`DeployResult`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditReport, AuditTool, RepoAudit};
use crate::cache::RepoCache;
use crate::config::{FleetConfig, RepoSelection};
use crate::consistency::{ConsistencyChecker, ConsistencyReport};
use crate::error::{FleetError, Result};
use crate::gate::{ConfirmationGate, Prompter};
use crate::manifest::ManifestReader;
use crate::model::{DeployResult, DeployTarget, DeployUnit, Repository, UnitState};
use crate::obs::{emit_unit_finished, emit_unit_started};
use crate::release::{prepare_all, ReleaseTool};
use crate::tags::ensure_tag_present;

/// Everything a deploy run needs from the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub environment: String,
    pub target: DeployTarget,
    pub selection: RepoSelection,
    /// Use the working copies as they are.
    pub skip_update: bool,
}

/// Outcome of a full deploy run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRun {
    pub environment: String,
    pub target: DeployTarget,
    /// Present when a dependency is configured and some repository tracks it.
    pub consistency: Option<ConsistencyReport>,
    /// Sorted by repository; within a repository the primary unit comes first.
    pub results: Vec<DeployResult>,
    /// Present when an audit tool is attached.
    pub audit: Option<AuditReport>,
    pub status_page: Option<String>,
}

impl DeployRun {
    pub fn failed(&self) -> impl Iterator<Item = &DeployResult> {
        self.results.iter().filter(|r| !r.succeeded())
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed().next().is_none()
    }
}

pub struct DeployOrchestrator {
    config: Arc<FleetConfig>,
    cache: RepoCache,
    release: Arc<dyn ReleaseTool>,
    manifest: Arc<dyn ManifestReader>,
    before_command: Option<String>,
    audit: Option<Arc<dyn AuditTool>>,
}

impl DeployOrchestrator {
    pub fn new(
        config: Arc<FleetConfig>,
        cache: RepoCache,
        release: Arc<dyn ReleaseTool>,
        manifest: Arc<dyn ManifestReader>,
    ) -> Self {
        Self {
            config,
            cache,
            release,
            manifest,
            before_command: None,
            audit: None,
        }
    }

    /// Run `command` on the environment's hosts before each unit deploys.
    pub fn with_before_command(mut self, command: impl Into<String>) -> Self {
        self.before_command = Some(command.into());
        self
    }

    /// Audit each deployed repository not flagged `skip_audit`.
    pub fn with_audit(mut self, tool: Arc<dyn AuditTool>) -> Self {
        self.audit = Some(tool);
        self
    }

    /// Deploy units for `repos`: the primary environment plus fan-out, minus
    /// each repository's skip and exclude lists.
    pub fn plan_units(repos: &[Repository], environment: &str) -> Vec<DeployUnit> {
        repos
            .iter()
            .flat_map(|repo| {
                repo.deploy_envs(environment)
                    .into_iter()
                    .map(move |env| DeployUnit {
                        repo: repo.name.clone(),
                        primary: env == environment,
                        environment: env,
                    })
            })
            .collect()
    }

    /// Repositories taking part in a deploy to `environment`.
    pub fn select(&self, selection: &RepoSelection, environment: &str) -> Result<Vec<Repository>> {
        Ok(selection
            .apply(&self.config.repositories)?
            .into_iter()
            .filter(|r| !r.skips(environment))
            .collect())
    }

    /// Every pre-flight phase. Returns the repositories to deploy and the
    /// consistency report, or the error naming the gate that aborted.
    #[instrument(skip_all, fields(environment = %request.environment, target = %request.target))]
    pub async fn prepare(
        &self,
        request: &DeployRequest,
        prompter: &dyn Prompter,
    ) -> Result<(Vec<Repository>, Option<ConsistencyReport>)> {
        if !self.config.environments.is_empty() && !self.config.is_supported_env(&request.environment)
        {
            return Err(FleetError::Config(format!(
                "unsupported environment '{}'",
                request.environment
            )));
        }

        let repos = self.select(&request.selection, &request.environment)?;
        let tracked = self.config.tracked_repositories();
        info!(
            repos = %repos.iter().map(|r| r.name.as_str()).collect::<Vec<_>>().join(", "),
            "repositories selected"
        );

        if !request.skip_update {
            let copies = self.cache.sync_all(&union(&repos, &tracked)).await?;
            prepare_all(self.release.as_ref(), &copies, self.config.parallelism()).await;
            if !request.selection.is_subset() {
                self.cache.prune(&self.config.repositories)?;
            }
        }

        let consistency = match &self.config.dependency {
            Some(dependency) if !tracked.is_empty() => {
                let checker = ConsistencyChecker::new(self.cache.clone(), Arc::clone(&self.manifest));
                let report = checker
                    .check(&tracked, &dependency.name, &request.target)
                    .await?;
                if let Some(confirmation) = dependency.policy().evaluate(&report)? {
                    ConfirmationGate::confirm(&confirmation, prompter)?;
                }
                Some(report)
            }
            _ => None,
        };

        if let DeployTarget::Tag(tag) = &request.target {
            ensure_tag_present(&self.cache, tag, &repos).await?;
        }

        let decision = ConfirmationGate::evaluate(&request.target, &repos, &request.environment);
        ConfirmationGate::resolve(&decision, prompter)?;

        Ok((repos, consistency))
    }

    /// Pre-flight, then deploy.
    pub async fn run(&self, request: &DeployRequest, prompter: &dyn Prompter) -> Result<DeployRun> {
        let (repos, consistency) = self.prepare(request, prompter).await?;
        let (results, audits) = self
            .dispatch(&repos, &request.environment, &request.target)
            .await;
        Ok(DeployRun {
            environment: request.environment.clone(),
            target: request.target.clone(),
            consistency,
            results,
            audit: self.audit.is_some().then(|| AuditReport::new(audits)),
            status_page: self
                .config
                .status_page(&request.environment)
                .map(str::to_string),
        })
    }

    /// Deploy every unit of `repos`, parallel across repositories (bounded by
    /// `num_parallel_processes`) and sequential within one. Working copies
    /// must already be synced.
    pub async fn deploy_all(
        &self,
        repos: &[Repository],
        environment: &str,
        target: &DeployTarget,
    ) -> Vec<DeployResult> {
        self.dispatch(repos, environment, target).await.0
    }

    async fn dispatch(
        &self,
        repos: &[Repository],
        environment: &str,
        target: &DeployTarget,
    ) -> (Vec<DeployResult>, Vec<RepoAudit>) {
        let sem = Arc::new(Semaphore::new(self.config.parallelism()));
        let mut tasks = Vec::new();

        for repo in repos {
            let units = Self::plan_units(std::slice::from_ref(repo), environment);
            if units.is_empty() {
                continue;
            }
            let runner = UnitRunner {
                dir: self.cache.repo_dir(&repo.name),
                release: Arc::clone(&self.release),
                target: target.clone(),
                before_command: self.before_command.clone(),
            };
            let progress = self.progress_path(repo);
            let auditor = self.audit.clone().filter(|_| !repo.skip_audit);
            let repo_name = repo.name.clone();
            let planned = units.clone();
            let sem = Arc::clone(&sem);

            let task = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let mut results = Vec::with_capacity(units.len());
                for unit in units {
                    results.push(runner.run(unit).await);
                }
                if let Some(path) = progress {
                    write_progress(&path, &repo_name).await;
                }
                let audit = match auditor {
                    Some(tool) => {
                        let out = tool.audit(&runner.dir).await;
                        debug!(repo = %repo_name, success = out.success, "audit finished");
                        Some(RepoAudit::from_output(&repo_name, &out))
                    }
                    None => None,
                };
                (results, audit)
            });
            tasks.push((repo.name.clone(), planned, task));
        }

        let mut per_repo = Vec::with_capacity(tasks.len());
        let mut audits = Vec::new();
        for (repo, planned, task) in tasks {
            let results = match task.await {
                Ok((results, audit)) => {
                    audits.extend(audit);
                    results
                }
                Err(e) => {
                    warn!(repo = %repo, error = %e, "deploy task aborted");
                    planned
                        .into_iter()
                        .map(|unit| DeployResult {
                            unit,
                            state: UnitState::Failed,
                            output: format!("deploy task aborted: {e}"),
                        })
                        .collect()
                }
            };
            per_repo.push((repo, results));
        }

        per_repo.sort_by(|a, b| a.0.cmp(&b.0));
        let results = per_repo.into_iter().flat_map(|(_, r)| r).collect();
        (results, audits)
    }

    fn progress_path(&self, repo: &Repository) -> Option<PathBuf> {
        let progress = &self.config.progress_file;
        progress
            .enabled
            .then(|| progress.location.join(format!("{}-deploy.log", repo.basename())))
    }
}

/// Runs the units of one repository.
struct UnitRunner {
    dir: PathBuf,
    release: Arc<dyn ReleaseTool>,
    target: DeployTarget,
    before_command: Option<String>,
}

impl UnitRunner {
    async fn run(&self, unit: DeployUnit) -> DeployResult {
        let start = Instant::now();
        let mut state = UnitState::Pending.start();
        emit_unit_started(&unit);

        let mut output = String::new();
        if let Some(command) = &self.before_command {
            let before = self
                .release
                .remote_execute(&self.dir, &unit.environment, command)
                .await;
            if !before.success {
                warn!(unit = %unit.label(), command = %command, "before-command failed");
            }
            output.push_str(&before.output);
        }

        match self
            .release
            .set_non_interactive_target(&self.dir, &self.target)
            .await
        {
            Ok(()) => {
                let deploy = self.release.deploy(&self.dir, &unit.environment).await;
                output.push_str(&deploy.output);
                state = state.finish(deploy.success);
            }
            Err(e) => {
                output.push_str(&e.to_string());
                state = state.finish(false);
            }
        }

        emit_unit_finished(&unit, state, start.elapsed().as_millis() as u64);
        DeployResult {
            unit,
            state,
            output,
        }
    }
}

async fn write_progress(path: &Path, repo: &str) {
    let line = format!("{} : {repo} deploy complete", chrono::Local::now());
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    if let Err(e) = tokio::fs::write(path, line).await {
        warn!(path = %path.display(), error = %e, "failed to write progress file");
    }
}

/// `a` followed by the members of `b` not already in `a`.
fn union(a: &[Repository], b: &[Repository]) -> Vec<Repository> {
    let mut seen: BTreeSet<&str> = a.iter().map(|r| r.name.as_str()).collect();
    let mut all = a.to_vec();
    for repo in b {
        if seen.insert(repo.name.as_str()) {
            all.push(repo.clone());
        }
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_units_fan_out() {
        let repos = vec![
            Repository::new("A"),
            Repository::new("B").with_fan_out("prod", "extra"),
        ];
        let units: Vec<(String, String, bool)> = DeployOrchestrator::plan_units(&repos, "prod")
            .into_iter()
            .map(|u| (u.repo, u.environment, u.primary))
            .collect();
        assert_eq!(
            units,
            vec![
                ("A".to_string(), "prod".to_string(), true),
                ("B".to_string(), "prod".to_string(), true),
                ("B".to_string(), "extra".to_string(), false),
            ]
        );
    }

    #[test]
    fn test_plan_units_skip_list() {
        let repos = vec![Repository::new("A").skipping("qa"), Repository::new("B")];
        let units = DeployOrchestrator::plan_units(&repos, "qa");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].repo, "B");
    }

    #[test]
    fn test_union_keeps_order_and_dedups() {
        let a = vec![Repository::new("x"), Repository::new("y")];
        let b = vec![Repository::new("y"), Repository::new("z")];
        let names: Vec<String> = union(&a, &b).into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["x", "y", "z"]);
    }
}
