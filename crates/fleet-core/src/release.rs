//! Release-tool capability and its Capistrano adapter.
//!
//! The release tool deploys one working copy to one environment. It would
//! normally ask interactively which branch to deploy; the adapter pins the
//! branch non-interactively by rewriting the per-repository deploy
//! configuration before each invocation. The rewrite is not undone: the next
//! cache sync discards it.

use std::path::Path;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use regex::Regex;
use tracing::warn;

use crate::cache::WorkingCopy;
use crate::config::ReleaseToolConfig;
use crate::error::{FleetError, Result};
use crate::exec::{CommandOutput, Invocation};
use crate::model::DeployTarget;

/// Per-repository, per-environment release operations.
#[async_trait]
pub trait ReleaseTool: Send + Sync {
    /// Install the tool's own dependencies in a freshly synced working copy.
    async fn prepare(&self, dir: &Path) -> CommandOutput;

    /// Make the next deploy from `dir` use `target` without prompting.
    async fn set_non_interactive_target(&self, dir: &Path, target: &DeployTarget) -> Result<()>;

    /// Deploy the working copy in `dir` to `environment`.
    async fn deploy(&self, dir: &Path, environment: &str) -> CommandOutput;

    /// Run `command` on every host of `environment`.
    async fn remote_execute(&self, dir: &Path, environment: &str, command: &str) -> CommandOutput;

    /// Verify SSH connectivity to every host of `environment`.
    async fn ssh_check(&self, dir: &Path, environment: &str) -> CommandOutput;

    /// Status URL derived from the server the repository declares for
    /// `environment`, when it declares one.
    async fn configured_server_url(&self, dir: &Path, environment: &str) -> Option<String>;
}

/// Prepare every synced working copy with bounded parallelism. A failure is
/// logged and the copy stays in play; returns the repositories that failed.
pub async fn prepare_all(
    release: &dyn ReleaseTool,
    copies: &[WorkingCopy],
    parallelism: usize,
) -> Vec<String> {
    let mut failed: Vec<String> = stream::iter(copies)
        .map(|copy| async move {
            let out = release.prepare(&copy.path).await;
            if out.success {
                None
            } else {
                warn!(repo = %copy.repo, output = %out.trimmed(), "release tool prepare failed");
                Some(copy.repo.clone())
            }
        })
        .buffer_unordered(parallelism.max(1))
        .filter_map(|failed| async move { failed })
        .collect()
        .await;
    failed.sort();
    failed
}

/// Rewrite deploy-configuration text so the branch is set rather than asked.
///
/// A tag replaces the whole first `ask :branch ...` line with
/// `set :branch, '<tag>'`. The default branch only turns the `ask` into a
/// `set`, which makes the tool deploy whatever HEAD the working copy is on.
pub fn pin_branch(text: &str, target: &DeployTarget) -> String {
    match target {
        DeployTarget::Tag(tag) => match Regex::new(r"(?m)^ask :branch.+$") {
            Ok(re) => re
                .replacen(text, 1, regex::NoExpand(&format!("set :branch, '{tag}'")))
                .into_owned(),
            Err(_) => text.to_string(),
        },
        DeployTarget::DefaultBranch => text.replacen("ask :branch", "set :branch", 1),
    }
}

/// First `server '<host>'` declaration in a stage file.
pub fn declared_server(stage_file: &str) -> Option<String> {
    let re = Regex::new(r"server '(.+?)'").ok()?;
    stage_file
        .lines()
        .filter(|line| line.starts_with("server"))
        .find_map(|line| re.captures(line).map(|caps| caps[1].to_string()))
}

/// [`ReleaseTool`] driving Capistrano through the configured launcher
/// (`bundle exec cap` by default).
#[derive(Debug, Clone, Default)]
pub struct Capistrano {
    config: ReleaseToolConfig,
}

impl Capistrano {
    pub fn new(config: ReleaseToolConfig) -> Self {
        Self { config }
    }

    fn cap(&self, dir: &Path, environment: &str) -> Invocation {
        Invocation::new(&self.config.program)
            .args(self.config.args.iter().cloned())
            .arg(environment)
            .current_dir(dir)
    }
}

#[async_trait]
impl ReleaseTool for Capistrano {
    async fn prepare(&self, dir: &Path) -> CommandOutput {
        let Some((program, args)) = self.config.install_command.split_first() else {
            return CommandOutput::ok("");
        };
        Invocation::new(program)
            .args(args.iter().cloned())
            .current_dir(dir)
            .run()
            .await
    }

    async fn set_non_interactive_target(&self, dir: &Path, target: &DeployTarget) -> Result<()> {
        let path = dir.join(&self.config.config_file);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| FleetError::ReleaseTool {
                repo: dir.display().to_string(),
                detail: format!("cannot read {}: {e}", path.display()),
            })?;
        tokio::fs::write(&path, pin_branch(&text, target)).await?;
        Ok(())
    }

    async fn deploy(&self, dir: &Path, environment: &str) -> CommandOutput {
        self.cap(dir, environment)
            .arg("deploy")
            .env("SKIP_BUNDLE_AUDIT", "true")
            .run()
            .await
    }

    async fn remote_execute(&self, dir: &Path, environment: &str, command: &str) -> CommandOutput {
        self.cap(dir, environment)
            .arg(format!("remote_execute['{command}']"))
            .run()
            .await
    }

    async fn ssh_check(&self, dir: &Path, environment: &str) -> CommandOutput {
        self.cap(dir, environment).arg("ssh_check").run().await
    }

    async fn configured_server_url(&self, dir: &Path, environment: &str) -> Option<String> {
        let path = dir
            .join(&self.config.stage_dir)
            .join(format!("{environment}.rb"));
        let text = tokio::fs::read_to_string(path).await.ok()?;
        declared_server(&text).map(|server| format!("https://{server}/status/all"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOY_RB: &str = "\
set :application, 'argo'
set :repo_url, 'https://github.com/sul-dlss/argo.git'

# Default branch is :master
ask :branch, proc { `git rev-parse --abbrev-ref HEAD`.chomp }.call
";

    #[test]
    fn test_pin_branch_to_tag_replaces_whole_line() {
        let pinned = pin_branch(DEPLOY_RB, &DeployTarget::Tag("rel-2024-01-05".to_string()));
        assert!(pinned.contains("set :branch, 'rel-2024-01-05'\n"));
        assert!(!pinned.contains("ask :branch"));
        assert!(!pinned.contains("rev-parse"));
    }

    #[test]
    fn test_pin_branch_default_keeps_head_expression() {
        let pinned = pin_branch(DEPLOY_RB, &DeployTarget::DefaultBranch);
        assert!(pinned.contains("set :branch, proc { `git rev-parse --abbrev-ref HEAD`"));
    }

    #[test]
    fn test_pin_branch_tag_with_dollar_is_literal() {
        let pinned = pin_branch("ask :branch, 'x'\n", &DeployTarget::Tag("v$1".to_string()));
        assert_eq!(pinned, "set :branch, 'v$1'\n");
    }

    #[tokio::test]
    async fn test_prepare_with_empty_install_command_is_noop() {
        let tool = Capistrano::new(ReleaseToolConfig {
            install_command: Vec::new(),
            ..Default::default()
        });
        let out = tool.prepare(Path::new("/nonexistent")).await;
        assert!(out.success);
    }

    #[test]
    fn test_declared_server() {
        let stage = "# comment\nserver 'argo-prod-a.example.org', user: 'lyberadmin', roles: %w[web app]\n";
        assert_eq!(
            declared_server(stage).as_deref(),
            Some("argo-prod-a.example.org")
        );
        assert_eq!(declared_server("set :rails_env, 'production'\n"), None);
    }

    #[tokio::test]
    async fn test_set_non_interactive_target_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::write(dir.path().join("config/deploy.rb"), DEPLOY_RB).unwrap();

        let cap = Capistrano::default();
        cap.set_non_interactive_target(dir.path(), &DeployTarget::Tag("rel-1".to_string()))
            .await
            .unwrap();

        let text = std::fs::read_to_string(dir.path().join("config/deploy.rb")).unwrap();
        assert!(text.contains("set :branch, 'rel-1'"));
    }

    #[tokio::test]
    async fn test_missing_deploy_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Capistrano::default()
            .set_non_interactive_target(dir.path(), &DeployTarget::DefaultBranch)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::ReleaseTool { .. }));
    }

    #[tokio::test]
    async fn test_configured_server_url_reads_stage_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("config/deploy")).unwrap();
        std::fs::write(
            dir.path().join("config/deploy/qa.rb"),
            "server 'argo-qa.example.org', user: 'deploy'\n",
        )
        .unwrap();

        let url = Capistrano::default()
            .configured_server_url(dir.path(), "qa")
            .await;
        assert_eq!(url.as_deref(), Some("https://argo-qa.example.org/status/all"));
        assert!(Capistrano::default()
            .configured_server_url(dir.path(), "prod")
            .await
            .is_none());
    }
}
