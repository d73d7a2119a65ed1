//! Fleet configuration.
//!
//! The whole configuration is one immutable [`FleetConfig`] built at process
//! start and handed to each component by reference (usually `Arc<FleetConfig>`).
//! Nothing in the crate reads configuration from global state.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::consistency::{DivergenceAction, DivergencePolicy};
use crate::error::{FleetError, Result};
use crate::model::Repository;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/fleet.toml";

fn default_cache_root() -> PathBuf {
    PathBuf::from("tmp/repos")
}

fn default_remote_url_template() -> String {
    "git@github.com:{name}.git".to_string()
}

fn default_parallelism() -> usize {
    3
}

fn default_clone_depth() -> u32 {
    5
}

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Directory holding one working copy per repository.
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
    /// Clone URL template; `{name}` is replaced by the repository slug.
    #[serde(default = "default_remote_url_template")]
    pub remote_url_template: String,
    /// History depth for fresh clones. `0` clones full history.
    #[serde(default = "default_clone_depth")]
    pub clone_depth: u32,
    /// Upper bound on concurrently running repositories.
    #[serde(default = "default_parallelism")]
    pub num_parallel_processes: usize,
    /// Host whose SSH control-master session must be up before deploying.
    #[serde(default)]
    pub control_master_host: Option<String>,
    /// Supported environments, mapped to their status page URL.
    #[serde(default)]
    pub environments: BTreeMap<String, String>,
    /// Shared dependency checked for version divergence.
    #[serde(default)]
    pub dependency: Option<DependencyConfig>,
    #[serde(default)]
    pub progress_file: ProgressFileConfig,
    #[serde(default)]
    pub release_tool: ReleaseToolConfig,
    #[serde(default)]
    pub audit_tool: AuditToolConfig,
    /// Ordered repository records.
    #[serde(default)]
    pub repositories: Vec<Repository>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            remote_url_template: default_remote_url_template(),
            clone_depth: default_clone_depth(),
            num_parallel_processes: default_parallelism(),
            control_master_host: None,
            environments: BTreeMap::new(),
            dependency: None,
            progress_file: ProgressFileConfig::default(),
            release_tool: ReleaseToolConfig::default(),
            audit_tool: AuditToolConfig::default(),
            repositories: Vec::new(),
        }
    }
}

/// The dependency whose resolved version must agree across tracked repositories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub name: String,
    /// Lockfile read in each working copy ("Gemfile.lock" or "Cargo.lock").
    #[serde(default = "default_lockfile")]
    pub lockfile: String,
    #[serde(default = "default_minor_action")]
    pub minor_divergence: DivergenceAction,
    #[serde(default = "default_major_action")]
    pub major_divergence: DivergenceAction,
}

fn default_lockfile() -> String {
    "Gemfile.lock".to_string()
}

fn default_minor_action() -> DivergenceAction {
    DivergenceAction::Confirm
}

fn default_major_action() -> DivergenceAction {
    DivergenceAction::Block
}

impl DependencyConfig {
    pub fn policy(&self) -> DivergencePolicy {
        DivergencePolicy {
            minor: self.minor_divergence,
            major: self.major_divergence,
        }
    }
}

/// Per-repository completion markers written during a deploy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressFileConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub location: PathBuf,
}

/// How the external release tool is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseToolConfig {
    pub program: String,
    /// Arguments placed before the environment name.
    pub args: Vec<String>,
    /// Per-repository file holding the interactive branch prompt.
    pub config_file: PathBuf,
    /// Directory holding one `<env>.rb` server declaration per environment.
    pub stage_dir: PathBuf,
    /// Installs the tool's own dependencies in a working copy; run after
    /// every sync and before SSH checks. Empty disables it.
    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,
}

fn default_install_command() -> Vec<String> {
    vec!["bundle".to_string(), "install".to_string()]
}

impl Default for ReleaseToolConfig {
    fn default() -> Self {
        Self {
            program: "bundle".to_string(),
            args: vec!["exec".to_string(), "cap".to_string()],
            config_file: PathBuf::from("config/deploy.rb"),
            stage_dir: PathBuf::from("config/deploy"),
            install_command: default_install_command(),
        }
    }
}

/// How the external dependency-audit tool is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditToolConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for AuditToolConfig {
    fn default() -> Self {
        Self {
            program: "bundle".to_string(),
            args: vec![
                "exec".to_string(),
                "bundle".to_string(),
                "audit".to_string(),
            ],
        }
    }
}

impl FleetConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: FleetConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FleetError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject duplicate/empty names and policy entries for unknown environments.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for repo in &self.repositories {
            if repo.name.trim().is_empty() {
                return Err(FleetError::Config("repository with empty name".to_string()));
            }
            if !seen.insert(repo.name.as_str()) {
                return Err(FleetError::Config(format!(
                    "duplicate repository: {}",
                    repo.name
                )));
            }
            if self.environments.is_empty() {
                continue;
            }
            let referenced = repo
                .confirmation_required_envs
                .iter()
                .chain(repo.skip_envs.iter())
                .chain(repo.exclude_envs.iter())
                .chain(repo.non_standard_envs.keys());
            for env in referenced {
                if !self.environments.contains_key(env) {
                    return Err(FleetError::Config(format!(
                        "repository {} references unknown environment '{env}'",
                        repo.name
                    )));
                }
            }
        }
        if let Some(dep) = &self.dependency {
            if dep.name.trim().is_empty() {
                return Err(FleetError::Config("dependency name is empty".to_string()));
            }
        }
        Ok(())
    }

    /// Worker bound, never below one.
    pub fn parallelism(&self) -> usize {
        self.num_parallel_processes.max(1)
    }

    pub fn tracked_repositories(&self) -> Vec<Repository> {
        self.repositories
            .iter()
            .filter(|r| r.dependency_tracked)
            .cloned()
            .collect()
    }

    pub fn is_supported_env(&self, env: &str) -> bool {
        self.environments.contains_key(env)
    }

    pub fn status_page(&self, env: &str) -> Option<&str> {
        self.environments.get(env).map(String::as_str)
    }

    pub fn remote_url(&self, repo: &str) -> String {
        self.remote_url_template.replace("{name}", repo)
    }
}

/// Subset filters applied to the configured repository list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoSelection {
    pub only: Vec<String>,
    pub except: Vec<String>,
    pub tracked_only: bool,
}

impl RepoSelection {
    /// True when any filter is active. Pruning is only safe when this is false.
    pub fn is_subset(&self) -> bool {
        !self.only.is_empty() || !self.except.is_empty() || self.tracked_only
    }

    /// Apply the filters, preserving configuration order.
    pub fn apply(&self, repositories: &[Repository]) -> Result<Vec<Repository>> {
        if !self.only.is_empty() && !self.except.is_empty() {
            return Err(FleetError::Selection(
                "use only one of --only or --except".to_string(),
            ));
        }
        for name in self.only.iter().chain(self.except.iter()) {
            if !repositories.iter().any(|r| &r.name == name) {
                warn!(repo = %name, "selection names a repository that is not configured");
            }
        }

        Ok(repositories
            .iter()
            .filter(|r| !self.tracked_only || r.dependency_tracked)
            .filter(|r| self.only.is_empty() || self.only.contains(&r.name))
            .filter(|r| !self.except.contains(&r.name))
            .cloned()
            .collect())
    }
}
