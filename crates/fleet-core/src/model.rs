//! Fleet model: repositories, deploy targets, deploy units and their results.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// A configured repository and its per-environment deploy policy.
///
/// Loaded once from configuration and immutable for the rest of the run.
/// Every field except `name` defaults to false/empty when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Organization/project slug, e.g. "sul-dlss/argo".
    pub name: String,
    /// Whether the repository participates in the dependency consistency check.
    #[serde(default)]
    pub dependency_tracked: bool,
    /// Environments that need operator approval before this repository deploys.
    #[serde(default)]
    pub confirmation_required_envs: BTreeSet<String>,
    /// Requested environments for which this repository sits out the whole
    /// run, fan-out included.
    #[serde(default)]
    pub skip_envs: BTreeSet<String>,
    /// Environments never deployed as a unit. Excluding a primary
    /// environment still deploys its fan-out.
    #[serde(default)]
    pub exclude_envs: BTreeSet<String>,
    /// Primary environment -> extra environments deployed alongside it.
    #[serde(default)]
    pub non_standard_envs: BTreeMap<String, Vec<String>>,
    /// Exclude from dependency audits, standalone or during deploy.
    #[serde(default)]
    pub skip_audit: bool,
    /// Environment -> status endpoint, consumed by the status check only.
    #[serde(default)]
    pub status: BTreeMap<String, String>,
}

impl Repository {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependency_tracked: false,
            confirmation_required_envs: BTreeSet::new(),
            skip_envs: BTreeSet::new(),
            exclude_envs: BTreeSet::new(),
            non_standard_envs: BTreeMap::new(),
            skip_audit: false,
            status: BTreeMap::new(),
        }
    }

    pub fn tracked(mut self) -> Self {
        self.dependency_tracked = true;
        self
    }

    pub fn requiring_confirmation(mut self, env: impl Into<String>) -> Self {
        self.confirmation_required_envs.insert(env.into());
        self
    }

    pub fn skipping(mut self, env: impl Into<String>) -> Self {
        self.skip_envs.insert(env.into());
        self
    }

    pub fn excluding(mut self, env: impl Into<String>) -> Self {
        self.exclude_envs.insert(env.into());
        self
    }

    pub fn with_fan_out(mut self, primary: impl Into<String>, extra: impl Into<String>) -> Self {
        self.non_standard_envs
            .entry(primary.into())
            .or_default()
            .push(extra.into());
        self
    }

    pub fn with_status(mut self, env: impl Into<String>, url: impl Into<String>) -> Self {
        self.status.insert(env.into(), url.into());
        self
    }

    pub fn without_audit(mut self) -> Self {
        self.skip_audit = true;
        self
    }

    pub fn requires_confirmation(&self, env: &str) -> bool {
        self.confirmation_required_envs.contains(env)
    }

    pub fn skips(&self, env: &str) -> bool {
        self.skip_envs.contains(env)
    }

    pub fn excludes(&self, env: &str) -> bool {
        self.exclude_envs.contains(env)
    }

    /// Extra environments fanned out alongside `primary`.
    pub fn fan_out(&self, primary: &str) -> &[String] {
        self.non_standard_envs
            .get(primary)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Environments to deploy for a requested primary environment: the
    /// primary first, then its fan-out, minus the skip and exclude lists.
    /// Nothing at all when the primary itself is skipped.
    pub fn deploy_envs(&self, primary: &str) -> Vec<String> {
        if self.skips(primary) {
            return Vec::new();
        }
        let mut envs: Vec<String> = Vec::new();
        for env in std::iter::once(primary).chain(self.fan_out(primary).iter().map(String::as_str))
        {
            if self.skips(env) || self.excludes(env) || envs.iter().any(|e| e == env) {
                continue;
            }
            envs.push(env.to_string());
        }
        envs
    }

    /// Last path segment of the slug ("sul-dlss/argo" -> "argo").
    pub fn basename(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// What every repository in a run deploys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum DeployTarget {
    /// The floating tip of each repository's remote default branch.
    DefaultBranch,
    /// A pinned tag shared by all repositories.
    Tag(String),
}

impl DeployTarget {
    pub fn from_tag(tag: Option<String>) -> Self {
        match tag {
            Some(name) => Self::Tag(name),
            None => Self::DefaultBranch,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::DefaultBranch => None,
            Self::Tag(name) => Some(name),
        }
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self, Self::Tag(_))
    }
}

impl fmt::Display for DeployTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DefaultBranch => write!(f, "default branch"),
            Self::Tag(name) => write!(f, "tag {name}"),
        }
    }
}

/// One (repository, environment) pair deployed independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployUnit {
    pub repo: String,
    pub environment: String,
    /// `false` for fan-out environments.
    pub primary: bool,
}

impl DeployUnit {
    /// Report label: the repository name, suffixed with the environment for
    /// fan-out units.
    pub fn label(&self) -> String {
        if self.primary {
            self.repo.clone()
        } else {
            format!("{} ({})", self.repo, self.environment)
        }
    }
}

/// Lifecycle of a deploy unit. `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl UnitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Pending -> Running. Any other state is returned unchanged.
    pub fn start(self) -> Self {
        match self {
            Self::Pending => Self::Running,
            other => other,
        }
    }

    /// Running -> Succeeded/Failed. Terminal states never move again.
    pub fn finish(self, success: bool) -> Self {
        match self {
            Self::Running if success => Self::Succeeded,
            Self::Running => Self::Failed,
            other => other,
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "success",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Outcome of one deploy unit (or of one release-tool task such as an SSH
/// check). Output is the verbatim merged stdout/stderr of the tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployResult {
    pub unit: DeployUnit,
    pub state: UnitState,
    pub output: String,
}

impl DeployResult {
    pub fn succeeded(&self) -> bool {
        self.state == UnitState::Succeeded
    }

    pub fn repo(&self) -> &str {
        &self.unit.repo
    }

    pub fn environment(&self) -> &str {
        &self.unit.environment
    }
}
