//! Cross-repository dependency-version consistency.
//!
//! [`ConsistencyChecker`] resolves one dependency's locked version in every
//! dependency-tracked working copy, at the run's [`DeployTarget`], and
//! classifies the spread:
//!
//! - at most one distinct version -> [`Divergence::Uniform`]
//! - several versions sharing major.minor -> [`Divergence::MinorDivergent`]
//! - several major.minor pairs -> [`Divergence::MajorDivergent`]
//!
//! What each class means for a deploy is a [`DivergencePolicy`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::RepoCache;
use crate::error::{FleetError, Result};
use crate::gate::ConfirmationRequest;
use crate::manifest::ManifestReader;
use crate::model::{DeployTarget, Repository};
use crate::obs::emit_divergence_checked;
use crate::tags::ensure_tag_present;

/// Repository name -> resolved dependency version.
pub type VersionMap = BTreeMap<String, String>;

/// Severity of disagreement among tracked repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Divergence {
    Uniform,
    MinorDivergent,
    MajorDivergent,
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uniform => "uniform",
            Self::MinorDivergent => "minor_divergent",
            Self::MajorDivergent => "major_divergent",
        };
        f.write_str(s)
    }
}

/// What a divergence class does to a deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceAction {
    /// Continue without asking.
    Proceed,
    /// Continue only after explicit operator approval.
    Confirm,
    /// Abort; no override exists.
    Block,
}

/// Mapping from divergence class to action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergencePolicy {
    pub minor: DivergenceAction,
    pub major: DivergenceAction,
}

impl Default for DivergencePolicy {
    fn default() -> Self {
        Self {
            minor: DivergenceAction::Confirm,
            major: DivergenceAction::Block,
        }
    }
}

impl DivergencePolicy {
    pub fn action_for(&self, verdict: Divergence) -> DivergenceAction {
        match verdict {
            Divergence::Uniform => DivergenceAction::Proceed,
            Divergence::MinorDivergent => self.minor,
            Divergence::MajorDivergent => self.major,
        }
    }

    /// Turn a report into a gate outcome: `Err` when blocked, a confirmation
    /// request when approval is needed, `None` when the deploy may proceed.
    pub fn evaluate(&self, report: &ConsistencyReport) -> Result<Option<ConfirmationRequest>> {
        match self.action_for(report.verdict) {
            DivergenceAction::Proceed => Ok(None),
            DivergenceAction::Confirm => Ok(Some(ConfirmationRequest::divergence(report))),
            DivergenceAction::Block => Err(FleetError::DivergenceBlocked {
                dependency: report.dependency.clone(),
                groups: report.group_summaries(),
            }),
        }
    }
}

/// "2.1.3" -> "2.1"; versions without a minor component keep what they have.
pub fn major_minor(version: &str) -> String {
    version.split('.').take(2).collect::<Vec<_>>().join(".")
}

/// Invert a version map: version -> sorted repository names.
pub fn group_by_version(versions: &VersionMap) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (repo, version) in versions {
        groups.entry(version.clone()).or_default().push(repo.clone());
    }
    for repos in groups.values_mut() {
        repos.sort();
    }
    groups
}

/// Classify a version map.
pub fn classify(versions: &VersionMap) -> Divergence {
    let groups = group_by_version(versions);
    if groups.len() <= 1 {
        return Divergence::Uniform;
    }
    let mut pairs: Vec<String> = groups.keys().map(|v| major_minor(v)).collect();
    pairs.sort();
    pairs.dedup();
    if pairs.len() > 1 {
        Divergence::MajorDivergent
    } else {
        Divergence::MinorDivergent
    }
}

/// Outcome of one consistency check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub dependency: String,
    pub target: DeployTarget,
    pub versions: VersionMap,
    /// Tracked repositories whose lockfile lacks the dependency.
    pub excluded: Vec<String>,
    pub verdict: Divergence,
}

impl ConsistencyReport {
    pub fn from_versions(
        dependency: impl Into<String>,
        target: DeployTarget,
        versions: VersionMap,
        excluded: Vec<String>,
    ) -> Self {
        let verdict = classify(&versions);
        Self {
            dependency: dependency.into(),
            target,
            versions,
            excluded,
            verdict,
        }
    }

    pub fn groups(&self) -> BTreeMap<String, Vec<String>> {
        group_by_version(&self.versions)
    }

    /// major.minor -> repositories, for diagnosing a blocked deploy.
    pub fn major_minor_groups(&self) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (repo, version) in &self.versions {
            groups
                .entry(major_minor(version))
                .or_default()
                .push(repo.clone());
        }
        groups
    }

    /// One "2.1: org/a, org/b" line per major.minor group.
    pub fn group_summaries(&self) -> Vec<String> {
        self.major_minor_groups()
            .into_iter()
            .map(|(mm, repos)| format!("{mm}: {}", repos.join(", ")))
            .collect()
    }
}

/// Reads the tracked dependency across working copies.
pub struct ConsistencyChecker {
    cache: RepoCache,
    manifest: Arc<dyn ManifestReader>,
}

impl ConsistencyChecker {
    pub fn new(cache: RepoCache, manifest: Arc<dyn ManifestReader>) -> Self {
        Self { cache, manifest }
    }

    /// Check `dependency` across the dependency-tracked subset of `repos`.
    ///
    /// With a tag target, every tracked repository must carry the tag; each
    /// working copy is checked out at the tag for the read and switched back
    /// to its prior ref afterwards.
    pub async fn check(
        &self,
        repos: &[Repository],
        dependency: &str,
        target: &DeployTarget,
    ) -> Result<ConsistencyReport> {
        let tracked: Vec<Repository> = repos
            .iter()
            .filter(|r| r.dependency_tracked)
            .cloned()
            .collect();
        info!(
            dependency = %dependency,
            target = %target,
            repos = %tracked.iter().map(|r| r.name.as_str()).collect::<Vec<_>>().join(", "),
            "checking dependency versions"
        );

        if let DeployTarget::Tag(tag) = target {
            ensure_tag_present(&self.cache, tag, &tracked).await?;
        }

        let mut versions = VersionMap::new();
        let mut excluded = Vec::new();
        for repo in &tracked {
            let dir = self.cache.repo_dir(&repo.name);
            match self.read_at(&repo.name, &dir, dependency, target).await? {
                Some(version) if !version.is_empty() => {
                    versions.insert(repo.name.clone(), version);
                }
                _ => {
                    debug!(repo = %repo.name, dependency = %dependency, "dependency absent, excluded");
                    excluded.push(repo.name.clone());
                }
            }
        }

        let report = ConsistencyReport::from_versions(dependency, target.clone(), versions, excluded);
        emit_divergence_checked(
            dependency,
            target,
            &report.verdict.to_string(),
            report.groups().len(),
        );
        Ok(report)
    }

    async fn read_at(
        &self,
        repo: &str,
        dir: &Path,
        dependency: &str,
        target: &DeployTarget,
    ) -> Result<Option<String>> {
        let Some(tag) = target.tag() else {
            return self.manifest.resolved_version(dir, dependency).await;
        };

        let vcs = self.cache.vcs();
        let prior = vcs.current_ref(dir).await;
        if !prior.success {
            return Err(FleetError::Checkout {
                repo: repo.to_string(),
                reference: "HEAD".to_string(),
                output: prior.output,
            });
        }
        let prior_ref = prior.trimmed().to_string();
        if prior_ref == tag {
            return self.manifest.resolved_version(dir, dependency).await;
        }

        let enter = vcs.checkout(dir, tag).await;
        if !enter.success {
            return Err(FleetError::Checkout {
                repo: repo.to_string(),
                reference: tag.to_string(),
                output: enter.output,
            });
        }

        let read = self.manifest.resolved_version(dir, dependency).await;

        let restore = vcs.checkout(dir, &prior_ref).await;
        if !restore.success {
            return Err(FleetError::Checkout {
                repo: repo.to_string(),
                reference: prior_ref,
                output: restore.output,
            });
        }
        read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versions(pairs: &[(&str, &str)]) -> VersionMap {
        pairs
            .iter()
            .map(|(r, v)| (r.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_and_single_version_are_uniform() {
        assert_eq!(classify(&VersionMap::new()), Divergence::Uniform);
        assert_eq!(
            classify(&versions(&[("org/a", "2.1.0"), ("org/b", "2.1.0")])),
            Divergence::Uniform
        );
    }

    #[test]
    fn test_patch_skew_is_minor_divergent() {
        assert_eq!(
            classify(&versions(&[("svc-a", "2.1.0"), ("svc-b", "2.1.3")])),
            Divergence::MinorDivergent
        );
    }

    #[test]
    fn test_major_or_minor_skew_is_major_divergent() {
        assert_eq!(
            classify(&versions(&[("svc-a", "2.1.0"), ("svc-b", "3.0.0")])),
            Divergence::MajorDivergent
        );
        assert_eq!(
            classify(&versions(&[("svc-a", "2.1.0"), ("svc-b", "2.2.0")])),
            Divergence::MajorDivergent
        );
    }

    #[test]
    fn test_group_by_version_sorts_repos() {
        let groups = group_by_version(&versions(&[
            ("org/c", "0.62.0"),
            ("org/a", "0.62.0"),
            ("org/b", "0.62.1"),
        ]));
        assert_eq!(groups["0.62.0"], vec!["org/a", "org/c"]);
        assert_eq!(groups["0.62.1"], vec!["org/b"]);
    }

    #[test]
    fn test_default_policy_blocks_major_without_prompt() {
        let report = ConsistencyReport::from_versions(
            "cocina-models",
            DeployTarget::DefaultBranch,
            versions(&[("svc-a", "2.1.0"), ("svc-b", "3.0.0")]),
            vec![],
        );
        let err = DivergencePolicy::default().evaluate(&report).unwrap_err();
        match err {
            FleetError::DivergenceBlocked { groups, .. } => {
                assert_eq!(groups, vec!["2.1: svc-a", "3.0: svc-b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_default_policy_requests_confirmation_for_minor() {
        let report = ConsistencyReport::from_versions(
            "cocina-models",
            DeployTarget::DefaultBranch,
            versions(&[("svc-a", "2.1.0"), ("svc-b", "2.1.3")]),
            vec![],
        );
        let request = DivergencePolicy::default()
            .evaluate(&report)
            .unwrap()
            .expect("confirmation requested");
        assert!(request.message.contains("cocina-models"));
    }

    #[test]
    fn test_advisory_policy_never_blocks() {
        let policy = DivergencePolicy {
            minor: DivergenceAction::Proceed,
            major: DivergenceAction::Confirm,
        };
        let report = ConsistencyReport::from_versions(
            "dep",
            DeployTarget::DefaultBranch,
            versions(&[("a", "1.0.0"), ("b", "2.0.0")]),
            vec![],
        );
        assert!(policy.evaluate(&report).unwrap().is_some());
    }

    #[test]
    fn test_major_minor() {
        assert_eq!(major_minor("2.1.3"), "2.1");
        assert_eq!(major_minor("7"), "7");
        assert_eq!(major_minor("0.62.1.pre"), "0.62");
    }
}
