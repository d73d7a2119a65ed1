//! Dependency audit across working copies.
//!
//! The audit tool exits zero when a repository is clean. Otherwise its output
//! is a series of blank-line separated `Key: value` blocks, one per advisory,
//! terminated by the [`SENTINEL`] line. Anything else is recorded as an audit
//! error for that repository.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::RepoCache;
use crate::config::AuditToolConfig;
use crate::exec::{CommandOutput, Invocation};
use crate::model::Repository;

/// Last line of audit output that reports vulnerabilities.
pub const SENTINEL: &str = "Vulnerabilities found!";

/// Runs the audit tool in one working copy.
#[async_trait]
pub trait AuditTool: Send + Sync {
    async fn audit(&self, dir: &Path) -> CommandOutput;
}

/// `bundle exec bundle audit`, or whatever the configuration names.
#[derive(Debug, Clone, Default)]
pub struct BundleAudit {
    config: AuditToolConfig,
}

impl BundleAudit {
    pub fn new(config: AuditToolConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AuditTool for BundleAudit {
    async fn audit(&self, dir: &Path) -> CommandOutput {
        Invocation::new(&self.config.program)
            .args(self.config.args.iter().cloned())
            .current_dir(dir)
            .run()
            .await
    }
}

/// One advisory block, rows in the order the tool printed them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advisory {
    pub fields: Vec<(String, String)>,
}

impl Advisory {
    /// Value of the first row whose key matches `key`, ignoring case.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Identifier used to deduplicate findings across repositories.
    pub fn id(&self) -> String {
        ["Advisory", "CVE", "GHSA", "Title"]
            .iter()
            .find_map(|key| self.get(key))
            .unwrap_or("unknown")
            .to_string()
    }
}

/// Parse non-zero audit output into advisories.
pub fn parse_findings(output: &str) -> Result<Vec<Advisory>, String> {
    let body = output
        .trim_end()
        .strip_suffix(SENTINEL)
        .ok_or_else(|| format!("unrecognized audit output: {}", output.trim()))?;

    let advisories: Vec<Advisory> = body
        .split("\n\n")
        .filter_map(|block| {
            let fields: Vec<(String, String)> = block
                .lines()
                .filter_map(|row| row.split_once(": "))
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .collect();
            if fields.is_empty() {
                if !block.trim().is_empty() {
                    warn!(block = %block.trim(), "skipping unparseable audit block");
                }
                None
            } else {
                Some(Advisory { fields })
            }
        })
        .collect();
    Ok(advisories)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum AuditOutcome {
    Clean,
    Vulnerable(Vec<Advisory>),
    /// The tool failed without producing a recognizable report.
    Error(String),
}

/// Audit result for one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoAudit {
    pub repo: String,
    pub outcome: AuditOutcome,
}

impl RepoAudit {
    pub fn from_output(repo: impl Into<String>, out: &CommandOutput) -> Self {
        let outcome = if out.success {
            AuditOutcome::Clean
        } else {
            match parse_findings(&out.output) {
                Ok(advisories) => AuditOutcome::Vulnerable(advisories),
                Err(detail) => AuditOutcome::Error(detail),
            }
        };
        Self {
            repo: repo.into(),
            outcome,
        }
    }
}

/// Audit results for a set of repositories, sorted by repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub repos: Vec<RepoAudit>,
}

impl AuditReport {
    pub fn new(mut repos: Vec<RepoAudit>) -> Self {
        repos.sort_by(|a, b| a.repo.cmp(&b.repo));
        Self { repos }
    }

    /// Repository -> advisory ids, for repositories with findings.
    pub fn findings(&self) -> BTreeMap<String, Vec<String>> {
        self.repos
            .iter()
            .filter_map(|r| match &r.outcome {
                AuditOutcome::Vulnerable(advisories) => Some((
                    r.repo.clone(),
                    advisories.iter().map(Advisory::id).collect(),
                )),
                _ => None,
            })
            .collect()
    }

    /// One description per distinct advisory id; the first occurrence wins.
    pub fn advisories(&self) -> BTreeMap<String, Advisory> {
        let mut unique = BTreeMap::new();
        for r in &self.repos {
            if let AuditOutcome::Vulnerable(advisories) = &r.outcome {
                for advisory in advisories {
                    unique
                        .entry(advisory.id())
                        .or_insert_with(|| advisory.clone());
                }
            }
        }
        unique
    }

    /// Repository -> audit error detail.
    pub fn errors(&self) -> BTreeMap<String, String> {
        self.repos
            .iter()
            .filter_map(|r| match &r.outcome {
                AuditOutcome::Error(detail) => Some((r.repo.clone(), detail.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.repos
            .iter()
            .all(|r| r.outcome == AuditOutcome::Clean)
    }
}

/// Runs the audit tool across working copies in parallel.
pub struct RepoAuditor {
    cache: RepoCache,
    tool: Arc<dyn AuditTool>,
    parallelism: usize,
}

impl RepoAuditor {
    pub fn new(cache: RepoCache, tool: Arc<dyn AuditTool>, parallelism: usize) -> Self {
        Self {
            cache,
            tool,
            parallelism: parallelism.max(1),
        }
    }

    /// Audit every repository not flagged `skip_audit`.
    pub async fn audit_all(&self, repos: &[Repository]) -> AuditReport {
        let audited: Vec<&Repository> = repos.iter().filter(|r| !r.skip_audit).collect();
        info!(
            repos = %audited.iter().map(|r| r.name.as_str()).collect::<Vec<_>>().join(", "),
            "auditing repositories"
        );

        let results: Vec<RepoAudit> = stream::iter(audited)
            .map(|repo| async move {
                let dir = self.cache.repo_dir(&repo.name);
                let out = self.tool.audit(&dir).await;
                debug!(repo = %repo.name, success = out.success, "audit finished");
                RepoAudit::from_output(&repo.name, &out)
            })
            .buffer_unordered(self.parallelism)
            .collect()
            .await;
        AuditReport::new(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FINDINGS: &str = "\
Name: actionpack
Version: 6.1.4
Advisory: CVE-2021-22942
Criticality: Medium
URL: https://groups.google.com/g/rubyonrails-security/c/wB5tRn7h36c
Title: Possible Open Redirect in Host Authorization Middleware
Solution: upgrade to ~> 6.0.4.1, >= 6.1.4.1

Name: nokogiri
Version: 1.11.7
GHSA: GHSA-2rr5-8q37-2w7h
Criticality: High
Title: Improper Restriction of XML External Entity Reference
Solution: upgrade to >= 1.12.5

Vulnerabilities found!
";

    #[test]
    fn test_parse_findings() {
        let advisories = parse_findings(FINDINGS).unwrap();
        assert_eq!(advisories.len(), 2);
        assert_eq!(advisories[0].id(), "CVE-2021-22942");
        assert_eq!(advisories[0].get("criticality"), Some("Medium"));
        assert_eq!(advisories[1].id(), "GHSA-2rr5-8q37-2w7h");
    }

    #[test]
    fn test_parse_without_sentinel_is_error() {
        let err = parse_findings("Could not find gem 'rails'\n").unwrap_err();
        assert!(err.contains("unrecognized audit output"));
    }

    #[test]
    fn test_outcome_from_output() {
        let clean = RepoAudit::from_output("org/a", &CommandOutput::ok("No vulnerabilities found\n"));
        assert_eq!(clean.outcome, AuditOutcome::Clean);

        let broken = RepoAudit::from_output("org/b", &CommandOutput::failed("bundler: command not found"));
        assert!(matches!(broken.outcome, AuditOutcome::Error(_)));

        let vulnerable = RepoAudit::from_output("org/c", &CommandOutput::failed(FINDINGS));
        assert!(matches!(vulnerable.outcome, AuditOutcome::Vulnerable(ref v) if v.len() == 2));
    }

    #[test]
    fn test_report_dedups_advisories_across_repos() {
        let out = CommandOutput::failed(FINDINGS);
        let report = AuditReport::new(vec![
            RepoAudit::from_output("org/z", &out),
            RepoAudit::from_output("org/a", &out),
            RepoAudit::from_output("org/m", &CommandOutput::ok("")),
        ]);

        let findings = report.findings();
        assert_eq!(findings.len(), 2);
        assert_eq!(
            findings["org/a"],
            vec!["CVE-2021-22942".to_string(), "GHSA-2rr5-8q37-2w7h".to_string()]
        );
        assert_eq!(report.advisories().len(), 2);
        assert!(!report.is_clean());
        assert_eq!(report.repos[0].repo, "org/a");
    }
}
