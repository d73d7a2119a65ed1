//! Consolidated run report.
//!
//! [`ReportAggregator`] collects results from any fleet command (deploy units,
//! tag operations, consistency checks, audits, status checks) and produces a
//! [`FleetReport`]. Rendering is deterministic: rows are ordered by
//! repository regardless of completion order. Failed units keep their full
//! captured output in a separate failures section; successful output is
//! reduced to a status word.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::AuditReport;
use crate::consistency::ConsistencyReport;
use crate::model::{DeployResult, DeployTarget};
use crate::status::StatusCheck;
use crate::tags::{TagOutcome, TagStatus};

/// One line of the outcome table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    pub repo: String,
    pub label: String,
    pub result: String,
    pub ok: bool,
}

/// What a failed unit was doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Deploy,
    SshCheck,
    Command,
}

/// Full output of a failed unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub label: String,
    pub environment: Option<String>,
    pub output: String,
}

impl FailureDetail {
    fn heading(&self) -> String {
        let env = self
            .environment
            .as_deref()
            .map(|env| format!(" ({env})"))
            .unwrap_or_default();
        match self.kind {
            FailureKind::Deploy => format!("Output from failed deployment of {}{env}:", self.label),
            FailureKind::SshCheck => format!("Output from failed SSH check of {}{env}:", self.label),
            FailureKind::Command => format!("Output from {}{env}:", self.label),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetReport {
    pub title: String,
    pub generated_at: DateTime<Utc>,
    pub rows: Vec<ReportRow>,
    pub failures: Vec<FailureDetail>,
    pub consistency: Option<ConsistencyReport>,
    pub audit: Option<AuditReport>,
    pub statuses: Vec<StatusCheck>,
    pub notes: Vec<String>,
}

impl FleetReport {
    /// True when any unit failed or the audit found anything.
    pub fn has_failures(&self) -> bool {
        self.rows.iter().any(|r| !r.ok)
            || self.audit.as_ref().is_some_and(|a| !a.is_clean())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Render the report as Markdown.
    pub fn render_markdown(&self) -> String {
        let mut md = format!("# {}\n", self.title);

        if let Some(consistency) = &self.consistency {
            md.push_str(&render_consistency(consistency));
        }

        // ── outcome table ─────────────────────────────────────────────────

        if !self.rows.is_empty() {
            let width = self
                .rows
                .iter()
                .map(|r| r.label.len())
                .max()
                .unwrap_or(0)
                .max("repo".len());
            md.push_str(&format!("\n| {:<width$} | result |\n", "repo"));
            md.push_str(&format!("|{}|--------|\n", "-".repeat(width + 2)));
            for row in &self.rows {
                md.push_str(&format!("| {:<width$} | {} |\n", row.label, row.result));
            }
        }

        // ── failures ──────────────────────────────────────────────────────

        if !self.failures.is_empty() {
            md.push_str("\n## Failures\n");
            for failure in &self.failures {
                md.push_str(&format!("\n{}\n", failure.heading()));
                md.push_str("```\n");
                md.push_str(failure.output.trim_end());
                md.push_str("\n```\n");
            }
        }

        if let Some(audit) = &self.audit {
            md.push_str(&render_audit(audit));
        }

        if !self.statuses.is_empty() {
            md.push_str("\n## Status checks\n\n");
            for check in &self.statuses {
                md.push_str(&format!("- {} ({}): {}\n", check.repo, check.url, check.outcome));
            }
        }

        for note in &self.notes {
            md.push_str(&format!("\n{note}\n"));
        }
        md
    }
}

/// Versions sorted, repositories within a version sorted.
pub fn render_consistency(report: &ConsistencyReport) -> String {
    let mut md = format!("\n## {} report\n\n", report.dependency);
    match &report.target {
        DeployTarget::Tag(tag) => md.push_str(&format!("for tag {tag} of repos\n")),
        DeployTarget::DefaultBranch => md.push_str("for default branches of repos\n"),
    }
    md.push_str(&format!("\nFound these versions of {} in use:\n", report.dependency));
    for (version, repos) in report.groups() {
        md.push_str(&format!("- {version}\n"));
        for repo in repos {
            md.push_str(&format!("  - {repo}\n"));
        }
    }
    if !report.excluded.is_empty() {
        md.push_str(&format!(
            "\nNot using {}: {}\n",
            report.dependency,
            report.excluded.join(", ")
        ));
    }
    md.push_str(&format!("\nVerdict: {}\n", report.verdict));
    md
}

/// Repository findings, then one description block per distinct advisory.
pub fn render_audit(report: &AuditReport) -> String {
    let mut md = String::from("\n## Audit\n\n");
    if report.is_clean() {
        md.push_str("No security vulnerabilities found.\n");
        return md;
    }

    let findings = report.findings();
    if !findings.is_empty() {
        md.push_str("Vulnerabilities found:\n\n");
        for (repo, ids) in &findings {
            md.push_str(&format!("- {repo}: {}\n", ids.join(", ")));
        }
    }

    let errors = report.errors();
    if !errors.is_empty() {
        md.push_str("\nAudit errors:\n\n");
        for (repo, detail) in &errors {
            md.push_str(&format!("- {repo}: {detail}\n"));
        }
    }

    let advisories = report.advisories();
    if !advisories.is_empty() {
        md.push_str("\n### Advisory details\n");
        for advisory in advisories.values() {
            md.push('\n');
            for (key, value) in &advisory.fields {
                md.push_str(&format!("{key}: {value}\n"));
            }
        }
    }
    md
}

/// Accumulates results for one [`FleetReport`].
pub struct ReportAggregator {
    report: FleetReport,
}

impl ReportAggregator {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            report: FleetReport {
                title: title.into(),
                generated_at: Utc::now(),
                rows: Vec::new(),
                failures: Vec::new(),
                consistency: None,
                audit: None,
                statuses: Vec::new(),
                notes: Vec::new(),
            },
        }
    }

    pub fn add_deploy_results(&mut self, results: &[DeployResult]) {
        self.add_unit_results(results, FailureKind::Deploy);
    }

    /// SSH check results share the unit shape of deploy results.
    pub fn add_ssh_results(&mut self, results: &[DeployResult]) {
        self.add_unit_results(results, FailureKind::SshCheck);
    }

    fn add_unit_results(&mut self, results: &[DeployResult], kind: FailureKind) {
        for result in results {
            let label = result.unit.label();
            if !result.succeeded() {
                self.report.failures.push(FailureDetail {
                    kind,
                    label: result.repo().to_string(),
                    environment: Some(result.environment().to_string()),
                    output: result.output.clone(),
                });
            }
            self.report.rows.push(ReportRow {
                repo: result.repo().to_string(),
                label,
                result: result.state.to_string(),
                ok: result.succeeded(),
            });
        }
    }

    pub fn add_tag_outcomes(&mut self, outcomes: &[TagOutcome]) {
        for outcome in outcomes {
            if !outcome.success {
                self.report.failures.push(FailureDetail {
                    kind: FailureKind::Command,
                    label: outcome.repo.clone(),
                    environment: None,
                    output: outcome.output.clone(),
                });
            }
            self.report.rows.push(ReportRow {
                repo: outcome.repo.clone(),
                label: outcome.repo.clone(),
                result: if outcome.success { "success" } else { "FAILED" }.to_string(),
                ok: outcome.success,
            });
        }
    }

    /// A repository without the tag counts as a failure.
    pub fn add_tag_statuses(&mut self, statuses: &BTreeMap<String, TagStatus>) {
        for (repo, status) in statuses {
            self.report.rows.push(ReportRow {
                repo: repo.clone(),
                label: repo.clone(),
                result: status.to_string(),
                ok: *status == TagStatus::Found,
            });
        }
    }

    pub fn set_consistency(&mut self, report: ConsistencyReport) {
        self.report.consistency = Some(report);
    }

    pub fn set_audit(&mut self, report: AuditReport) {
        self.report.audit = Some(report);
    }

    pub fn add_status_checks(&mut self, checks: Vec<StatusCheck>) {
        self.report.statuses.extend(checks);
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.report.notes.push(note.into());
    }

    pub fn has_failures(&self) -> bool {
        self.report.has_failures()
    }

    /// Sort everything into report order and hand back the report.
    pub fn finish(mut self) -> FleetReport {
        self.report
            .rows
            .sort_by(|a, b| (&a.repo, &a.label).cmp(&(&b.repo, &b.label)));
        self.report.failures.sort_by(|a, b| {
            (&a.label, &a.environment).cmp(&(&b.label, &b.environment))
        });
        self.report.statuses.sort_by(|a, b| a.repo.cmp(&b.repo));
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RepoAudit;
    use crate::consistency::VersionMap;
    use crate::exec::CommandOutput;
    use crate::model::{DeployUnit, UnitState};

    fn result(repo: &str, env: &str, primary: bool, ok: bool, output: &str) -> DeployResult {
        DeployResult {
            unit: DeployUnit {
                repo: repo.to_string(),
                environment: env.to_string(),
                primary,
            },
            state: if ok {
                UnitState::Succeeded
            } else {
                UnitState::Failed
            },
            output: output.to_string(),
        }
    }

    #[test]
    fn test_rows_sorted_regardless_of_insertion_order() {
        let mut agg = ReportAggregator::new("Deploy to prod");
        agg.add_deploy_results(&[
            result("org/c", "prod", true, true, "ok"),
            result("org/b", "extra", false, true, "ok"),
            result("org/a", "prod", true, true, "ok"),
            result("org/b", "prod", true, true, "ok"),
        ]);
        let report = agg.finish();
        let labels: Vec<&str> = report.rows.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["org/a", "org/b", "org/b (extra)", "org/c"]);
        assert!(!report.has_failures());
    }

    #[test]
    fn test_failure_output_shown_in_full_success_output_summarized() {
        let mut agg = ReportAggregator::new("Deploy to qa");
        agg.add_deploy_results(&[
            result("org/a", "qa", true, true, "SUCCESS-NOISE"),
            result("org/b", "qa", true, false, "cap aborted!\nSSHKit::Runner::ExecuteError"),
        ]);
        let report = agg.finish();
        assert!(report.has_failures());

        let md = report.render_markdown();
        assert!(md.contains("Output from failed deployment of org/b (qa):"));
        assert!(md.contains("SSHKit::Runner::ExecuteError"));
        assert!(!md.contains("SUCCESS-NOISE"));
        assert!(md.contains("FAILED"));
    }

    #[test]
    fn test_ssh_failure_is_not_labelled_a_deployment() {
        let mut agg = ReportAggregator::new("SSH check for qa");
        agg.add_ssh_results(&[result("org/b", "qa", true, false, "Permission denied (publickey)")]);
        let md = agg.finish().render_markdown();
        assert!(md.contains("Output from failed SSH check of org/b (qa):"));
        assert!(!md.contains("failed deployment"));
    }

    #[test]
    fn test_tag_not_found_is_failure() {
        let mut agg = ReportAggregator::new("Verify tag rel-1");
        let statuses: BTreeMap<String, TagStatus> = [
            ("org/a".to_string(), TagStatus::Found),
            ("org/b".to_string(), TagStatus::NotFound),
        ]
        .into_iter()
        .collect();
        agg.add_tag_statuses(&statuses);
        assert!(agg.has_failures());
    }

    #[test]
    fn test_consistency_rendering_names_target() {
        let versions: VersionMap = [
            ("org/b".to_string(), "0.62.1".to_string()),
            ("org/a".to_string(), "0.62.0".to_string()),
        ]
        .into_iter()
        .collect();
        let report = ConsistencyReport::from_versions(
            "cocina-models",
            DeployTarget::Tag("rel-1".to_string()),
            versions,
            vec!["org/z".to_string()],
        );
        let md = render_consistency(&report);
        assert!(md.contains("for tag rel-1 of repos"));
        let first = md.find("0.62.0").unwrap();
        let second = md.find("0.62.1").unwrap();
        assert!(first < second);
        assert!(md.contains("Not using cocina-models: org/z"));
        assert!(md.contains("Verdict: minor_divergent"));
    }

    #[test]
    fn test_audit_groups_shared_advisory_once() {
        let findings = "Name: rack\nAdvisory: CVE-2022-44570\nTitle: DoS in Range header\n\nVulnerabilities found!\n";
        let out = CommandOutput::failed(findings);
        let mut agg = ReportAggregator::new("Audit");
        agg.set_audit(AuditReport::new(vec![
            RepoAudit::from_output("org/a", &out),
            RepoAudit::from_output("org/b", &out),
        ]));
        let report = agg.finish();
        assert!(report.has_failures());

        let md = report.render_markdown();
        assert!(md.contains("- org/a: CVE-2022-44570"));
        assert!(md.contains("- org/b: CVE-2022-44570"));
        assert_eq!(md.matches("Title: DoS in Range header").count(), 1);
    }

    #[test]
    fn test_json_report() {
        let mut agg = ReportAggregator::new("Deploy");
        agg.add_deploy_results(&[result("org/a", "stage", true, true, "")]);
        let json = agg.finish().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["rows"][0]["result"], "success");
    }
}
