//! Pre-flight confirmation gate.
//!
//! [`ConfirmationGate::evaluate`] is pure: from the deploy target, the
//! repositories in the run and the environment it decides which operator
//! confirmations are needed. [`ConfirmationGate::resolve`] asks them through
//! an injected [`Prompter`]; any decline aborts the whole run before a single
//! deploy unit is dispatched.

use serde::{Deserialize, Serialize};

use crate::consistency::{ConsistencyReport, Divergence};
use crate::error::{FleetError, Result};
use crate::model::{DeployTarget, Repository};
use crate::obs::emit_gate_evaluated;

/// Asks the operator a yes/no question.
pub trait Prompter: Send + Sync {
    /// `default` is the answer an empty reply selects.
    fn confirm(&self, question: &str, default: bool) -> bool;
}

/// Why a confirmation is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfirmationKind {
    /// Deploying the floating default branch of every repository.
    DefaultBranch,
    /// Repositories whose policy requires approval for the environment.
    ApprovalRequired {
        environment: String,
        repos: Vec<String>,
    },
    /// Tolerable dependency skew that still needs an explicit go-ahead.
    Divergence { dependency: String },
}

/// A single question for the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub kind: ConfirmationKind,
    pub message: String,
    /// Answer selected by an empty reply.
    pub default: bool,
    /// Diagnostic printed when the operator declines.
    pub decline_reason: String,
}

impl ConfirmationRequest {
    pub fn default_branch() -> Self {
        Self {
            kind: ConfirmationKind::DefaultBranch,
            message: "You are deploying without a tag, which will deploy the default branch \
                      of all repos. Are you sure?"
                .to_string(),
            default: false,
            decline_reason: "deployment to default branch declined".to_string(),
        }
    }

    pub fn approval(environment: &str, repos: Vec<String>) -> Self {
        let message = format!(
            "Some repos require approval before being deployed to {environment} ({}). \
             Has this been approved?",
            repos.join(", ")
        );
        Self {
            kind: ConfirmationKind::ApprovalRequired {
                environment: environment.to_string(),
                repos,
            },
            message,
            default: false,
            decline_reason: "deployment not approved".to_string(),
        }
    }

    /// Patch-level divergence lists exact versions; wider divergence lists
    /// the major.minor groups.
    pub fn divergence(report: &ConsistencyReport) -> Self {
        let (level, groups) = match report.verdict {
            Divergence::MajorDivergent => ("major/minor", report.group_summaries()),
            Divergence::Uniform | Divergence::MinorDivergent => (
                "patch-level",
                report
                    .groups()
                    .into_iter()
                    .map(|(version, repos)| format!("{version}: {}", repos.join(", ")))
                    .collect(),
            ),
        };
        let message = format!(
            "Found divergence in {} {level} versions ({}). Continue with deploy?",
            report.dependency,
            groups.join("; ")
        );
        Self {
            kind: ConfirmationKind::Divergence {
                dependency: report.dependency.clone(),
            },
            message,
            default: true,
            decline_reason: format!("{} version divergence not accepted", report.dependency),
        }
    }

    /// Name used in logs and abort diagnostics.
    pub fn gate_name(&self) -> &'static str {
        match self.kind {
            ConfirmationKind::DefaultBranch => "default-branch confirmation",
            ConfirmationKind::ApprovalRequired { .. } => "approval confirmation",
            ConfirmationKind::Divergence { .. } => "divergence confirmation",
        }
    }
}

/// Result of evaluating the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    /// Every request must be confirmed, in order.
    Prompt(Vec<ConfirmationRequest>),
}

pub struct ConfirmationGate;

impl ConfirmationGate {
    /// Decide which confirmations a deploy of `repos` to `environment` needs.
    pub fn evaluate(
        target: &DeployTarget,
        repos: &[Repository],
        environment: &str,
    ) -> GateDecision {
        let mut requests = Vec::new();
        if !target.is_pinned() {
            requests.push(ConfirmationRequest::default_branch());
        }
        let flagged = Self::repos_requiring_confirmation(repos, environment);
        if !flagged.is_empty() {
            requests.push(ConfirmationRequest::approval(environment, flagged));
        }

        if requests.is_empty() {
            GateDecision::Proceed
        } else {
            GateDecision::Prompt(requests)
        }
    }

    /// Names of repositories flagged for manual approval in `environment`.
    pub fn repos_requiring_confirmation(repos: &[Repository], environment: &str) -> Vec<String> {
        repos
            .iter()
            .filter(|r| r.requires_confirmation(environment))
            .map(|r| r.name.clone())
            .collect()
    }

    /// Ask every pending confirmation; the first decline aborts.
    pub fn resolve(decision: &GateDecision, prompter: &dyn Prompter) -> Result<()> {
        if let GateDecision::Prompt(requests) = decision {
            for request in requests {
                Self::confirm(request, prompter)?;
            }
        }
        Ok(())
    }

    /// Ask a single confirmation.
    pub fn confirm(request: &ConfirmationRequest, prompter: &dyn Prompter) -> Result<()> {
        let accepted = prompter.confirm(&request.message, request.default);
        emit_gate_evaluated(request.gate_name(), accepted);
        if accepted {
            Ok(())
        } else {
            Err(FleetError::ConfirmationDeclined {
                gate: request.gate_name().to_string(),
                reason: request.decline_reason.clone(),
            })
        }
    }
}
