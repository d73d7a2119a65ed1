//! Structured observability hooks for fleet run lifecycle events.
//!
//! - Run-scoped tracing spans via the `RunSpan` RAII guard
//! - Emission functions for cache sync, gates, divergence checks and deploy units
//!
//! All events carry a stable `event` field so log pipelines can filter on it.

use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{DeployTarget, DeployUnit, UnitState};

/// RAII guard that enters a run-scoped tracing span for one command.
///
/// ```ignore
/// let span = RunSpan::enter("deploy");
/// // every event below is tagged with span.run_id()
/// ```
pub struct RunSpan {
    run_id: String,
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    /// Create and enter a span tagged with a fresh run id and the command name.
    pub fn enter(command: &str) -> Self {
        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("fleet.run", run_id = %run_id, command = %command);
        Self {
            run_id,
            _span: span.entered(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

/// Emit event: a working copy was created or refreshed.
pub fn emit_cache_synced(repo: &str, created: bool, commit: &str) {
    let operation = if created { "created" } else { "updated" };
    info!(
        event = "cache.synced",
        repo = %repo,
        operation = operation,
        commit = %commit,
    );
}

/// Emit event: a working copy outside the active set was removed.
pub fn emit_cache_pruned(path: &str) {
    info!(event = "cache.pruned", path = %path);
}

/// Emit event: a pre-flight gate finished.
pub fn emit_gate_evaluated(gate: &str, passed: bool) {
    if passed {
        info!(event = "gate.evaluated", gate = %gate, passed = passed);
    } else {
        warn!(event = "gate.evaluated", gate = %gate, passed = passed);
    }
}

/// Emit event: dependency divergence classified.
pub fn emit_divergence_checked(
    dependency: &str,
    target: &DeployTarget,
    verdict: &str,
    versions: usize,
) {
    info!(
        event = "dependency.checked",
        dependency = %dependency,
        target = %target,
        verdict = %verdict,
        distinct_versions = versions,
    );
}

/// Emit event: a deploy unit moved to `Running`.
pub fn emit_unit_started(unit: &DeployUnit) {
    info!(
        event = "unit.started",
        repo = %unit.repo,
        environment = %unit.environment,
        primary = unit.primary,
    );
}

/// Emit event: a deploy unit reached a terminal state.
pub fn emit_unit_finished(unit: &DeployUnit, state: UnitState, duration_ms: u64) {
    if state == UnitState::Succeeded {
        info!(
            event = "unit.finished",
            repo = %unit.repo,
            environment = %unit.environment,
            state = %state,
            duration_ms = duration_ms,
        );
    } else {
        warn!(
            event = "unit.finished",
            repo = %unit.repo,
            environment = %unit.environment,
            state = %state,
            duration_ms = duration_ms,
        );
    }
}
