//! Fleet Core Library
//!
//! Re-exports the orchestration components for programmatic access: the
//! working-copy cache, the dependency consistency gate, the confirmation gate,
//! tag management, deploy fan-out, audits and the consolidated report.

pub mod audit;
pub mod cache;
pub mod config;
pub mod consistency;
pub mod error;
pub mod exec;
pub mod fakes;
pub mod gate;
pub mod manifest;
pub mod model;
pub mod obs;
pub mod orchestrator;
pub mod release;
pub mod report;
pub mod ssh;
pub mod status;
pub mod tags;
pub mod telemetry;
pub mod vcs;

pub use error::{FleetError, Result};

pub use config::{
    AuditToolConfig, DependencyConfig, FleetConfig, ProgressFileConfig, ReleaseToolConfig,
    RepoSelection, DEFAULT_CONFIG_PATH,
};
pub use model::{DeployResult, DeployTarget, DeployUnit, Repository, UnitState};

pub use cache::{RepoCache, WorkingCopy};
pub use consistency::{
    classify, ConsistencyChecker, ConsistencyReport, Divergence, DivergenceAction,
    DivergencePolicy, VersionMap,
};
pub use gate::{ConfirmationGate, ConfirmationKind, ConfirmationRequest, GateDecision, Prompter};
pub use manifest::{LockfileReader, ManifestReader};
pub use orchestrator::{DeployOrchestrator, DeployRequest, DeployRun};
pub use tags::{ensure_tag_present, TagManager, TagOutcome, TagStatus};

pub use audit::{AuditOutcome, AuditReport, AuditTool, BundleAudit, RepoAudit, RepoAuditor};
pub use exec::{CommandOutput, Invocation};
pub use release::{prepare_all, Capistrano, ReleaseTool};
pub use report::{FailureKind, FleetReport, ReportAggregator};
pub use ssh::{check_control_master, SshChecker};
pub use status::{StatusCheck, StatusChecker, StatusOutcome};
pub use vcs::{GitCli, VersionControl};

pub use obs::RunSpan;
pub use telemetry::init_tracing;

/// Fleet version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
