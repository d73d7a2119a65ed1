//! Error taxonomy for fleet orchestration.
//!
//! Only pre-flight failures are errors. Per-unit failures (a deploy that
//! exits non-zero, a tag that could not be pushed, an audit with findings)
//! are captured as data in their result types and never raised.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a fleet run before any deploy work is dispatched.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Cloning a missing working copy failed.
    #[error("failed to create cache for {repo} at {}: {output}", path.display())]
    CacheCreate {
        repo: String,
        path: PathBuf,
        output: String,
    },

    /// Fetching or resetting an existing working copy failed.
    #[error("failed to refresh cache for {repo} at {}: {output}", path.display())]
    CacheRefresh {
        repo: String,
        path: PathBuf,
        output: String,
    },

    /// A pinned tag is absent from some repositories.
    #[error("git tag '{tag}' is missing in these repos: {}", repos.join(", "))]
    MissingTag { tag: String, repos: Vec<String> },

    /// The operator declined (or could not be asked) at a confirmation gate.
    #[error("{gate} aborted: {reason}")]
    ConfirmationDeclined { gate: String, reason: String },

    /// Dependency versions diverge beyond what the policy tolerates.
    #[error("{dependency} version divergence blocks deploy: {}", groups.join("; "))]
    DivergenceBlocked {
        dependency: String,
        groups: Vec<String>,
    },

    /// A scoped checkout could not be entered or restored.
    #[error("checkout of {reference} in {repo} failed: {output}")]
    Checkout {
        repo: String,
        reference: String,
        output: String,
    },

    /// Reading a lockfile or manifest failed.
    #[error("manifest error for {repo}: {detail}")]
    Manifest { repo: String, detail: String },

    /// The release tool's configuration could not be rewritten.
    #[error("release tool error for {repo}: {detail}")]
    ReleaseTool { repo: String, detail: String },

    /// Invalid or inconsistent configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Invalid repository selection (e.g. both --only and --except).
    #[error("selection error: {0}")]
    Selection(String),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for fleet operations.
pub type Result<T> = std::result::Result<T, FleetError>;
