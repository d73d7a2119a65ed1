//! Best-effort post-deploy status checks.
//!
//! A status check never fails a deploy: transport errors become
//! [`StatusOutcome::Unknown`].

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::Repository;
use crate::release::ReleaseTool;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StatusOutcome {
    Up,
    Down(u16),
    Unknown(String),
}

impl StatusOutcome {
    pub fn from_code(code: u16) -> Self {
        if code == 200 {
            Self::Up
        } else {
            Self::Down(code)
        }
    }
}

impl fmt::Display for StatusOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => f.write_str("up"),
            Self::Down(code) => write!(f, "DOWN ({code})"),
            Self::Unknown(reason) => write!(f, "unknown ({reason})"),
        }
    }
}

/// Status of one repository in one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCheck {
    pub repo: String,
    pub url: String,
    pub outcome: StatusOutcome,
}

pub struct StatusChecker {
    client: reqwest::Client,
}

impl StatusChecker {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub async fn check_url(&self, url: &str) -> StatusOutcome {
        match self.client.get(url).send().await {
            Ok(resp) => StatusOutcome::from_code(resp.status().as_u16()),
            Err(e) => {
                debug!(url = %url, error = %e, "status check failed");
                StatusOutcome::Unknown(e.to_string())
            }
        }
    }

    /// Check the configured status URL of every repository that has one for
    /// `environment`. Repositories without a URL are left out.
    pub async fn check_all(&self, repos: &[Repository], environment: &str) -> Vec<StatusCheck> {
        let mut checks = Vec::new();
        for repo in repos {
            let Some(url) = repo.status.get(environment) else {
                continue;
            };
            checks.push(StatusCheck {
                repo: repo.name.clone(),
                url: url.clone(),
                outcome: self.check_url(url).await,
            });
        }
        checks
    }
}

/// Warn when the status URL in configuration disagrees with the server the
/// repository's own deploy configuration declares. Returns `true` on a
/// mismatch.
pub async fn warn_on_url_mismatch(
    release: &dyn ReleaseTool,
    dir: &Path,
    repo: &Repository,
    environment: &str,
) -> bool {
    let configured = repo.status.get(environment).map(String::as_str);
    let declared = release.configured_server_url(dir, environment).await;
    if configured == declared.as_deref() {
        return false;
    }
    warn!(
        repo = %repo.name,
        environment = %environment,
        configured = configured.unwrap_or("-"),
        declared = declared.as_deref().unwrap_or("-"),
        "status url differs from server declared in deploy configuration"
    );
    true
}
