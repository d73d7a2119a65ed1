//! Subprocess execution for external tools.
//!
//! Every external collaborator (git, the release tool, the audit tool, ssh)
//! is reduced to the same contract: a success flag plus captured text.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

/// Captured result of one external command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit status was zero.
    pub success: bool,
    /// Exit code, `None` when killed by a signal or never spawned.
    pub exit_code: Option<i32>,
    /// Stdout followed by stderr.
    pub output: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            output: output.into(),
            duration_ms: 0,
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(1),
            output: output.into(),
            duration_ms: 0,
        }
    }

    /// Trimmed output, convenient for single-line answers like a ref name.
    pub fn trimmed(&self) -> &str {
        self.output.trim()
    }
}

/// A command line to run in a working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.dir = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Run to completion. Spawn failures come back as a failed output rather
    /// than an error so callers handle every outcome the same way.
    pub async fn run(&self) -> CommandOutput {
        let start = Instant::now();
        debug!(command = %self, "running external command");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        let result = cmd.output().await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                CommandOutput {
                    success: output.status.success(),
                    exit_code: output.status.code(),
                    output: text,
                    duration_ms,
                }
            }
            Err(e) => CommandOutput {
                success: false,
                exit_code: None,
                output: format!("failed to run {}: {e}", self.program),
                duration_ms,
            },
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
