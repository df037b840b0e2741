//! Execution backend used for git subprocesses and shell tools.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Captured output of one process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs a command in a working directory.
///
/// Implementations may target a local process, a container or a pod. A
/// non-zero exit is not an error at this level; callers decide.
#[async_trait]
pub trait ExecBackend: Send + Sync {
    async fn exec(&self, cwd: &Path, argv: &[String]) -> Result<ExecOutput>;
}

/// Runs commands as local child processes.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecBackend for LocalBackend {
    async fn exec(&self, cwd: &Path, argv: &[String]) -> Result<ExecOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Validation("empty command".to_string()))?;

        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Execution(format!("failed to run {}: {}", render(argv), e)))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

/// Renders argv for logs and error messages.
pub fn render(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("'{}'", arg)
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds an owned argv from string slices.
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}
