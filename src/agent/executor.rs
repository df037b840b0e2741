//! Executes sandbox-approved tool calls inside a workspace.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::exec::{argv, ExecBackend, ExecOutput};
use crate::sandbox::{paths, ToolKind};

use super::runner::{ToolArgs, ToolCall};

/// Output handed back to the agent is capped at this many bytes.
pub const DEFAULT_MAX_OUTPUT: usize = 16 * 1024;

/// Result of one tool call as seen by the agent's next turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool: ToolKind,
    pub input: String,
    /// False when the sandbox denied the call; it was never executed.
    pub allowed: bool,
    pub success: bool,
    pub output: String,
}

impl ToolOutcome {
    pub fn denied(call: &ToolCall, reason: impl Into<String>) -> Self {
        Self {
            tool: call.tool,
            input: call.input.clone(),
            allowed: false,
            success: false,
            output: reason.into(),
        }
    }

    fn finished(call: &ToolCall, result: Result<String>, max_output: usize) -> Self {
        let (success, output) = match result {
            Ok(output) => (true, output),
            Err(e) => (false, e.to_string()),
        };
        Self {
            tool: call.tool,
            input: call.input.clone(),
            allowed: true,
            success,
            output: truncate(output, max_output),
        }
    }
}

/// Runs tool calls against the filesystem and the execution backend.
#[derive(Clone)]
pub struct ToolExecutor {
    backend: Arc<dyn ExecBackend>,
    max_output: usize,
}

impl ToolExecutor {
    pub fn new(backend: Arc<dyn ExecBackend>) -> Self {
        Self {
            backend,
            max_output: DEFAULT_MAX_OUTPUT,
        }
    }

    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output = bytes;
        self
    }

    /// Executes a call the sandbox already allowed.
    ///
    /// Tool failures are reported in the outcome so the agent can react;
    /// they do not fail the run.
    pub async fn execute(&self, call: &ToolCall, workspace: &Path) -> ToolOutcome {
        let result = self.dispatch(call, workspace).await;
        if let Err(e) = &result {
            tracing::debug!(tool = %call.tool, input = %call.input, error = %e, "tool call failed");
        }
        ToolOutcome::finished(call, result, self.max_output)
    }

    async fn dispatch(&self, call: &ToolCall, workspace: &Path) -> Result<String> {
        match call.tool {
            ToolKind::FileRead => {
                let path = resolve(workspace, &call.input)?;
                Ok(tokio::fs::read_to_string(&path).await?)
            }
            ToolKind::FileWrite => {
                let ToolArgs::Content { text } = &call.args else {
                    return Err(Error::Validation("file_write needs content".to_string()));
                };
                let path = resolve(workspace, &call.input)?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, text).await?;
                Ok(format!("wrote {} bytes to {}", text.len(), call.input))
            }
            ToolKind::FileEdit => {
                let ToolArgs::Replace { old, new } = &call.args else {
                    return Err(Error::Validation("file_edit needs old and new text".to_string()));
                };
                let path = resolve(workspace, &call.input)?;
                let content = tokio::fs::read_to_string(&path).await?;
                match content.matches(old.as_str()).count() {
                    0 => Err(Error::Validation(format!("text not found in {}", call.input))),
                    1 => {
                        tokio::fs::write(&path, content.replacen(old.as_str(), new, 1)).await?;
                        Ok(format!("edited {}", call.input))
                    }
                    n => Err(Error::Validation(format!(
                        "text matches {} places in {}; make it unique",
                        n, call.input
                    ))),
                }
            }
            ToolKind::ListDir => {
                let input = if call.input.trim().is_empty() { "." } else { call.input.as_str() };
                let path = resolve(workspace, input)?;
                let mut entries = tokio::fs::read_dir(&path).await?;
                let mut names = Vec::new();
                while let Some(entry) = entries.next_entry().await? {
                    let mut name = entry.file_name().to_string_lossy().into_owned();
                    if entry.file_type().await?.is_dir() {
                        name.push('/');
                    }
                    names.push(name);
                }
                names.sort();
                Ok(names.join("\n"))
            }
            ToolKind::Search => {
                let ToolArgs::Pattern { pattern } = &call.args else {
                    return Err(Error::Validation("search needs a pattern".to_string()));
                };
                let input = if call.input.trim().is_empty() { "." } else { call.input.as_str() };
                let output = self
                    .backend
                    .exec(
                        workspace,
                        &argv(["grep", "-rnE", "--exclude-dir=.git", "--", pattern.as_str(), input]),
                    )
                    .await?;
                // grep exits 1 when nothing matched.
                match output.exit_code {
                    Some(0) => Ok(output.stdout),
                    Some(1) => Ok(String::new()),
                    _ => Err(command_failed("grep", &output)),
                }
            }
            ToolKind::Shell => {
                let output = self
                    .backend
                    .exec(workspace, &argv(["sh", "-c", call.input.as_str()]))
                    .await?;
                let combined = combine(&output);
                if output.success() {
                    Ok(combined)
                } else {
                    Err(Error::Execution(format!(
                        "exit code {:?}\n{}",
                        output.exit_code, combined
                    )))
                }
            }
            ToolKind::NetworkFetch => {
                let output = self
                    .backend
                    .exec(
                        workspace,
                        &argv(["curl", "-fsSL", "--max-time", "30", "--", call.input.trim()]),
                    )
                    .await?;
                if output.success() {
                    Ok(output.stdout)
                } else {
                    Err(command_failed("curl", &output))
                }
            }
        }
    }
}

fn resolve(workspace: &Path, raw: &str) -> Result<PathBuf> {
    paths::resolve(workspace, raw.trim()).ok_or_else(|| Error::PathTraversal(PathBuf::from(raw)))
}

fn combine(output: &ExecOutput) -> String {
    match (output.stdout.is_empty(), output.stderr.is_empty()) {
        (_, true) => output.stdout.clone(),
        (true, false) => output.stderr.clone(),
        (false, false) => format!("{}\n{}", output.stdout, output.stderr),
    }
}

fn command_failed(program: &str, output: &ExecOutput) -> Error {
    Error::Execution(format!(
        "{} exited with {:?}: {}",
        program,
        output.exit_code,
        output.stderr.trim()
    ))
}

fn truncate(mut text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n[output truncated]");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::LocalBackend;
    use tempfile::TempDir;

    fn executor() -> ToolExecutor {
        ToolExecutor::new(Arc::new(LocalBackend::new()))
    }

    #[tokio::test]
    async fn write_read_and_edit_files() {
        let dir = TempDir::new().unwrap();
        let exec = executor();

        let wrote = exec
            .execute(&ToolCall::write("src/notes.txt", "hello world"), dir.path())
            .await;
        assert!(wrote.success, "{}", wrote.output);

        let edited = exec
            .execute(&ToolCall::edit("src/notes.txt", "world", "there"), dir.path())
            .await;
        assert!(edited.success, "{}", edited.output);

        let read = exec.execute(&ToolCall::read("src/notes.txt"), dir.path()).await;
        assert_eq!(read.output, "hello there");
    }

    #[tokio::test]
    async fn edit_requires_unique_match() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x x").unwrap();
        let outcome = executor()
            .execute(&ToolCall::edit("a.txt", "x", "y"), dir.path())
            .await;
        assert!(!outcome.success);
        assert!(outcome.output.contains("2 places"));
    }

    #[tokio::test]
    async fn list_dir_marks_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();
        let outcome = executor()
            .execute(&ToolCall::new(ToolKind::ListDir, ""), dir.path())
            .await;
        assert_eq!(outcome.output, "README.md\nsrc/");
    }

    #[tokio::test]
    async fn shell_failure_is_reported_not_raised() {
        let dir = TempDir::new().unwrap();
        let exec = executor();
        let ok = exec.execute(&ToolCall::shell("echo hi"), dir.path()).await;
        assert!(ok.success);
        assert_eq!(ok.output.trim(), "hi");

        let failed = exec.execute(&ToolCall::shell("exit 2"), dir.path()).await;
        assert!(failed.allowed);
        assert!(!failed.success);
    }

    #[tokio::test]
    async fn search_with_no_match_is_empty_success() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn main() {}\n").unwrap();
        let exec = executor();

        let hit = exec.execute(&ToolCall::search(".", "fn main"), dir.path()).await;
        assert!(hit.success);
        assert!(hit.output.contains("a.rs"));

        let miss = exec.execute(&ToolCall::search(".", "nothing_here"), dir.path()).await;
        assert!(miss.success);
        assert!(miss.output.is_empty());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let out = truncate("héllo".to_string(), 2);
        assert!(out.starts_with('h'));
        assert!(out.ends_with("[output truncated]"));
    }
}
