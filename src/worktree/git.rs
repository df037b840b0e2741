//! Git plumbing over the execution backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::exec::{render, ExecBackend, ExecOutput};
use crate::model::FileChange;

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedWorktree {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
    #[serde(default)]
    pub prunable: bool,
}

/// Parsed `git status --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Paths with staged, unstaged or untracked changes.
    pub changed: Vec<PathBuf>,
    /// Paths with unresolved merge conflicts.
    pub conflicted: Vec<PathBuf>,
}

impl StatusReport {
    pub fn is_dirty(&self) -> bool {
        !self.changed.is_empty() || !self.conflicted.is_empty()
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicted.is_empty()
    }
}

/// Runs git through an [`ExecBackend`].
#[derive(Clone)]
pub struct GitCli {
    backend: Arc<dyn ExecBackend>,
}

impl GitCli {
    pub fn new(backend: Arc<dyn ExecBackend>) -> Self {
        Self { backend }
    }

    /// Runs git and returns the raw output whatever the exit code.
    pub async fn output(&self, cwd: &Path, args: &[&str]) -> Result<ExecOutput> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push("git".to_string());
        argv.extend(args.iter().map(|a| a.to_string()));
        self.backend.exec(cwd, &argv).await
    }

    /// Runs git and fails unless it exits successfully.
    pub async fn run(&self, cwd: &Path, args: &[&str]) -> Result<ExecOutput> {
        let output = self.output(cwd, args).await?;
        if !output.success() {
            let mut argv = vec!["git".to_string()];
            argv.extend(args.iter().map(|a| a.to_string()));
            return Err(Error::Git(format!(
                "{} exited with {:?}: {}",
                render(&argv),
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    /// Resolves a revision to an object id, `None` if it does not exist.
    pub async fn rev_parse(&self, cwd: &Path, rev: &str) -> Result<Option<String>> {
        let output = self
            .output(cwd, &["rev-parse", "--verify", "--quiet", rev])
            .await?;
        if output.success() {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    pub async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let full = format!("refs/heads/{}", branch);
        Ok(self.rev_parse(repo, &full).await?.is_some())
    }

    /// Branch checked out at `cwd`, `None` when HEAD is detached.
    pub async fn current_branch(&self, cwd: &Path) -> Result<Option<String>> {
        let output = self
            .output(cwd, &["symbolic-ref", "--quiet", "--short", "HEAD"])
            .await?;
        if output.success() {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// True if `ancestor` is reachable from `descendant`.
    pub async fn is_ancestor(&self, cwd: &Path, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = self
            .output(cwd, &["merge-base", "--is-ancestor", ancestor, descendant])
            .await?;
        match output.exit_code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(Error::Git(format!(
                "merge-base --is-ancestor failed: {}",
                output.stderr.trim()
            ))),
        }
    }

    pub async fn status(&self, cwd: &Path) -> Result<StatusReport> {
        let output = self
            .run(cwd, &["status", "--porcelain", "--untracked-files=all"])
            .await?;
        Ok(parse_status(&output.stdout))
    }

    pub async fn worktree_list(&self, repo: &Path) -> Result<Vec<ListedWorktree>> {
        let output = self.run(repo, &["worktree", "list", "--porcelain"]).await?;
        parse_worktree_list(&output.stdout)
    }
}

/// Parses `git worktree list --porcelain` into entries.
pub fn parse_worktree_list(raw: &str) -> Result<Vec<ListedWorktree>> {
    let mut listed = Vec::new();

    let mut current_path: Option<PathBuf> = None;
    let mut current_branch: Option<String> = None;
    let mut current_head: Option<String> = None;
    let mut prunable = false;

    for line in raw.lines().chain(std::iter::once("")) {
        if line.trim().is_empty() {
            if let Some(path) = current_path.take() {
                listed.push(ListedWorktree {
                    path,
                    branch: current_branch.take(),
                    head: current_head.take(),
                    prunable,
                });
            }
            prunable = false;
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest.trim()));
        } else if let Some(rest) = line.strip_prefix("branch ") {
            current_branch = Some(rest.trim().trim_start_matches("refs/heads/").to_string());
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.trim().to_string());
        } else if line.starts_with("prunable") {
            prunable = true;
        }
    }

    if listed.is_empty() && !raw.trim().is_empty() {
        return Err(Error::Git(
            "unable to parse git worktree list output".to_string(),
        ));
    }

    Ok(listed)
}

/// Parses `git status --porcelain` (v1).
pub fn parse_status(raw: &str) -> StatusReport {
    let mut report = StatusReport::default();
    for line in raw.lines() {
        if line.len() < 4 {
            continue;
        }
        let code = &line[..2];
        let path = line[3..].trim();
        // Renames are reported as "old -> new".
        let path = path.rsplit(" -> ").next().unwrap_or(path);
        let path = PathBuf::from(path.trim_matches('"'));
        if matches!(code, "UU" | "AA" | "DD" | "AU" | "UA" | "DU" | "UD") {
            report.conflicted.push(path);
        } else {
            report.changed.push(path);
        }
    }
    report
}

/// Parses `git diff --numstat`. Binary files count as zero lines.
pub fn parse_numstat(raw: &str) -> Vec<FileChange> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let additions = parts.next()?;
            let deletions = parts.next()?;
            let path = parts.next()?;
            Some(FileChange {
                path: PathBuf::from(path),
                additions: additions.parse().unwrap_or(0),
                deletions: deletions.parse().unwrap_or(0),
            })
        })
        .collect()
}
