//! Worktree status state machine and its guards.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};

use crate::error::{Error, Result};
use crate::model::{Worktree, WorktreeStatus};

use super::git::StatusReport;

pub struct WorktreeLifecycle;

impl WorktreeLifecycle {
    pub fn can_transition(from: WorktreeStatus, to: WorktreeStatus) -> bool {
        use WorktreeStatus as S;
        matches!(
            (from, to),
            (S::Creating, S::Initializing)
                | (S::Creating, S::Error)
                | (S::Initializing, S::Active)
                | (S::Initializing, S::Error)
                | (S::Active, S::Dirty)
                | (S::Dirty, S::Active)
                | (S::Active | S::Dirty, S::Committing)
                | (S::Committing, S::Active)
                | (S::Committing, S::Error)
                | (S::Active, S::Merging)
                | (S::Merging, S::Active)
                | (S::Merging, S::Conflict)
                | (S::Merging, S::Error)
                | (S::Conflict, S::Active)
                | (S::Active | S::Dirty | S::Conflict | S::Error, S::Removing)
                | (S::Removing, S::Removed)
                | (S::Removing, S::Error)
        )
    }

    /// Moves `worktree` to `to`. Returns false if it was already there.
    pub fn apply(worktree: &mut Worktree, to: WorktreeStatus) -> Result<bool> {
        if worktree.status == to {
            return Ok(false);
        }
        if !Self::can_transition(worktree.status, to) {
            return Err(Error::transition("worktree", worktree.status, to));
        }
        tracing::debug!(
            worktree_id = %worktree.id,
            from = %worktree.status,
            to = %to,
            "worktree status transition"
        );
        worktree.status = to;
        worktree.touch();
        Ok(true)
    }

    /// Branch and path must be unused by git and by every live worktree.
    pub fn can_create(
        branch: &str,
        path: &Path,
        live: &[Worktree],
        branch_exists: bool,
        path_exists: bool,
    ) -> Result<()> {
        if branch.trim().is_empty() {
            return Err(Error::Validation("branch name cannot be empty".to_string()));
        }
        if branch_exists
            || live
                .iter()
                .any(|w| w.status != WorktreeStatus::Removed && w.branch == branch)
        {
            return Err(Error::BranchExists(branch.to_string()));
        }
        if path_exists
            || live
                .iter()
                .any(|w| w.status != WorktreeStatus::Removed && w.path == path)
        {
            return Err(Error::WorktreeCreationFailed(format!(
                "path {} is already in use",
                path.display()
            )));
        }
        Ok(())
    }

    /// A merge needs an active worktree with everything committed.
    pub fn can_merge(worktree: &Worktree, report: &StatusReport) -> Result<()> {
        if report.has_conflicts() || worktree.status == WorktreeStatus::Conflict {
            return Err(Error::MergeConflict {
                branch: worktree.branch.clone(),
                files: report.conflicted.clone(),
            });
        }
        if report.is_dirty() {
            return Err(Error::Validation(format!(
                "worktree {} has uncommitted changes",
                worktree.id
            )));
        }
        if worktree.status != WorktreeStatus::Active {
            return Err(Error::transition("worktree", worktree.status, WorktreeStatus::Merging));
        }
        Ok(())
    }

    /// Removal is never allowed mid-flight. Conflicted or dirty worktrees
    /// need `force`.
    pub fn can_remove(status: WorktreeStatus, force: bool) -> bool {
        match status {
            WorktreeStatus::Creating
            | WorktreeStatus::Initializing
            | WorktreeStatus::Committing
            | WorktreeStatus::Merging
            | WorktreeStatus::Removing => false,
            WorktreeStatus::Conflict | WorktreeStatus::Dirty => force,
            WorktreeStatus::Active | WorktreeStatus::Error | WorktreeStatus::Removed => true,
        }
    }

    /// Active with no activity for at least `threshold`.
    pub fn is_stale(worktree: &Worktree, now: DateTime<Utc>, threshold: Duration) -> bool {
        worktree.status == WorktreeStatus::Active && now - worktree.last_activity >= threshold
    }
}
