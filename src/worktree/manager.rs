//! Creates, commits, merges and removes per-task git worktrees.
//!
//! Status changes are read-modify-write cycles under a per-worktree lock.
//! The lock is always released before git runs; the transitional statuses
//! (`creating`, `committing`, `merging`, `removing`) mark the worktree as
//! claimed for the duration of the git call instead.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::WorktreeConfig;
use crate::error::{Error, Result};
use crate::events::{self, kinds, EventPublisher, NoopPublisher};
use crate::exec::ExecBackend;
use crate::locks::EntityLocks;
use crate::model::{
    DiffSummary, FileChange, Project, ProjectId, Task, Worktree, WorktreeId, WorktreeStatus,
};
use crate::store::{Store, StoreExt};

use super::git::{parse_numstat, GitCli, ListedWorktree, StatusReport};
use super::lifecycle::WorktreeLifecycle;

/// Attempts at the base-ref compare-and-swap before giving up.
const MERGE_ATTEMPTS: usize = 3;

/// Result of merging a task branch into its base branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// A merge commit was created on the base branch.
    Merged { commit: String },
    /// The base branch was moved forward to the task branch.
    FastForward { commit: String },
    /// The base branch already contains the task branch.
    AlreadyMerged,
    /// Conflicting edits; the base branch is untouched.
    Conflict { files: Vec<PathBuf> },
}

impl MergeOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, MergeOutcome::Conflict { .. })
    }
}

enum TreeMerge {
    Clean(String),
    Conflict(Vec<PathBuf>),
    Unsupported,
}

/// Git-level isolation for tasks.
pub struct WorktreeManager {
    git: GitCli,
    store: Arc<dyn Store>,
    events: Arc<dyn EventPublisher>,
    locks: EntityLocks<WorktreeId>,
    config: WorktreeConfig,
}

impl WorktreeManager {
    pub fn new(backend: Arc<dyn ExecBackend>, store: Arc<dyn Store>, config: WorktreeConfig) -> Self {
        Self {
            git: GitCli::new(backend),
            store,
            events: Arc::new(NoopPublisher),
            locks: EntityLocks::new(),
            config,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn git(&self) -> &GitCli {
        &self.git
    }

    pub fn config(&self) -> &WorktreeConfig {
        &self.config
    }

    pub fn branch_name(&self, task: &Task) -> String {
        format!("{}/task-{}", self.config.branch_prefix.trim(), task.id.short())
    }

    pub fn worktree_path(&self, project: &Project, task: &Task) -> PathBuf {
        self.config
            .root_dir()
            .join(project.id.short())
            .join(format!("task-{}", task.id.short()))
    }

    /// Applies a status change under the worktree's lock.
    ///
    /// With `claim`, the worktree must actually move, so two callers cannot
    /// both enter the same transitional status.
    async fn set_status(
        &self,
        id: &WorktreeId,
        to: WorktreeStatus,
        error: Option<String>,
        claim: bool,
    ) -> Result<Worktree> {
        let worktree = {
            let _guard = self.locks.lock(id).await;
            let mut worktree = self.store.worktree(id).await?;
            let changed = WorktreeLifecycle::apply(&mut worktree, to)?;
            if claim && !changed {
                return Err(Error::transition("worktree", worktree.status, to));
            }
            if to == WorktreeStatus::Error || error.is_some() {
                worktree.error = error;
            } else if to == WorktreeStatus::Active {
                worktree.error = None;
            }
            self.store.put_worktree(&worktree).await?;
            worktree
        };
        events::emit(
            self.events.as_ref(),
            worktree.id.as_str(),
            kinds::WORKTREE_STATUS_CHANGED,
            json!({ "status": worktree.status, "task_id": worktree.task_id }),
        )
        .await;
        Ok(worktree)
    }

    async fn fail(&self, id: &WorktreeId, message: String) {
        tracing::warn!(worktree_id = %id, error = %message, "worktree operation failed");
        if let Err(e) = self
            .set_status(id, WorktreeStatus::Error, Some(message), false)
            .await
        {
            tracing::error!(worktree_id = %id, error = %e, "failed to record worktree error");
        }
    }

    async fn repo_path(&self, project_id: &ProjectId) -> Result<PathBuf> {
        Ok(self.store.project(project_id).await?.repo_path)
    }

    /// Live (not removed) worktree already created for `task`, if any.
    pub async fn find_live(&self, task: &Task) -> Result<Option<Worktree>> {
        Ok(self
            .store
            .list_worktrees(&task.project_id, None)
            .await?
            .into_iter()
            .find(|w| {
                w.task_id == task.id
                    && !matches!(w.status, WorktreeStatus::Removed | WorktreeStatus::Error)
            }))
    }

    /// Creates the worktree and branch for `task`, forking from the project's
    /// base branch. Fails with `BranchExists` if the branch name is taken.
    ///
    /// If setup fails the record is marked errored and then removed.
    pub async fn create(&self, project: &Project, task: &Task) -> Result<Worktree> {
        let branch = self.branch_name(task);
        let path = self.worktree_path(project, task);

        let live: Vec<Worktree> = self
            .store
            .list_worktrees(&project.id, None)
            .await?
            .into_iter()
            .filter(|w| w.status != WorktreeStatus::Removed)
            .collect();
        let branch_exists = self.git.branch_exists(&project.repo_path, &branch).await?;
        WorktreeLifecycle::can_create(&branch, &path, &live, branch_exists, path.exists())?;

        let now = Utc::now();
        let worktree = Worktree {
            id: WorktreeId::generate(),
            project_id: project.id.clone(),
            task_id: task.id.clone(),
            branch: branch.clone(),
            path: path.clone(),
            base_branch: project.base_branch.clone(),
            status: WorktreeStatus::Creating,
            created_at: now,
            last_activity: now,
            error: None,
        };
        self.store.put_worktree(&worktree).await?;

        match self.check_out(project, &worktree).await {
            Ok(worktree) => {
                tracing::info!(
                    worktree_id = %worktree.id,
                    task_id = %task.id,
                    path = ?path,
                    branch = %branch,
                    "created worktree"
                );
                Ok(worktree)
            }
            Err(e) => {
                self.fail(&worktree.id, e.to_string()).await;
                // Free the branch and path so the task can be started again.
                if let Err(cleanup) = self.remove(&worktree.id, true).await {
                    tracing::warn!(
                        worktree_id = %worktree.id,
                        error = %cleanup,
                        "failed to clean up after worktree creation error"
                    );
                }
                Err(e)
            }
        }
    }

    async fn check_out(&self, project: &Project, worktree: &Worktree) -> Result<Worktree> {
        if let Some(parent) = worktree.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::WorktreeCreationFailed(e.to_string()))?;
        }

        let path_str = worktree.path.to_string_lossy().into_owned();
        self.git
            .run(
                &project.repo_path,
                &[
                    "worktree",
                    "add",
                    "-b",
                    &worktree.branch,
                    &path_str,
                    &project.base_branch,
                ],
            )
            .await
            .map_err(|e| Error::WorktreeCreationFailed(e.to_string()))?;

        self.set_status(&worktree.id, WorktreeStatus::Initializing, None, true)
            .await?;
        if self.git.rev_parse(&worktree.path, "HEAD").await?.is_none() {
            return Err(Error::WorktreeCreationFailed(format!(
                "worktree at {} has no HEAD",
                worktree.path.display()
            )));
        }
        self.set_status(&worktree.id, WorktreeStatus::Active, None, true)
            .await
    }

    /// Reports uncommitted and conflicted paths, syncing `active`/`dirty`.
    pub async fn status(&self, id: &WorktreeId) -> Result<StatusReport> {
        let worktree = self.store.worktree(id).await?;
        let report = self.git.status(&worktree.path).await?;
        let target = match (worktree.status, report.is_dirty()) {
            (WorktreeStatus::Active, true) => Some(WorktreeStatus::Dirty),
            (WorktreeStatus::Dirty, false) => Some(WorktreeStatus::Active),
            _ => None,
        };
        if let Some(to) = target {
            // Another operation may have claimed the worktree meanwhile.
            if let Err(e) = self.set_status(id, to, None, false).await {
                tracing::debug!(worktree_id = %id, error = %e, "status sync skipped");
            }
        }
        Ok(report)
    }

    /// Changes on the task branch relative to its base, plus uncommitted
    /// edits to tracked files.
    pub async fn diff_summary(&self, id: &WorktreeId) -> Result<DiffSummary> {
        let worktree = self.store.worktree(id).await?;
        let range = format!("{}...HEAD", worktree.base_branch);
        let committed = self
            .git
            .run(&worktree.path, &["diff", "--numstat", &range])
            .await?;
        let uncommitted = self
            .git
            .run(&worktree.path, &["diff", "--numstat", "HEAD"])
            .await?;

        let mut by_path: BTreeMap<PathBuf, FileChange> = BTreeMap::new();
        for change in parse_numstat(&committed.stdout)
            .into_iter()
            .chain(parse_numstat(&uncommitted.stdout))
        {
            by_path
                .entry(change.path.clone())
                .and_modify(|c| {
                    c.additions += change.additions;
                    c.deletions += change.deletions;
                })
                .or_insert(change);
        }
        Ok(DiffSummary::from_files(by_path.into_values().collect()))
    }

    /// Stages and commits everything. Returns `None` when there was nothing
    /// to commit.
    pub async fn commit(&self, id: &WorktreeId, message: &str) -> Result<Option<String>> {
        let worktree = self.store.worktree(id).await?;
        if !matches!(worktree.status, WorktreeStatus::Active | WorktreeStatus::Dirty) {
            return Err(Error::transition(
                "worktree",
                worktree.status,
                WorktreeStatus::Committing,
            ));
        }

        let report = self.git.status(&worktree.path).await?;
        if !report.is_dirty() {
            if worktree.status == WorktreeStatus::Dirty {
                self.set_status(id, WorktreeStatus::Active, None, false).await?;
            }
            return Ok(None);
        }

        self.set_status(id, WorktreeStatus::Committing, None, true)
            .await?;
        match self.commit_all(&worktree.path, message).await {
            Ok(hash) => {
                self.set_status(id, WorktreeStatus::Active, None, false).await?;
                tracing::info!(worktree_id = %id, commit = ?hash, "committed worktree changes");
                Ok(hash)
            }
            Err(e) => {
                self.fail(id, e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn commit_all(&self, path: &Path, message: &str) -> Result<Option<String>> {
        self.git.run(path, &["add", "-A"]).await?;

        let commit = self.git.output(path, &["commit", "-m", message]).await?;
        if !commit.success() {
            if commit.stdout.contains("nothing to commit")
                || commit.stderr.contains("nothing to commit")
            {
                return Ok(None);
            }
            return Err(Error::Git(format!(
                "failed to commit: {}",
                commit.stderr.trim()
            )));
        }

        self.git.rev_parse(path, "HEAD").await
    }

    /// Merges the task branch into its base branch.
    ///
    /// Conflicts leave the base branch untouched and move the worktree to
    /// `conflict`. Re-merging an already merged branch is a no-op.
    pub async fn merge(&self, id: &WorktreeId) -> Result<MergeOutcome> {
        let worktree = self.store.worktree(id).await?;
        let repo = self.repo_path(&worktree.project_id).await?;
        let report = self.git.status(&worktree.path).await?;
        WorktreeLifecycle::can_merge(&worktree, &report)?;

        self.set_status(id, WorktreeStatus::Merging, None, true).await?;

        match self.merge_branch(&repo, &worktree).await {
            Ok(MergeOutcome::Conflict { files }) => {
                self.set_status(id, WorktreeStatus::Conflict, None, false)
                    .await?;
                tracing::warn!(
                    worktree_id = %id,
                    branch = %worktree.branch,
                    files = ?files,
                    "merge conflict"
                );
                Ok(MergeOutcome::Conflict { files })
            }
            Ok(outcome) => {
                self.set_status(id, WorktreeStatus::Active, None, false).await?;
                tracing::info!(
                    worktree_id = %id,
                    branch = %worktree.branch,
                    base = %worktree.base_branch,
                    outcome = ?outcome,
                    "merged worktree branch"
                );
                events::emit(
                    self.events.as_ref(),
                    id.as_str(),
                    kinds::WORKTREE_MERGED,
                    json!({ "branch": worktree.branch, "outcome": outcome }),
                )
                .await;
                Ok(outcome)
            }
            Err(e) => {
                // The base ref was never moved; the merge can be retried.
                self.set_status(id, WorktreeStatus::Active, Some(e.to_string()), false)
                    .await?;
                tracing::warn!(worktree_id = %id, error = %e, "merge failed");
                Err(e)
            }
        }
    }

    /// Whether the base branch already contains the worktree branch tip.
    pub async fn is_merged(&self, id: &WorktreeId) -> Result<bool> {
        let worktree = self.store.worktree(id).await?;
        let repo = self.repo_path(&worktree.project_id).await?;
        let base = self
            .git
            .rev_parse(&repo, &format!("refs/heads/{}", worktree.base_branch))
            .await?;
        let tip = self
            .git
            .rev_parse(&repo, &format!("refs/heads/{}", worktree.branch))
            .await?;
        match (base, tip) {
            (Some(base), Some(tip)) => self.git.is_ancestor(&repo, &tip, &base).await,
            _ => Ok(false),
        }
    }

    async fn merge_branch(&self, repo: &Path, worktree: &Worktree) -> Result<MergeOutcome> {
        let base_ref = format!("refs/heads/{}", worktree.base_branch);
        let branch_ref = format!("refs/heads/{}", worktree.branch);

        for attempt in 1..=MERGE_ATTEMPTS {
            let base_old = self
                .git
                .rev_parse(repo, &base_ref)
                .await?
                .ok_or_else(|| Error::Git(format!("base branch {} not found", worktree.base_branch)))?;
            let tip = self
                .git
                .rev_parse(repo, &branch_ref)
                .await?
                .ok_or_else(|| Error::Git(format!("branch {} not found", worktree.branch)))?;

            if self.git.is_ancestor(repo, &tip, &base_old).await? {
                return Ok(MergeOutcome::AlreadyMerged);
            }

            let (new_head, outcome) = if self.git.is_ancestor(repo, &base_old, &tip).await? {
                (tip.clone(), MergeOutcome::FastForward { commit: tip.clone() })
            } else {
                match self.merge_tree(repo, &base_old, &tip).await? {
                    TreeMerge::Clean(tree) => {
                        let message = format!(
                            "Merge branch '{}' into {}",
                            worktree.branch, worktree.base_branch
                        );
                        let commit = self
                            .git
                            .run(
                                repo,
                                &["commit-tree", &tree, "-p", &base_old, "-p", &tip, "-m", &message],
                            )
                            .await?
                            .stdout
                            .trim()
                            .to_string();
                        (commit.clone(), MergeOutcome::Merged { commit })
                    }
                    TreeMerge::Conflict(files) => return Ok(MergeOutcome::Conflict { files }),
                    TreeMerge::Unsupported => {
                        match self.merge_in_worktree(worktree, &base_old).await? {
                            TreeMerge::Clean(head) => {
                                (head.clone(), MergeOutcome::Merged { commit: head })
                            }
                            TreeMerge::Conflict(files) => {
                                return Ok(MergeOutcome::Conflict { files })
                            }
                            TreeMerge::Unsupported => {
                                return Err(Error::Git("merge is not supported".to_string()))
                            }
                        }
                    }
                }
            };

            if self
                .advance_base(repo, &worktree.base_branch, &base_old, &new_head)
                .await?
            {
                return Ok(outcome);
            }
            tracing::debug!(
                branch = %worktree.branch,
                attempt,
                "base branch moved during merge, retrying"
            );
        }

        Err(Error::Git(format!(
            "base branch {} kept moving during merge",
            worktree.base_branch
        )))
    }

    /// Three-way merge without touching any working tree.
    async fn merge_tree(&self, repo: &Path, base: &str, tip: &str) -> Result<TreeMerge> {
        let output = self
            .git
            .output(
                repo,
                &["merge-tree", "--write-tree", "--name-only", "--no-messages", base, tip],
            )
            .await?;
        let mut lines = output.stdout.lines();
        match output.exit_code {
            Some(0) => {
                let tree = lines.next().unwrap_or_default().trim().to_string();
                Ok(TreeMerge::Clean(tree))
            }
            Some(1) if !output.stdout.trim().is_empty() => {
                lines.next();
                let mut files: Vec<PathBuf> = lines
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(PathBuf::from)
                    .collect();
                files.dedup();
                Ok(TreeMerge::Conflict(files))
            }
            // git older than 2.38 has no --write-tree
            Some(129) => Ok(TreeMerge::Unsupported),
            _ => Err(Error::Git(format!(
                "merge-tree failed: {}",
                output.stderr.trim()
            ))),
        }
    }

    /// Merges the base into the task branch inside its worktree, aborting on
    /// conflict. On success the task branch descends from the base.
    async fn merge_in_worktree(&self, worktree: &Worktree, base: &str) -> Result<TreeMerge> {
        let path = &worktree.path;
        let merged = self
            .git
            .output(path, &["merge", "--no-edit", "--no-ff", base])
            .await?;
        if merged.success() {
            let head = self
                .git
                .rev_parse(path, "HEAD")
                .await?
                .ok_or_else(|| Error::Git("worktree has no HEAD after merge".to_string()))?;
            return Ok(TreeMerge::Clean(head));
        }

        let conflicted = self
            .git
            .run(path, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        let files = conflicted.stdout.lines().map(PathBuf::from).collect();
        self.git.run(path, &["merge", "--abort"]).await?;
        Ok(TreeMerge::Conflict(files))
    }

    /// Compare-and-swap of the base ref. When the base branch is checked out
    /// in the main worktree its index and files are moved along with it.
    async fn advance_base(
        &self,
        repo: &Path,
        base_branch: &str,
        old: &str,
        new: &str,
    ) -> Result<bool> {
        let base_ref = format!("refs/heads/{}", base_branch);
        let checked_out = self.git.current_branch(repo).await?.as_deref() == Some(base_branch);

        if checked_out {
            self.git.run(repo, &["read-tree", "-m", "-u", old, new]).await?;
        }

        let swapped = self
            .git
            .output(repo, &["update-ref", "-m", "autopilot: merge", &base_ref, new, old])
            .await?;
        if swapped.success() {
            return Ok(true);
        }

        if checked_out {
            if let Err(e) = self.git.run(repo, &["read-tree", "-m", "-u", new, old]).await {
                tracing::error!(
                    repo = ?repo,
                    error = %e,
                    "failed to restore checkout after lost ref update"
                );
            }
        }
        Ok(false)
    }

    /// Re-checks a conflicted worktree and returns it to `active` once its
    /// branch merges cleanly.
    pub async fn resolve_conflict(&self, id: &WorktreeId) -> Result<Worktree> {
        let worktree = self.store.worktree(id).await?;
        if worktree.status != WorktreeStatus::Conflict {
            return Err(Error::transition("worktree", worktree.status, WorktreeStatus::Active));
        }

        let report = self.git.status(&worktree.path).await?;
        if report.is_dirty() {
            return Err(Error::MergeConflict {
                branch: worktree.branch.clone(),
                files: if report.has_conflicts() {
                    report.conflicted
                } else {
                    report.changed
                },
            });
        }

        let repo = self.repo_path(&worktree.project_id).await?;
        let base = self
            .git
            .rev_parse(&repo, &format!("refs/heads/{}", worktree.base_branch))
            .await?
            .ok_or_else(|| Error::Git(format!("base branch {} not found", worktree.base_branch)))?;
        let tip = self
            .git
            .rev_parse(&repo, &format!("refs/heads/{}", worktree.branch))
            .await?
            .ok_or_else(|| Error::Git(format!("branch {} not found", worktree.branch)))?;

        let related = self.git.is_ancestor(&repo, &base, &tip).await?
            || self.git.is_ancestor(&repo, &tip, &base).await?;
        if !related {
            // Without merge-tree support the retried merge reports any conflict.
            if let TreeMerge::Conflict(files) = self.merge_tree(&repo, &base, &tip).await? {
                return Err(Error::MergeConflict {
                    branch: worktree.branch.clone(),
                    files,
                });
            }
        }
        self.set_status(id, WorktreeStatus::Active, None, true).await
    }

    /// Removes the worktree directory, then its branch.
    ///
    /// Removing an already removed worktree is a no-op.
    pub async fn remove(&self, id: &WorktreeId, force: bool) -> Result<()> {
        let worktree = self.store.worktree(id).await?;
        if worktree.status == WorktreeStatus::Removed {
            return Ok(());
        }
        if !WorktreeLifecycle::can_remove(worktree.status, force) {
            return Err(Error::transition(
                "worktree",
                worktree.status,
                WorktreeStatus::Removing,
            ));
        }
        let repo = self.repo_path(&worktree.project_id).await?;

        self.set_status(id, WorktreeStatus::Removing, None, true).await?;

        let path_str = worktree.path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force || worktree.status == WorktreeStatus::Error {
            args.push("--force");
        }
        args.push(path_str.as_str());
        let removed = self.git.output(&repo, &args).await?;

        if !removed.success() {
            if worktree.path.exists() {
                let message = format!("git worktree remove failed: {}", removed.stderr.trim());
                self.fail(id, message.clone()).await;
                return Err(Error::Git(message));
            }
            // Directory already gone; drop the stale registration.
            self.git.run(&repo, &["worktree", "prune"]).await?;
        }

        self.set_status(id, WorktreeStatus::Removed, None, false).await?;

        let deleted = self
            .git
            .output(&repo, &["branch", "-D", &worktree.branch])
            .await?;
        if !deleted.success() {
            tracing::warn!(
                branch = %worktree.branch,
                stderr = %deleted.stderr.trim(),
                "failed to delete worktree branch, may need manual cleanup"
            );
        }

        tracing::info!(worktree_id = %id, path = ?worktree.path, "removed worktree");
        Ok(())
    }

    /// Records activity so the worktree is not considered stale.
    pub async fn touch(&self, id: &WorktreeId) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        let mut worktree = self.store.worktree(id).await?;
        worktree.touch();
        self.store.put_worktree(&worktree).await
    }

    /// Worktrees registered with git for the project's repository.
    pub async fn list_git_worktrees(&self, project: &Project) -> Result<Vec<ListedWorktree>> {
        self.git.worktree_list(&project.repo_path).await
    }

    /// Git worktrees under the configured root that no live record owns.
    pub async fn orphaned_worktrees(&self, project: &Project) -> Result<Vec<ListedWorktree>> {
        let known: Vec<PathBuf> = self
            .store
            .list_worktrees(&project.id, None)
            .await?
            .into_iter()
            .filter(|w| w.status != WorktreeStatus::Removed)
            .map(|w| w.path)
            .collect();
        let root = self.config.root_dir();
        Ok(self
            .list_git_worktrees(project)
            .await?
            .into_iter()
            .filter(|l| l.path.starts_with(&root) && !known.contains(&l.path))
            .collect())
    }

    /// Force-removes an unrecorded git worktree and its branch.
    pub async fn remove_orphan(&self, repo: &Path, orphan: &ListedWorktree) -> Result<()> {
        let path_str = orphan.path.to_string_lossy().into_owned();
        let removed = self
            .git
            .output(repo, &["worktree", "remove", "--force", &path_str])
            .await?;
        if !removed.success() {
            self.git.run(repo, &["worktree", "prune"]).await?;
        }
        if let Some(branch) = &orphan.branch {
            if branch.starts_with(self.config.branch_prefix.trim()) {
                let deleted = self.git.output(repo, &["branch", "-D", branch]).await?;
                if !deleted.success() {
                    tracing::warn!(branch = %branch, "failed to delete orphaned branch");
                }
            }
        }
        tracing::info!(path = ?orphan.path, "removed orphaned worktree");
        Ok(())
    }

    /// Active worktrees idle for at least `stale_after_days`. Reporting only.
    pub async fn stale_worktrees(
        &self,
        project_id: &ProjectId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Worktree>> {
        let threshold = self.config.stale_after();
        Ok(self
            .store
            .list_worktrees(project_id, Some(WorktreeStatus::Active))
            .await?
            .into_iter()
            .filter(|w| WorktreeLifecycle::is_stale(w, now, threshold))
            .collect())
    }

    /// Force-removes every stale worktree and prunes git's bookkeeping.
    /// Failures are logged and skipped.
    pub async fn prune_stale(
        &self,
        project: &Project,
        now: DateTime<Utc>,
    ) -> Result<Vec<Worktree>> {
        let mut pruned = Vec::new();
        for worktree in self.stale_worktrees(&project.id, now).await? {
            match self.remove(&worktree.id, true).await {
                Ok(()) => pruned.push(worktree),
                Err(e) => tracing::warn!(
                    worktree_id = %worktree.id,
                    error = %e,
                    "failed to prune stale worktree"
                ),
            }
        }
        self.git
            .run(&project.repo_path, &["worktree", "prune"])
            .await?;
        if !pruned.is_empty() {
            tracing::info!(project_id = %project.id, count = pruned.len(), "pruned stale worktrees");
        }
        Ok(pruned)
    }
}
