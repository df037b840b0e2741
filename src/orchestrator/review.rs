//! Review gate and board-driven cancellation.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::agent::{AgentEvent, AgentLifecycle, LifecycleOutcome};
use crate::error::{Error, Result};
use crate::events::{self, kinds};
use crate::model::{
    AgentId, AgentStatus, ProjectId, Stage, Task, TaskId, WorktreeId, WorktreeStatus,
};
use crate::store::StoreExt;
use crate::workflow::TaskWorkflow;
use crate::worktree::MergeOutcome;

use super::run::commit_message;
use super::{Control, Orchestrator};

const PRUNED_REASON: &str = "worktree pruned after inactivity";

fn not_waiting(task: &Task) -> Error {
    Error::NotWaitingApproval {
        task_id: task.id.to_string(),
        stage: task.stage.to_string(),
    }
}

impl Orchestrator {
    /// Manually moves an in-progress task to review. The bound agent must
    /// not be running.
    pub(super) async fn submit(&self, task_id: &TaskId) -> Result<Task> {
        let task = self.inner.store.task(task_id).await?;
        if let Some(agent_id) = &task.agent_id {
            let agent = self.inner.store.agent(agent_id).await?;
            if agent.current_task_id.as_ref() == Some(task_id) && agent.status.is_active() {
                return Err(Error::AlreadyRunning(agent_id.to_string()));
            }
        }
        self.finish_run(task_id, "submitted for review").await
    }

    /// Merges the task branch into the base branch, removes the worktree and
    /// marks the task verified. Approving a verified task is a no-op.
    ///
    /// A conflict leaves the task waiting for approval with the conflicting
    /// files recorded; resolve the worktree and approve again.
    pub async fn approve(&self, task_id: &TaskId) -> Result<Task> {
        let task = self.inner.store.task(task_id).await?;
        match task.stage {
            Stage::WaitingApproval => {}
            Stage::Verified => return Ok(task),
            _ => return Err(not_waiting(&task)),
        }

        if let Some(worktree_id) = &task.worktree_id {
            self.merge_and_remove(&task, worktree_id).await?;
        }

        let agent_id = task.agent_id.clone();
        let (task, _) = self
            .update_task(task_id, |t| {
                TaskWorkflow::apply(t, Stage::Verified)?;
                t.worktree_id = None;
                t.agent_id = None;
                t.last_error = None;
                Ok(())
            })
            .await?;

        if let Some(agent_id) = agent_id {
            self.release_agent(&agent_id, task_id).await;
        }
        self.release_slot(&task.project_id, task_id).await;
        tracing::info!(task_id = %task.id, branch = ?task.branch, "task verified");
        Ok(task)
    }

    async fn merge_and_remove(&self, task: &Task, worktree_id: &WorktreeId) -> Result<()> {
        let worktree = self.inner.store.worktree(worktree_id).await?;
        if worktree.status == WorktreeStatus::Removed {
            return Ok(());
        }
        if matches!(worktree.status, WorktreeStatus::Active | WorktreeStatus::Dirty) {
            self.inner
                .worktrees
                .commit(worktree_id, &commit_message(task, "changes made during review"))
                .await?;
        }

        if !self.inner.worktrees.is_merged(worktree_id).await? {
            match self.inner.worktrees.merge(worktree_id).await {
                Ok(MergeOutcome::Conflict { files }) => {
                    let err = Error::MergeConflict {
                        branch: worktree.branch.clone(),
                        files,
                    };
                    self.record_task_error(&task.id, &err.to_string()).await;
                    return Err(err);
                }
                Ok(outcome) => {
                    tracing::debug!(task_id = %task.id, outcome = ?outcome, "task branch merged")
                }
                Err(e) => {
                    self.record_task_error(&task.id, &e.to_string()).await;
                    return Err(e);
                }
            }
        }

        self.inner.worktrees.remove(worktree_id, false).await
    }

    /// Frees the agent after approval: a completed agent goes back to idle,
    /// anything else is aborted.
    async fn release_agent(&self, agent_id: &AgentId, task_id: &TaskId) {
        let released = self
            .update_agent(agent_id, |agent| {
                if agent.current_task_id.as_ref() != Some(task_id) {
                    return Ok(LifecycleOutcome::Unchanged);
                }
                let event = if agent.status == AgentStatus::Completed {
                    AgentEvent::Reset
                } else {
                    AgentEvent::Abort
                };
                AgentLifecycle::apply(agent, event)
            })
            .await;
        match released {
            Ok(_) => self.signal(agent_id, Control::Abort),
            Err(e) => tracing::warn!(agent_id = %agent_id, error = %e, "failed to release agent"),
        }
    }

    /// Sends a task back to work with feedback. The agent that did the work
    /// resumes with `reason` as its next prompt.
    pub async fn reject(&self, task_id: &TaskId, reason: &str) -> Result<Task> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(Error::Validation("rejection reason cannot be empty".to_string()));
        }

        let (task, _) = self
            .update_task(task_id, |t| {
                if t.stage != Stage::WaitingApproval {
                    return Err(not_waiting(t));
                }
                TaskWorkflow::record_rejection(t, reason);
                TaskWorkflow::apply(t, Stage::InProgress)?;
                Ok(())
            })
            .await?;

        events::emit(
            self.inner.events.as_ref(),
            task.id.as_str(),
            kinds::TASK_REJECTED,
            json!({ "reason": reason, "rejection_count": task.rejection_count }),
        )
        .await;
        tracing::info!(
            task_id = %task.id,
            rejections = task.rejection_count,
            reason,
            "task rejected"
        );

        if let Some(agent_id) = &task.agent_id {
            let event = AgentEvent::Resume {
                feedback: Some(reason.to_string()),
                turn_extension: self.inner.config.agent.turn_extension,
            };
            match self
                .activate_agent(agent_id, task_id, AgentStatus::Completed, event)
                .await
            {
                Ok((agent, generation, control)) => {
                    self.spawn_loop(agent.id, task_id.clone(), generation, control)
                }
                Err(e) => tracing::warn!(
                    task_id = %task.id,
                    agent_id = %agent_id,
                    error = %e,
                    "agent not resumed after rejection; start the task again"
                ),
            }
        }
        Ok(task)
    }

    /// Cancels a task. A queued backlog task leaves the queue; an in-progress
    /// task loses its agent and worktree and goes back to the end of the
    /// backlog.
    pub async fn skip(&self, task_id: &TaskId) -> Result<Task> {
        let task = self.inner.store.task(task_id).await?;
        match task.stage {
            Stage::Backlog => {
                if self.inner.admission.cancel_queued(&task.project_id, task_id) {
                    tracing::info!(task_id = %task_id, "queued run cancelled");
                }
                return Ok(task);
            }
            Stage::InProgress => {}
            stage => return Err(Error::transition("task", stage, Stage::Backlog)),
        }

        self.abort_bound_agent(&task).await?;
        if let Some(worktree_id) = &task.worktree_id {
            self.inner.worktrees.remove(worktree_id, true).await?;
        }

        let position = self
            .inner
            .store
            .list_tasks(&task.project_id, Some(Stage::Backlog))
            .await?
            .len() as u32;
        let (task, _) = self
            .update_task(task_id, |t| {
                TaskWorkflow::apply(t, Stage::Backlog)?;
                t.worktree_id = None;
                t.branch = None;
                t.agent_id = None;
                t.position = position;
                Ok(())
            })
            .await?;
        self.release_slot(&task.project_id, task_id).await;
        tracing::info!(task_id = %task.id, "task cancelled");
        Ok(task)
    }

    /// Removes a queued run. Returns whether one was queued.
    pub async fn cancel_queued(&self, task_id: &TaskId) -> Result<bool> {
        let task = self.inner.store.task(task_id).await?;
        Ok(self.inner.admission.cancel_queued(&task.project_id, task_id))
    }

    /// Removes worktrees idle for longer than `worktree.stale_after_days` and
    /// returns their tasks to the backlog.
    pub async fn prune_stale(
        &self,
        project_id: &ProjectId,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorktreeId>> {
        let project = self.inner.store.project(project_id).await?;
        let pruned = self.inner.worktrees.prune_stale(&project, now).await?;

        let mut ids = Vec::with_capacity(pruned.len());
        for worktree in pruned {
            ids.push(worktree.id.clone());
            let Some(task) = self.inner.store.get_task(&worktree.task_id).await? else {
                continue;
            };
            if task.worktree_id.as_ref() != Some(&worktree.id) {
                continue;
            }

            if let Err(e) = self.abort_bound_agent(&task).await {
                tracing::warn!(task_id = %task.id, error = %e, "failed to abort agent of pruned task");
            }
            let reset = self
                .update_task(&task.id, |t| {
                    if t.stage == Stage::WaitingApproval {
                        TaskWorkflow::apply(t, Stage::InProgress)?;
                    }
                    TaskWorkflow::apply(t, Stage::Backlog)?;
                    t.worktree_id = None;
                    t.branch = None;
                    t.agent_id = None;
                    t.last_error = Some(PRUNED_REASON.to_string());
                    Ok(())
                })
                .await;
            if let Err(e) = reset {
                tracing::warn!(task_id = %task.id, error = %e, "failed to reset pruned task");
            }
            self.release_slot(project_id, &task.id).await;
        }
        Ok(ids)
    }
}
