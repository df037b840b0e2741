//! Task workflow stage transitions.
//!
//! The edge table is closed: anything not listed fails with
//! `InvalidTransition` and leaves the task untouched. Side effects of each
//! edge (admission, worktree creation, merge) are sequenced by the
//! orchestrator, not here.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Stage, Task};

/// A permitted stage edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEdge {
    /// backlog -> in_progress
    Start,
    /// in_progress -> waiting_approval
    Submit,
    /// in_progress -> backlog
    Cancel,
    /// waiting_approval -> verified
    Approve,
    /// waiting_approval -> in_progress
    Reject,
}

impl fmt::Display for WorkflowEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowEdge::Start => "start",
            WorkflowEdge::Submit => "submit",
            WorkflowEdge::Cancel => "cancel",
            WorkflowEdge::Approve => "approve",
            WorkflowEdge::Reject => "reject",
        };
        f.write_str(name)
    }
}

/// The task stage state machine.
pub struct TaskWorkflow;

impl TaskWorkflow {
    /// Looks up the edge from `from` to `to`.
    pub fn edge(from: Stage, to: Stage) -> Option<WorkflowEdge> {
        match (from, to) {
            (Stage::Backlog, Stage::InProgress) => Some(WorkflowEdge::Start),
            (Stage::InProgress, Stage::WaitingApproval) => Some(WorkflowEdge::Submit),
            (Stage::InProgress, Stage::Backlog) => Some(WorkflowEdge::Cancel),
            (Stage::WaitingApproval, Stage::Verified) => Some(WorkflowEdge::Approve),
            (Stage::WaitingApproval, Stage::InProgress) => Some(WorkflowEdge::Reject),
            _ => None,
        }
    }

    pub fn can_transition(from: Stage, to: Stage) -> bool {
        Self::edge(from, to).is_some()
    }

    /// Validates the move without applying it.
    ///
    /// Returns `Ok(None)` when the task is already in `to`, which callers
    /// treat as an already-applied step.
    pub fn check(task: &Task, to: Stage) -> Result<Option<WorkflowEdge>> {
        if task.stage == to {
            return Ok(None);
        }
        Self::edge(task.stage, to)
            .map(Some)
            .ok_or_else(|| Error::transition("task", task.stage, to))
    }

    /// Applies the move to `task`.
    pub fn apply(task: &mut Task, to: Stage) -> Result<Option<WorkflowEdge>> {
        let edge = Self::check(task, to)?;
        if let Some(edge) = edge {
            tracing::debug!(
                task_id = %task.id,
                from = %task.stage,
                to = %to,
                edge = %edge,
                "task stage transition"
            );
            task.stage = to;
            task.touch();
        }
        Ok(edge)
    }

    /// Records reviewer feedback for a rejection.
    pub fn record_rejection(task: &mut Task, reason: impl Into<String>) {
        task.rejection_count += 1;
        task.rejection_reasons.push(reason.into());
        task.touch();
    }

    /// Checks the stage/worktree coupling: a worktree is attached exactly
    /// while the stage holds one.
    pub fn check_invariants(task: &Task) -> Result<()> {
        if task.stage.holds_worktree() != task.worktree_id.is_some() {
            return Err(Error::Validation(format!(
                "task {} in stage {} {} a worktree",
                task.id,
                task.stage,
                if task.worktree_id.is_some() { "has" } else { "lacks" }
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProjectId, WorktreeId};

    const ALL: [Stage; 4] = [
        Stage::Backlog,
        Stage::InProgress,
        Stage::WaitingApproval,
        Stage::Verified,
    ];

    #[test]
    fn only_listed_edges_are_permitted() {
        let allowed = [
            (Stage::Backlog, Stage::InProgress),
            (Stage::InProgress, Stage::WaitingApproval),
            (Stage::InProgress, Stage::Backlog),
            (Stage::WaitingApproval, Stage::Verified),
            (Stage::WaitingApproval, Stage::InProgress),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    TaskWorkflow::can_transition(from, to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn invalid_edge_leaves_stage_unchanged() {
        let mut task = Task::new(ProjectId::from("p"), "t");
        let err = TaskWorkflow::apply(&mut task, Stage::Verified).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { entity: "task", .. }));
        assert_eq!(task.stage, Stage::Backlog);

        task.stage = Stage::Verified;
        assert!(TaskWorkflow::apply(&mut task, Stage::Backlog).is_err());
        assert_eq!(task.stage, Stage::Verified);
    }

    #[test]
    fn reapplying_current_stage_is_a_no_op() {
        let mut task = Task::new(ProjectId::from("p"), "t");
        task.stage = Stage::WaitingApproval;
        assert_eq!(TaskWorkflow::apply(&mut task, Stage::WaitingApproval).unwrap(), None);
        assert_eq!(
            TaskWorkflow::apply(&mut task, Stage::Verified).unwrap(),
            Some(WorkflowEdge::Approve)
        );
    }

    #[test]
    fn rejection_is_recorded() {
        let mut task = Task::new(ProjectId::from("p"), "t");
        TaskWorkflow::record_rejection(&mut task, "missing tests");
        TaskWorkflow::record_rejection(&mut task, "still missing tests");
        assert_eq!(task.rejection_count, 2);
        assert_eq!(task.rejection_reasons[0], "missing tests");
    }

    #[test]
    fn invariant_couples_stage_and_worktree() {
        let mut task = Task::new(ProjectId::from("p"), "t");
        assert!(TaskWorkflow::check_invariants(&task).is_ok());

        task.stage = Stage::InProgress;
        assert!(TaskWorkflow::check_invariants(&task).is_err());

        task.worktree_id = Some(WorktreeId::from("w"));
        assert!(TaskWorkflow::check_invariants(&task).is_ok());

        task.stage = Stage::Verified;
        assert!(TaskWorkflow::check_invariants(&task).is_err());
    }
}
