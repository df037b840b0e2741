//! Error types for the autopilot orchestration core.

use std::path::PathBuf;
use thiserror::Error;

/// Broad category of an [`Error`], used to pick a propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input.
    Validation,
    /// Illegal state edge.
    Transition,
    /// Capacity or queue bound hit.
    Concurrency,
    /// Workspace, branch or merge failure.
    Resource,
    /// Sandbox refused a tool call.
    Security,
    /// Agent runtime failure.
    Execution,
}

/// Top-level error type for orchestration operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Input failed validation.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The requested state edge is not in the transition table.
    #[error("invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// The agent is already bound to a run (running, starting or queued).
    #[error("agent {0} is already running")]
    AlreadyRunning(String),

    /// Approve/reject on a task that is not waiting for review.
    #[error("task {task_id} is not waiting for approval (stage: {stage})")]
    NotWaitingApproval { task_id: String, stage: String },

    /// The project can never admit work at its configured capacity.
    #[error("project {project_id} admission limit of {limit} exceeded")]
    LimitExceeded { project_id: String, limit: usize },

    /// The admission queue reached its configured bound.
    #[error("admission queue for project {project_id} is full ({capacity} entries)")]
    QueueFull { project_id: String, capacity: usize },

    /// Creating an isolated workspace failed.
    #[error("failed to create worktree: {0}")]
    WorktreeCreationFailed(String),

    /// Merging a workspace branch hit conflicting edits.
    #[error("merge of {branch} conflicts in {} file(s)", files.len())]
    MergeConflict { branch: String, files: Vec<PathBuf> },

    /// The branch name is already taken.
    #[error("branch already exists: {0}")]
    BranchExists(String),

    /// The sandbox denied a tool call.
    #[error("tool {tool} denied: {reason}")]
    ToolDenied { tool: String, reason: String },

    /// A path resolved outside its workspace root.
    #[error("path escapes workspace: {0}")]
    PathTraversal(PathBuf),

    /// Agent runtime failure.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Entity lookup failed.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Persistent store failure.
    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    /// Shorthand for an invalid transition error.
    pub fn transition(
        entity: &'static str,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Error::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Shorthand for a missing entity.
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Returns the error category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::Config(_) | Error::NotFound { .. } => {
                ErrorKind::Validation
            }
            Error::InvalidTransition { .. }
            | Error::AlreadyRunning(_)
            | Error::NotWaitingApproval { .. } => ErrorKind::Transition,
            Error::LimitExceeded { .. } | Error::QueueFull { .. } => ErrorKind::Concurrency,
            Error::WorktreeCreationFailed(_)
            | Error::MergeConflict { .. }
            | Error::BranchExists(_)
            | Error::Git(_)
            | Error::Io(_)
            | Error::Store(_) => ErrorKind::Resource,
            Error::ToolDenied { .. } | Error::PathTraversal(_) => ErrorKind::Security,
            Error::Execution(_) => ErrorKind::Execution,
        }
    }

    /// Whether an explicit retry of the same operation can succeed.
    ///
    /// Validation, transition and security errors are final for the given input.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::Transition | ErrorKind::Security
        )
    }
}

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_errors_are_not_retryable() {
        let err = Error::transition("task", "backlog", "verified");
        assert_eq!(err.kind(), ErrorKind::Transition);
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "invalid task transition from backlog to verified"
        );
    }

    #[test]
    fn resource_errors_are_retryable_explicitly() {
        let err = Error::MergeConflict {
            branch: "autopilot/abc".to_string(),
            files: vec![PathBuf::from("src/lib.rs")],
        };
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("1 file(s)"));
    }

    #[test]
    fn security_errors_are_classified() {
        assert_eq!(
            Error::PathTraversal(PathBuf::from("/etc/passwd")).kind(),
            ErrorKind::Security
        );
        assert_eq!(
            Error::QueueFull {
                project_id: "p".to_string(),
                capacity: 4
            }
            .kind(),
            ErrorKind::Concurrency
        );
    }
}
