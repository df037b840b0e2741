//! Entities managed by the orchestrator.
//!
//! Tasks, agents and worktrees reference each other by id only; the
//! [`Store`](crate::store::Store) is the arena that owns them.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sandbox::ToolSet;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generates a fresh random id.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Returns the id as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns the first eight characters, used in branch and directory names.
            pub fn short(&self) -> &str {
                let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
                &self.0[..end]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

entity_id!(
    /// Identifier of a project (one git repository).
    ProjectId
);
entity_id!(
    /// Identifier of a task on the board.
    TaskId
);
entity_id!(
    /// Identifier of an agent.
    AgentId
);
entity_id!(
    /// Identifier of an isolated worktree.
    WorktreeId
);

/// A git repository that tasks are executed against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Root of the main working tree.
    pub repo_path: PathBuf,
    /// Branch that task branches fork from and merge back into.
    pub base_branch: String,
    /// Overrides the configured default when set.
    #[serde(default)]
    pub max_concurrent_agents: Option<usize>,
}

impl Project {
    pub fn new(
        name: impl Into<String>,
        repo_path: impl Into<PathBuf>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            id: ProjectId::generate(),
            name: name.into(),
            repo_path: repo_path.into(),
            base_branch: base_branch.into(),
            max_concurrent_agents: None,
        }
    }

    /// Sets the per-project concurrency limit.
    pub fn with_max_concurrent_agents(mut self, limit: usize) -> Self {
        self.max_concurrent_agents = Some(limit);
        self
    }
}

/// Workflow position of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Backlog,
    InProgress,
    WaitingApproval,
    Verified,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Backlog => "backlog",
            Stage::InProgress => "in_progress",
            Stage::WaitingApproval => "waiting_approval",
            Stage::Verified => "verified",
        }
    }

    /// Stages during which the task owns a worktree.
    pub fn holds_worktree(&self) -> bool {
        matches!(self, Stage::InProgress | Stage::WaitingApproval)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Verified)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change to one file, as reported by `git diff --numstat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Path relative to the worktree root.
    pub path: PathBuf,
    pub additions: u32,
    pub deletions: u32,
}

/// Aggregate of the changes a task branch carries relative to its base.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub files: Vec<FileChange>,
    pub additions: u32,
    pub deletions: u32,
}

impl DiffSummary {
    pub fn from_files(files: Vec<FileChange>) -> Self {
        let additions = files.iter().map(|f| f.additions).sum();
        let deletions = files.iter().map(|f| f.deletions).sum();
        Self {
            files,
            additions,
            deletions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} file(s) changed, +{} -{}",
            self.files.len(),
            self.additions,
            self.deletions
        )
    }
}

/// A unit of work on the board.
///
/// `worktree_id` is set iff the stage is `in_progress` or `waiting_approval`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub stage: Stage,
    /// Ordering within the stage column.
    pub position: u32,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub worktree_id: Option<WorktreeId>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub diff_summary: Option<DiffSummary>,
    #[serde(default)]
    pub rejection_count: u32,
    /// Reviewer feedback, oldest first.
    #[serde(default)]
    pub rejection_reasons: Vec<String>,
    /// Most recent execution failure, surfaced for manual recovery.
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(project_id: ProjectId, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            project_id,
            title: title.into(),
            description: String::new(),
            stage: Stage::Backlog,
            position: 0,
            agent_id: None,
            worktree_id: None,
            branch: None,
            diff_summary: None,
            rejection_count: 0,
            rejection_reasons: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Starting,
    Running,
    Paused,
    Error,
    Completed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Starting => "starting",
            AgentStatus::Running => "running",
            AgentStatus::Paused => "paused",
            AgentStatus::Error => "error",
            AgentStatus::Completed => "completed",
        }
    }

    /// Statuses in which an execution loop may be live.
    pub fn is_active(&self) -> bool {
        matches!(self, AgentStatus::Starting | AgentStatus::Running)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An autonomous worker bound to at most one task at a time.
///
/// `current_task_id` is set iff `status != idle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub project_id: ProjectId,
    pub status: AgentStatus,
    #[serde(default)]
    pub current_task_id: Option<TaskId>,
    pub current_turn: u32,
    pub max_turns: u32,
    pub allowed_tools: ToolSet,
    #[serde(default)]
    pub pause_reason: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Feedback delivered on resume, consumed by the next turn.
    #[serde(default)]
    pub pending_feedback: Vec<String>,
}

impl Agent {
    pub fn new(project_id: ProjectId, max_turns: u32, allowed_tools: ToolSet) -> Self {
        Self {
            id: AgentId::generate(),
            project_id,
            status: AgentStatus::Idle,
            current_task_id: None,
            current_turn: 0,
            max_turns,
            allowed_tools,
            pause_reason: None,
            last_error: None,
            pending_feedback: Vec::new(),
        }
    }
}

/// Lifecycle status of an isolated worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Creating,
    Initializing,
    Active,
    Dirty,
    Committing,
    Merging,
    Conflict,
    Removing,
    Removed,
    Error,
}

impl WorktreeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorktreeStatus::Creating => "creating",
            WorktreeStatus::Initializing => "initializing",
            WorktreeStatus::Active => "active",
            WorktreeStatus::Dirty => "dirty",
            WorktreeStatus::Committing => "committing",
            WorktreeStatus::Merging => "merging",
            WorktreeStatus::Conflict => "conflict",
            WorktreeStatus::Removing => "removing",
            WorktreeStatus::Removed => "removed",
            WorktreeStatus::Error => "error",
        }
    }

    /// Git state is mid-flight; the directory must not be touched.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            WorktreeStatus::Creating
                | WorktreeStatus::Initializing
                | WorktreeStatus::Committing
                | WorktreeStatus::Merging
                | WorktreeStatus::Removing
        )
    }
}

impl fmt::Display for WorktreeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A git worktree plus branch, the isolation scope of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub id: WorktreeId,
    pub project_id: ProjectId,
    pub task_id: TaskId,
    pub branch: String,
    pub path: PathBuf,
    pub base_branch: String,
    pub status: WorktreeStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Worktree {
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}
