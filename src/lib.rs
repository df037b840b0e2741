//! Kanban Autopilot - orchestration core for autonomous coding agents
//!
//! Tasks move across a board (backlog, in progress, waiting for approval,
//! verified). Starting a task admits an agent under a per-project concurrency
//! limit, gives it an isolated git worktree and drives it turn by turn, with
//! every tool call checked by a security sandbox. Finished work waits for
//! human review; approval merges the branch into the project's base branch.

pub mod admission;
pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod exec;
pub mod locks;
pub mod model;
pub mod orchestrator;
pub mod sandbox;
pub mod store;
pub mod workflow;
pub mod worktree;

pub use error::{Error, ErrorKind, Result};

pub use admission::{Admission, AdmissionController, PendingRun};
pub use agent::{
    AgentEvent, AgentLifecycle, AgentRunner, ProgressSummary, ScriptedRunner, ToolCall,
    TurnContext, TurnPlan,
};
pub use config::{AutopilotConfig, Validate, ValidationResult};
pub use events::{BroadcastPublisher, Event, EventPublisher, NoopPublisher, RecordingPublisher};
pub use exec::{ExecBackend, ExecOutput, LocalBackend};
pub use model::{
    Agent, AgentId, AgentStatus, DiffSummary, Project, ProjectId, Stage, Task, TaskId, Worktree,
    WorktreeId, WorktreeStatus,
};
pub use orchestrator::{Control, Orchestrator, Ports, RetryOptions, RunOutcome, RunResult};
pub use sandbox::{Decision, SecuritySandbox, ToolKind, ToolSet};
pub use store::{InMemoryStore, Store, StoreExt};
pub use workflow::{TaskWorkflow, WorkflowEdge};
pub use worktree::{MergeOutcome, WorktreeLifecycle, WorktreeManager};
