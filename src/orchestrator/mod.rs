//! Orchestrator: runs tasks end to end.
//!
//! ```text
//! start -> admission -> worktree -> agent START -> turn loop -> submit for review
//!                                                                  |
//!                        approve: merge, remove worktree, release, promote
//!                        reject:  record feedback, resume agent
//! ```
//!
//! Cross-entity sequences run in a fixed order (agent, worktree, task) and
//! every step is idempotent, so a sequence that failed half way can simply
//! be invoked again. Entity locks are held only around store reads and
//! writes, never across git or runner calls.

mod review;
mod run;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::admission::{AdmissionController, PendingRun};
use crate::agent::{AgentRunner, ProgressSummary, ToolExecutor};
use crate::config::{AutopilotConfig, Validate};
use crate::error::{Error, Result};
use crate::events::{self, kinds, EventPublisher, NoopPublisher};
use crate::exec::ExecBackend;
use crate::locks::EntityLocks;
use crate::model::{Agent, AgentId, Project, ProjectId, Stage, Task, TaskId, WorktreeId};
use crate::sandbox::{AuditLog, CommandPolicy, SecuritySandbox, ToolSet};
use crate::store::{Store, StoreExt};
use crate::workflow::{TaskWorkflow, WorkflowEdge};
use crate::worktree::WorktreeManager;

pub use run::Control;

/// Reason recorded when a task is dragged back from review without feedback.
const RETURNED_FROM_REVIEW: &str = "returned from review";

/// Result of a run-control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunResult {
    /// A slot was granted and the agent loop is running.
    Admitted {
        agent_id: AgentId,
        task_id: TaskId,
        worktree_id: WorktreeId,
        branch: String,
    },
    /// No slot was free; `position` is 1-based.
    Queued {
        agent_id: AgentId,
        task_id: TaskId,
        position: usize,
    },
    /// A paused, errored or reviewed agent is running again.
    Resumed {
        agent_id: AgentId,
        task_id: TaskId,
        max_turns: u32,
    },
    Paused { agent_id: AgentId, reason: String },
    Stopped {
        agent_id: AgentId,
        task_id: Option<TaskId>,
    },
}

/// How an agent loop ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The task is waiting for approval.
    Completed {
        summary: String,
        progress: ProgressSummary,
    },
    Paused {
        reason: String,
        progress: ProgressSummary,
    },
    /// The agent is in `error`; the task stays in progress.
    Failed {
        error: String,
        progress: ProgressSummary,
    },
    /// Aborted, or replaced by a newer loop for the same agent.
    Stopped { progress: ProgressSummary },
}

/// Options for restarting an errored agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Added to the turn budget.
    #[serde(default)]
    pub extra_turns: u32,
    /// Replaces the agent's tool whitelist.
    #[serde(default)]
    pub allowed_tools: Option<ToolSet>,
}

/// External collaborators the orchestrator runs against.
pub struct Ports {
    pub store: Arc<dyn Store>,
    pub backend: Arc<dyn ExecBackend>,
    pub runner: Arc<dyn AgentRunner>,
    pub events: Arc<dyn EventPublisher>,
}

impl Ports {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn ExecBackend>,
        runner: Arc<dyn AgentRunner>,
    ) -> Self {
        Self {
            store,
            backend,
            runner,
            events: Arc::new(NoopPublisher),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }
}

struct RunHandle {
    generation: u64,
    control: watch::Sender<Control>,
    join: Option<JoinHandle<RunOutcome>>,
}

struct Inner {
    config: AutopilotConfig,
    store: Arc<dyn Store>,
    events: Arc<dyn EventPublisher>,
    runner: Arc<dyn AgentRunner>,
    worktrees: WorktreeManager,
    admission: AdmissionController,
    sandbox: SecuritySandbox,
    executor: ToolExecutor,
    /// Global whitelist; agents get the intersection with their own set.
    tools: ToolSet,
    task_locks: EntityLocks<TaskId>,
    agent_locks: EntityLocks<AgentId>,
    runs: Mutex<HashMap<AgentId, RunHandle>>,
    generation: AtomicU64,
}

/// Composes admission, worktrees, the sandbox and the state machines.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: AutopilotConfig, ports: Ports) -> Result<Self> {
        for warning in config.validate().into_result()? {
            tracing::warn!("{}", warning);
        }

        let tools = config.agent.tool_set()?;
        let audit = match &config.sandbox.audit_log {
            Some(path) => AuditLog::with_sink(path)?,
            None => AuditLog::new(),
        };
        let policy =
            CommandPolicy::new().with_blocked_commands(config.sandbox.extra_blocked_commands.iter());
        let sandbox = SecuritySandbox::new(policy, config.sandbox.temp_dir(), audit);

        let worktrees = WorktreeManager::new(
            ports.backend.clone(),
            ports.store.clone(),
            config.worktree.clone(),
        )
        .with_events(ports.events.clone());

        tracing::info!(
            runner = ports.runner.name(),
            default_max_concurrent = config.admission.default_max_concurrent,
            worktree_root = ?config.worktree.root_dir(),
            "orchestrator ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                admission: AdmissionController::new(&config.admission),
                executor: ToolExecutor::new(ports.backend),
                store: ports.store,
                events: ports.events,
                runner: ports.runner,
                worktrees,
                sandbox,
                tools,
                task_locks: EntityLocks::new(),
                agent_locks: EntityLocks::new(),
                runs: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                config,
            }),
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.inner.worktrees
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    pub fn sandbox(&self) -> &SecuritySandbox {
        &self.inner.sandbox
    }

    pub fn config(&self) -> &AutopilotConfig {
        &self.inner.config
    }

    /// Registers a project after checking its base branch exists.
    pub async fn register_project(&self, project: Project) -> Result<Project> {
        if project.name.trim().is_empty() {
            return Err(Error::Validation("project name cannot be empty".to_string()));
        }
        let exists = self
            .inner
            .worktrees
            .git()
            .branch_exists(&project.repo_path, &project.base_branch)
            .await?;
        if !exists {
            return Err(Error::Validation(format!(
                "base branch '{}' not found in {}",
                project.base_branch,
                project.repo_path.display()
            )));
        }

        self.inner.store.put_project(&project).await?;
        if let Some(limit) = project.max_concurrent_agents {
            self.set_project_limit(&project.id, limit).await?;
        }
        tracing::info!(
            project_id = %project.id,
            repo = ?project.repo_path,
            limit = self.inner.admission.limit(&project.id),
            "registered project"
        );
        Ok(project)
    }

    /// Changes a project's concurrency limit. Raising it starts queued runs;
    /// going below the number of running agents fails with `LimitExceeded`.
    pub async fn set_project_limit(&self, project_id: &ProjectId, limit: usize) -> Result<()> {
        let mut project = self.inner.store.project(project_id).await?;
        let promoted = self.inner.admission.set_limit(project_id, limit)?;
        if project.max_concurrent_agents != Some(limit) {
            project.max_concurrent_agents = Some(limit);
            self.inner.store.put_project(&project).await?;
        }
        self.launch_promoted(project_id, promoted).await;
        Ok(())
    }

    /// Adds a task at the end of the backlog.
    pub async fn create_task(
        &self,
        project_id: &ProjectId,
        title: &str,
        description: &str,
    ) -> Result<Task> {
        if title.trim().is_empty() {
            return Err(Error::Validation("task title cannot be empty".to_string()));
        }
        self.inner.store.project(project_id).await?;

        let backlog = self
            .inner
            .store
            .list_tasks(project_id, Some(Stage::Backlog))
            .await?;
        let mut task = Task::new(project_id.clone(), title.trim()).with_description(description);
        task.position = backlog.len() as u32;
        self.inner.store.put_task(&task).await?;
        tracing::debug!(task_id = %task.id, project_id = %project_id, "created task");
        Ok(task)
    }

    /// Creates an idle agent with the configured turn budget. `tools`
    /// defaults to the global whitelist.
    pub async fn create_agent(
        &self,
        project_id: &ProjectId,
        tools: Option<ToolSet>,
    ) -> Result<Agent> {
        self.inner.store.project(project_id).await?;
        let tools = tools.unwrap_or_else(|| self.inner.tools.clone());
        let agent = Agent::new(project_id.clone(), self.inner.config.agent.max_turns, tools);
        self.inner.store.put_agent(&agent).await?;
        Ok(agent)
    }

    /// Moves a task to another column, running the side effects of the edge.
    ///
    /// Moving within the same column only repositions. Starting a task whose
    /// project is at capacity queues it and leaves it in the backlog.
    pub async fn move_column(
        &self,
        task_id: &TaskId,
        stage: Stage,
        position: Option<u32>,
    ) -> Result<Task> {
        let task = self.inner.store.task(task_id).await?;
        let edge = TaskWorkflow::check(&task, stage)?;

        let moved = match edge {
            None => task,
            Some(WorkflowEdge::Start) => {
                let agent_id = match &task.agent_id {
                    Some(id) => id.clone(),
                    None => self.create_agent(&task.project_id, None).await?.id,
                };
                self.start(&agent_id, task_id).await?;
                self.inner.store.task(task_id).await?
            }
            Some(WorkflowEdge::Submit) => self.submit(task_id).await?,
            Some(WorkflowEdge::Cancel) => self.skip(task_id).await?,
            Some(WorkflowEdge::Approve) => self.approve(task_id).await?,
            Some(WorkflowEdge::Reject) => self.reject(task_id, RETURNED_FROM_REVIEW).await?,
        };

        if moved.stage != stage {
            // Queued start: the task stays where it was.
            return Ok(moved);
        }
        match (edge, position) {
            (None, None) => Ok(moved),
            (_, position) => self.reposition(&moved, position.unwrap_or(u32::MAX)).await,
        }
    }

    /// Places `task` at `position` within its column and renumbers the rest.
    async fn reposition(&self, task: &Task, position: u32) -> Result<Task> {
        let mut column: Vec<Task> = self
            .inner
            .store
            .list_tasks(&task.project_id, Some(task.stage))
            .await?
            .into_iter()
            .filter(|t| t.id != task.id)
            .collect();
        let index = (position as usize).min(column.len());
        column.insert(index, task.clone());

        for (i, t) in column.iter().enumerate() {
            let i = i as u32;
            if t.position != i || t.id == task.id {
                self.update_task(&t.id, |t| {
                    t.position = i;
                    Ok(())
                })
                .await?;
            }
        }
        self.inner.store.task(&task.id).await
    }

    pub fn get_running_count(&self, project_id: &ProjectId) -> usize {
        self.inner.admission.running_count(project_id)
    }

    /// Queued runs for the project, oldest first.
    pub fn get_queued_tasks(&self, project_id: &ProjectId) -> Vec<PendingRun> {
        self.inner.admission.queued(project_id)
    }

    /// Read-modify-write of a task under its lock. Publishes a stage change
    /// when the stage moved.
    async fn update_task<T, F>(&self, id: &TaskId, f: F) -> Result<(Task, T)>
    where
        F: FnOnce(&mut Task) -> Result<T> + Send,
        T: Send,
    {
        let (task, from, out) = {
            let _guard = self.inner.task_locks.lock(id).await;
            let mut task = self.inner.store.task(id).await?;
            let from = task.stage;
            let out = f(&mut task)?;
            TaskWorkflow::check_invariants(&task)?;
            self.inner.store.put_task(&task).await?;
            (task, from, out)
        };
        if from != task.stage {
            tracing::info!(task_id = %task.id, from = %from, to = %task.stage, "task moved");
            events::emit(
                self.inner.events.as_ref(),
                task.id.as_str(),
                kinds::TASK_STAGE_CHANGED,
                json!({ "from": from, "to": task.stage, "agent_id": task.agent_id }),
            )
            .await;
        }
        Ok((task, out))
    }

    /// Read-modify-write of an agent under its lock. Publishes a status
    /// change when the status moved.
    async fn update_agent<T, F>(&self, id: &AgentId, f: F) -> Result<(Agent, T)>
    where
        F: FnOnce(&mut Agent) -> Result<T> + Send,
        T: Send,
    {
        let (agent, from, out) = {
            let _guard = self.inner.agent_locks.lock(id).await;
            let mut agent = self.inner.store.agent(id).await?;
            let from = agent.status;
            let out = f(&mut agent)?;
            self.inner.store.put_agent(&agent).await?;
            (agent, from, out)
        };
        if from != agent.status {
            tracing::debug!(agent_id = %agent.id, from = %from, to = %agent.status, "agent status changed");
            events::emit(
                self.inner.events.as_ref(),
                agent.id.as_str(),
                kinds::AGENT_STATUS_CHANGED,
                json!({
                    "from": from,
                    "to": agent.status,
                    "task_id": agent.current_task_id,
                    "reason": agent.pause_reason,
                }),
            )
            .await;
        }
        Ok((agent, out))
    }
}
