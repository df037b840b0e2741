//! Admission, launch, the turn loop and run control.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use serde_json::json;
use tokio::sync::watch;

use crate::admission::{Admission, PendingRun};
use crate::agent::{
    AgentEvent, AgentLifecycle, LifecycleOutcome, RunProgress, ToolCall, ToolOutcome,
    TurnContext, TurnPlan, TURN_LIMIT_EXCEEDED,
};
use crate::error::{Error, Result};
use crate::events::{self, kinds};
use crate::model::{
    Agent, AgentId, AgentStatus, ProjectId, Stage, Task, TaskId, WorktreeId, WorktreeStatus,
};
use crate::sandbox::{Decision, ToolSet};
use crate::store::StoreExt;
use crate::workflow::TaskWorkflow;

use super::{Orchestrator, RetryOptions, RunHandle, RunOutcome, RunResult};

/// Signal from run control to a live agent loop, observed between tool
/// calls and while waiting for the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
    Abort,
}

const OPERATOR_PAUSE: &str = "paused by operator";

enum Step {
    Turn {
        turn: u32,
        max_turns: u32,
        feedback: Vec<String>,
        tools: ToolSet,
    },
    LimitReached,
    /// Someone else moved the agent out of an active status.
    Halted(Agent),
    /// A newer loop owns the agent.
    Superseded,
}

pub(super) fn commit_message(task: &Task, summary: &str) -> String {
    let summary = summary.trim();
    if summary.is_empty() {
        task.title.clone()
    } else {
        format!("{}\n\n{}", task.title, summary)
    }
}

impl Orchestrator {
    /// Starts `task_id` with a fresh agent, or with the agent already bound
    /// to it.
    pub async fn run(&self, project_id: &ProjectId, task_id: &TaskId) -> Result<RunResult> {
        let task = self.inner.store.task(task_id).await?;
        if &task.project_id != project_id {
            return Err(Error::Validation(format!(
                "task {} does not belong to project {}",
                task_id, project_id
            )));
        }
        let agent_id = match &task.agent_id {
            Some(id) => id.clone(),
            None => self.create_agent(project_id, None).await?.id,
        };
        self.start(&agent_id, task_id).await
    }

    /// Requests a slot for (task, agent). Admitted runs get a worktree and a
    /// live agent loop; otherwise the request is queued and launched when a
    /// slot frees up.
    pub async fn start(&self, agent_id: &AgentId, task_id: &TaskId) -> Result<RunResult> {
        let task = self.inner.store.task(task_id).await?;
        let agent = self.inner.store.agent(agent_id).await?;

        if agent.project_id != task.project_id {
            return Err(Error::Validation(format!(
                "agent {} and task {} belong to different projects",
                agent_id, task_id
            )));
        }
        if agent.status != AgentStatus::Idle {
            return Err(Error::AlreadyRunning(agent_id.to_string()));
        }
        match task.stage {
            Stage::Backlog => {}
            // Restarting a task whose agent was stopped.
            Stage::InProgress if task.worktree_id.is_some() => {
                if let Some(bound) = task.agent_id.as_ref().filter(|b| *b != agent_id) {
                    if self.inner.store.agent(bound).await?.status != AgentStatus::Idle {
                        return Err(Error::AlreadyRunning(bound.to_string()));
                    }
                }
            }
            stage => return Err(Error::transition("task", stage, Stage::InProgress)),
        }

        let project_id = task.project_id.clone();
        if self.inner.admission.is_running(&project_id, task_id) {
            return Err(Error::AlreadyRunning(format!("task {}", task_id)));
        }

        let run = PendingRun::new(task.id.clone(), agent.id.clone());
        match self.inner.admission.try_admit(&project_id, run.clone())? {
            Admission::Queued { position } => {
                tracing::info!(
                    project_id = %project_id,
                    task_id = %task_id,
                    agent_id = %agent_id,
                    position,
                    "project at capacity, run queued"
                );
                events::emit(
                    self.inner.events.as_ref(),
                    task_id.as_str(),
                    kinds::TASK_QUEUED,
                    json!({ "agent_id": agent_id, "position": position }),
                )
                .await;
                Ok(RunResult::Queued {
                    agent_id: agent_id.clone(),
                    task_id: task_id.clone(),
                    position,
                })
            }
            Admission::Admitted => match self.launch(&run).await {
                Ok(result) => Ok(result),
                Err(e) => {
                    tracing::warn!(
                        project_id = %project_id,
                        task_id = %task_id,
                        agent_id = %agent_id,
                        error = %e,
                        "launch failed, releasing admission slot"
                    );
                    self.release_slot(&project_id, task_id).await;
                    Err(e)
                }
            },
        }
    }

    /// Sets up an admitted run: worktree, task stage, agent START, loop.
    ///
    /// On failure everything this call created is undone except the slot,
    /// which the caller releases.
    async fn launch(&self, run: &PendingRun) -> Result<RunResult> {
        let task = self.inner.store.task(&run.task_id).await?;
        let project = self.inner.store.project(&task.project_id).await?;

        let (worktree, created) = match &task.worktree_id {
            Some(id) => {
                let worktree = self.inner.store.worktree(id).await?;
                if !matches!(worktree.status, WorktreeStatus::Active | WorktreeStatus::Dirty) {
                    return Err(Error::transition(
                        "worktree",
                        worktree.status,
                        WorktreeStatus::Active,
                    ));
                }
                (worktree, false)
            }
            None => {
                TaskWorkflow::check(&task, Stage::InProgress)?;
                match self.inner.worktrees.create(&project, &task).await {
                    Ok(worktree) => (worktree, true),
                    Err(e) => {
                        self.record_task_error(&task.id, &e.to_string()).await;
                        return Err(e);
                    }
                }
            }
        };

        let attached = self
            .update_task(&task.id, |t| {
                TaskWorkflow::apply(t, Stage::InProgress)?;
                t.worktree_id = Some(worktree.id.clone());
                t.branch = Some(worktree.branch.clone());
                t.agent_id = Some(run.agent_id.clone());
                t.last_error = None;
                Ok(())
            })
            .await;
        if let Err(e) = attached {
            if created {
                self.discard_worktree(&worktree.id).await;
            }
            return Err(e);
        }

        let start = AgentEvent::Start {
            task_id: task.id.clone(),
        };
        let (agent, generation, control) = match self
            .activate_agent(&run.agent_id, &task.id, AgentStatus::Idle, start)
            .await
        {
            Ok(activated) => activated,
            Err(e) => {
                if created {
                    self.detach_task(&task.id).await;
                    self.discard_worktree(&worktree.id).await;
                }
                return Err(e);
            }
        };

        self.spawn_loop(agent.id.clone(), task.id.clone(), generation, control);
        tracing::info!(
            project_id = %project.id,
            task_id = %task.id,
            agent_id = %agent.id,
            worktree_id = %worktree.id,
            branch = %worktree.branch,
            "run admitted"
        );
        Ok(RunResult::Admitted {
            agent_id: agent.id,
            task_id: task.id,
            worktree_id: worktree.id,
            branch: worktree.branch,
        })
    }

    /// Frees the task's slot and launches whatever gets promoted.
    pub(super) async fn release_slot(&self, project_id: &ProjectId, task_id: &TaskId) {
        let promoted = self.inner.admission.release(project_id, task_id);
        self.launch_promoted(project_id, promoted.into_iter().collect())
            .await;
    }

    /// Launches promoted runs. A run that fails to launch gives its slot to
    /// the next one in line.
    pub(super) async fn launch_promoted(&self, project_id: &ProjectId, runs: Vec<PendingRun>) {
        let mut pending: VecDeque<PendingRun> = runs.into();
        while let Some(run) = pending.pop_front() {
            tracing::info!(
                project_id = %project_id,
                task_id = %run.task_id,
                agent_id = %run.agent_id,
                waited_ms = (chrono::Utc::now() - run.enqueued_at).num_milliseconds(),
                "promoting queued run"
            );
            if let Err(e) = self.launch(&run).await {
                tracing::warn!(
                    project_id = %project_id,
                    task_id = %run.task_id,
                    error = %e,
                    "promoted run failed to launch"
                );
                pending.extend(self.inner.admission.release(project_id, &run.task_id));
            }
        }
    }

    /// Applies `event` to an agent expected in `expected` and registers a
    /// new loop generation for it in the same critical section.
    pub(super) async fn activate_agent(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        expected: AgentStatus,
        event: AgentEvent,
    ) -> Result<(Agent, u64, watch::Receiver<Control>)> {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = watch::channel(Control::Run);
        let event_name = event.name();

        let (agent, _) = self
            .update_agent(agent_id, |agent| {
                if agent.status != expected {
                    if expected == AgentStatus::Idle {
                        return Err(Error::AlreadyRunning(agent.id.to_string()));
                    }
                    return Err(Error::transition("agent", agent.status, event_name));
                }
                AgentLifecycle::apply(agent, event)?;
                if agent.current_task_id.as_ref() != Some(task_id) {
                    return Err(Error::Validation(format!(
                        "agent {} is not working on task {}",
                        agent.id, task_id
                    )));
                }
                self.inner.runs.lock().insert(
                    agent.id.clone(),
                    RunHandle {
                        generation,
                        control: tx,
                        join: None,
                    },
                );
                Ok(())
            })
            .await?;
        Ok((agent, generation, rx))
    }

    pub(super) fn spawn_loop(
        &self,
        agent_id: AgentId,
        task_id: TaskId,
        generation: u64,
        control: watch::Receiver<Control>,
    ) {
        let this = self.clone();
        let loop_agent = agent_id.clone();
        let join =
            tokio::spawn(async move { this.drive(loop_agent, task_id, generation, control).await });
        if let Some(handle) = self.inner.runs.lock().get_mut(&agent_id) {
            if handle.generation == generation {
                handle.join = Some(join);
            }
        }
    }

    pub(super) fn signal(&self, agent_id: &AgentId, control: Control) {
        if let Some(handle) = self.inner.runs.lock().get(agent_id) {
            handle.control.send_replace(control);
        }
    }

    fn is_current(&self, agent_id: &AgentId, generation: u64) -> bool {
        self.inner
            .runs
            .lock()
            .get(agent_id)
            .is_some_and(|h| h.generation == generation)
    }

    /// The turn loop of one agent run.
    async fn drive(
        self,
        agent_id: AgentId,
        task_id: TaskId,
        generation: u64,
        mut control: watch::Receiver<Control>,
    ) -> RunOutcome {
        let mut progress = RunProgress::new();

        let (task, workspace, worktree_id) = match self.workspace_of(&task_id).await {
            Ok(found) => found,
            Err(e) => return self.fail_run(&agent_id, &task_id, e.to_string(), &progress).await,
        };
        tracing::debug!(agent_id = %agent_id, task_id = %task_id, workspace = ?workspace, "agent loop started");

        let mut last_outcomes: Vec<ToolOutcome> = Vec::new();
        loop {
            let signal = *control.borrow();
            if let Some(outcome) = interrupted(signal, &progress) {
                return outcome;
            }

            let step = match self.step(&agent_id, generation).await {
                Ok(step) => step,
                Err(e) => return self.fail_run(&agent_id, &task_id, e.to_string(), &progress).await,
            };
            let (turn, max_turns, feedback, tools) = match step {
                Step::Turn {
                    turn,
                    max_turns,
                    feedback,
                    tools,
                } => (turn, max_turns, feedback, tools),
                Step::LimitReached => {
                    return RunOutcome::Paused {
                        reason: TURN_LIMIT_EXCEEDED.to_string(),
                        progress: progress.summary(),
                    }
                }
                Step::Halted(agent) => return halted(&agent, &progress),
                Step::Superseded => {
                    return RunOutcome::Stopped {
                        progress: progress.summary(),
                    }
                }
            };
            progress.record_turn();

            let ctx = TurnContext {
                agent_id: agent_id.clone(),
                task_id: task_id.clone(),
                title: task.title.clone(),
                description: task.description.clone(),
                turn,
                max_turns,
                workspace: workspace.clone(),
                feedback,
                last_outcomes: std::mem::take(&mut last_outcomes),
            };

            let plan = tokio::select! {
                plan = self.inner.runner.next_turn(&ctx) => plan,
                changed = control.changed() => {
                    if changed.is_err() {
                        return RunOutcome::Stopped { progress: progress.summary() };
                    }
                    continue;
                }
            };

            let calls = match plan {
                Ok(TurnPlan::ToolCalls { calls }) => calls,
                Ok(TurnPlan::Complete { summary }) => {
                    return match self.finish_run(&task_id, &summary).await {
                        Ok(_) => RunOutcome::Completed {
                            summary,
                            progress: progress.summary(),
                        },
                        Err(e) => {
                            // The agent already completed; re-running
                            // finish_run picks up from here.
                            tracing::error!(
                                agent_id = %agent_id,
                                task_id = %task_id,
                                error = %e,
                                "failed to submit task for review"
                            );
                            self.record_task_error(&task_id, &e.to_string()).await;
                            RunOutcome::Failed {
                                error: e.to_string(),
                                progress: progress.summary(),
                            }
                        }
                    };
                }
                Ok(TurnPlan::Fail { reason }) => {
                    return self.fail_run(&agent_id, &task_id, reason, &progress).await
                }
                Err(e) => {
                    let message = format!("runner '{}' failed: {}", self.inner.runner.name(), e);
                    return self.fail_run(&agent_id, &task_id, message, &progress).await;
                }
            };

            let effective = tools.intersect(&self.inner.tools);
            for call in &calls {
                let signal = *control.borrow();
                if signal != Control::Run {
                    break;
                }
                let outcome = self.execute_call(&agent_id, &effective, call, &workspace).await;
                progress.record_outcome(&outcome);
                last_outcomes.push(outcome);
            }

            let denied = last_outcomes.iter().filter(|o| !o.allowed).count();
            events::emit(
                self.inner.events.as_ref(),
                agent_id.as_str(),
                kinds::AGENT_TURN,
                json!({
                    "task_id": task_id,
                    "turn": turn,
                    "tool_calls": calls.len(),
                    "denied": denied,
                }),
            )
            .await;
            if let Err(e) = self.inner.worktrees.touch(&worktree_id).await {
                tracing::debug!(worktree_id = %worktree_id, error = %e, "failed to record activity");
            }
        }
    }

    async fn workspace_of(&self, task_id: &TaskId) -> Result<(Task, PathBuf, WorktreeId)> {
        let task = self.inner.store.task(task_id).await?;
        let worktree_id = task
            .worktree_id
            .clone()
            .ok_or_else(|| Error::Validation(format!("task {} has no worktree", task_id)))?;
        let worktree = self.inner.store.worktree(&worktree_id).await?;
        Ok((task, worktree.path, worktree_id))
    }

    /// Grants one turn, taking any pending feedback along with it.
    async fn step(&self, agent_id: &AgentId, generation: u64) -> Result<Step> {
        let (_, step) = self
            .update_agent(agent_id, |agent| {
                if !self.is_current(agent_id, generation) {
                    return Ok(Step::Superseded);
                }
                if !agent.status.is_active() {
                    return Ok(Step::Halted(agent.clone()));
                }
                match AgentLifecycle::apply(agent, AgentEvent::Step)? {
                    LifecycleOutcome::Stepped { turn } => Ok(Step::Turn {
                        turn,
                        max_turns: agent.max_turns,
                        feedback: std::mem::take(&mut agent.pending_feedback),
                        tools: agent.allowed_tools.clone(),
                    }),
                    LifecycleOutcome::TurnLimitReached => Ok(Step::LimitReached),
                    _ => Ok(Step::Halted(agent.clone())),
                }
            })
            .await?;
        Ok(step)
    }

    /// Validates one call and runs it if allowed. A denial only affects this
    /// call; it is reported back to the agent like any other outcome.
    async fn execute_call(
        &self,
        agent_id: &AgentId,
        tools: &ToolSet,
        call: &ToolCall,
        workspace: &Path,
    ) -> ToolOutcome {
        let decision =
            self.inner
                .sandbox
                .validate_as(Some(agent_id), tools, call.tool, &call.input, workspace);
        match decision {
            Decision::Allowed => self.inner.executor.execute(call, workspace).await,
            Decision::Denied(reason) => {
                let reason = reason.to_string();
                events::emit(
                    self.inner.events.as_ref(),
                    agent_id.as_str(),
                    kinds::TOOL_DENIED,
                    json!({ "tool": call.tool, "input": call.input, "reason": reason }),
                )
                .await;
                ToolOutcome::denied(call, reason)
            }
        }
    }

    async fn fail_run(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        message: String,
        progress: &RunProgress,
    ) -> RunOutcome {
        tracing::error!(
            agent_id = %agent_id,
            task_id = %task_id,
            turns = progress.turns(),
            error = %message,
            "agent run failed"
        );
        let event = AgentEvent::Error {
            message: message.clone(),
        };
        if let Err(e) = self
            .update_agent(agent_id, move |agent| AgentLifecycle::apply(agent, event))
            .await
        {
            tracing::warn!(agent_id = %agent_id, error = %e, "failed to record agent error");
        }
        self.record_task_error(task_id, &message).await;
        RunOutcome::Failed {
            error: message,
            progress: progress.summary(),
        }
    }

    pub(super) async fn record_task_error(&self, task_id: &TaskId, message: &str) {
        let result = self
            .update_task(task_id, |t| {
                t.last_error = Some(message.to_string());
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(task_id = %task_id, error = %e, "failed to record task error");
        }
    }

    /// Completion sequence: agent COMPLETE, commit and diff the worktree,
    /// task to `waiting_approval`.
    ///
    /// Every step tolerates having been applied already, so a sequence that
    /// failed part way can be re-run.
    pub async fn finish_run(&self, task_id: &TaskId, summary: &str) -> Result<Task> {
        let task = self.inner.store.task(task_id).await?;
        match task.stage {
            Stage::InProgress | Stage::WaitingApproval => {}
            Stage::Verified => return Ok(task),
            Stage::Backlog => {
                return Err(Error::transition("task", task.stage, Stage::WaitingApproval))
            }
        }

        if let Some(agent_id) = &task.agent_id {
            let event = AgentEvent::Complete {
                summary: summary.to_string(),
            };
            self.update_agent(agent_id, move |agent| {
                let bound = agent.current_task_id.as_ref() == Some(task_id);
                if !bound || !(agent.status.is_active() || agent.status == AgentStatus::Completed) {
                    return Ok(LifecycleOutcome::Unchanged);
                }
                AgentLifecycle::apply(agent, event)
            })
            .await?;
        }

        let worktree_id = task
            .worktree_id
            .clone()
            .ok_or_else(|| Error::Validation(format!("task {} has no worktree", task_id)))?;
        let worktree = self.inner.store.worktree(&worktree_id).await?;
        if matches!(worktree.status, WorktreeStatus::Active | WorktreeStatus::Dirty) {
            self.inner
                .worktrees
                .commit(&worktree_id, &commit_message(&task, summary))
                .await?;
        }
        let diff = self.inner.worktrees.diff_summary(&worktree_id).await?;

        let (task, _) = self
            .update_task(task_id, move |t| {
                TaskWorkflow::apply(t, Stage::WaitingApproval)?;
                t.diff_summary = Some(diff);
                t.last_error = None;
                Ok(())
            })
            .await?;
        tracing::info!(
            task_id = %task.id,
            diff = %task.diff_summary.clone().unwrap_or_default(),
            "task waiting for approval"
        );
        Ok(task)
    }

    /// Pauses a running agent at its next tool-call boundary.
    pub async fn pause(&self, agent_id: &AgentId) -> Result<RunResult> {
        let event = AgentEvent::Pause {
            reason: OPERATOR_PAUSE.to_string(),
        };
        let (agent, _) = self
            .update_agent(agent_id, move |agent| AgentLifecycle::apply(agent, event))
            .await?;
        self.signal(agent_id, Control::Pause);
        tracing::info!(agent_id = %agent_id, turn = agent.current_turn, "agent paused");
        Ok(RunResult::Paused {
            agent_id: agent.id,
            reason: agent
                .pause_reason
                .unwrap_or_else(|| OPERATOR_PAUSE.to_string()),
        })
    }

    /// Resumes a paused agent. An agent paused at its turn limit gets
    /// `agent.turn_extension` more turns.
    pub async fn resume(&self, agent_id: &AgentId, feedback: Option<String>) -> Result<RunResult> {
        let agent = self.inner.store.agent(agent_id).await?;
        let task_id = bound_task(&agent)?;
        let event = AgentEvent::Resume {
            feedback: feedback.filter(|f| !f.trim().is_empty()),
            turn_extension: self.inner.config.agent.turn_extension,
        };
        let (agent, generation, control) = self
            .activate_agent(agent_id, &task_id, AgentStatus::Paused, event)
            .await?;
        self.spawn_loop(agent.id.clone(), task_id.clone(), generation, control);
        tracing::info!(agent_id = %agent.id, task_id = %task_id, max_turns = agent.max_turns, "agent resumed");
        Ok(RunResult::Resumed {
            agent_id: agent.id,
            task_id,
            max_turns: agent.max_turns,
        })
    }

    /// Restarts an errored agent in its existing worktree, keeping its turn
    /// count.
    pub async fn retry(&self, agent_id: &AgentId, options: RetryOptions) -> Result<RunResult> {
        let agent = self.inner.store.agent(agent_id).await?;
        let task_id = bound_task(&agent)?;
        let event = AgentEvent::Retry {
            extra_turns: options.extra_turns,
            allowed_tools: options.allowed_tools,
        };
        let (agent, generation, control) = self
            .activate_agent(agent_id, &task_id, AgentStatus::Error, event)
            .await?;
        let cleared = self
            .update_task(&task_id, |t| {
                t.last_error = None;
                Ok(())
            })
            .await;
        if let Err(e) = cleared {
            tracing::warn!(task_id = %task_id, error = %e, "failed to clear task error");
        }
        self.spawn_loop(agent.id.clone(), task_id.clone(), generation, control);
        tracing::info!(agent_id = %agent.id, task_id = %task_id, max_turns = agent.max_turns, "agent retried");
        Ok(RunResult::Resumed {
            agent_id: agent.id,
            task_id,
            max_turns: agent.max_turns,
        })
    }

    /// Aborts an agent. Its worktree is kept for inspection and the task stays
    /// where it is; the admission slot goes to the next queued run.
    pub async fn stop(&self, agent_id: &AgentId) -> Result<RunResult> {
        let (agent, task_id) = self
            .update_agent(agent_id, |agent| {
                let task_id = agent.current_task_id.clone();
                AgentLifecycle::apply(agent, AgentEvent::Abort)?;
                Ok(task_id)
            })
            .await?;
        self.signal(agent_id, Control::Abort);

        for run in self.inner.admission.queued(&agent.project_id) {
            if &run.agent_id == agent_id {
                self.inner
                    .admission
                    .cancel_queued(&agent.project_id, &run.task_id);
            }
        }

        if let Some(task_id) = &task_id {
            let detached = self
                .update_task(task_id, |t| {
                    if t.agent_id.as_ref() == Some(agent_id) {
                        t.agent_id = None;
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = detached {
                tracing::warn!(task_id = %task_id, error = %e, "failed to detach stopped agent");
            }
            self.release_slot(&agent.project_id, task_id).await;
            tracing::info!(agent_id = %agent_id, task_id = %task_id, "agent stopped, worktree kept");
        }

        Ok(RunResult::Stopped {
            agent_id: agent_id.clone(),
            task_id,
        })
    }

    /// Waits for the agent's current loop to end. `None` if no loop is
    /// tracked or another caller already waited on it.
    pub async fn wait(&self, agent_id: &AgentId) -> Result<Option<RunOutcome>> {
        let join = self
            .inner
            .runs
            .lock()
            .get_mut(agent_id)
            .and_then(|h| h.join.take());
        match join {
            Some(join) => join
                .await
                .map(Some)
                .map_err(|e| Error::Execution(format!("agent loop for {} failed: {}", agent_id, e))),
            None => Ok(None),
        }
    }

    /// Aborts the agent bound to `task`, if it is still working on it.
    pub(super) async fn abort_bound_agent(&self, task: &Task) -> Result<()> {
        let Some(agent_id) = &task.agent_id else {
            return Ok(());
        };
        self.update_agent(agent_id, |agent| {
            if agent.current_task_id.as_ref() != Some(&task.id) {
                return Ok(LifecycleOutcome::Unchanged);
            }
            AgentLifecycle::apply(agent, AgentEvent::Abort)
        })
        .await?;
        self.signal(agent_id, Control::Abort);
        Ok(())
    }

    /// Returns a task to the backlog after a failed launch.
    async fn detach_task(&self, task_id: &TaskId) {
        let result = self
            .update_task(task_id, |t| {
                TaskWorkflow::apply(t, Stage::Backlog)?;
                t.worktree_id = None;
                t.branch = None;
                t.agent_id = None;
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(task_id = %task_id, error = %e, "failed to return task to backlog");
        }
    }

    async fn discard_worktree(&self, worktree_id: &WorktreeId) {
        if let Err(e) = self.inner.worktrees.remove(worktree_id, true).await {
            tracing::warn!(worktree_id = %worktree_id, error = %e, "failed to discard worktree");
        }
    }
}

fn bound_task(agent: &Agent) -> Result<TaskId> {
    agent
        .current_task_id
        .clone()
        .ok_or_else(|| Error::Validation(format!("agent {} has no task", agent.id)))
}

fn interrupted(signal: Control, progress: &RunProgress) -> Option<RunOutcome> {
    match signal {
        Control::Run => None,
        Control::Pause => Some(RunOutcome::Paused {
            reason: OPERATOR_PAUSE.to_string(),
            progress: progress.summary(),
        }),
        Control::Abort => Some(RunOutcome::Stopped {
            progress: progress.summary(),
        }),
    }
}

fn halted(agent: &Agent, progress: &RunProgress) -> RunOutcome {
    match agent.status {
        AgentStatus::Paused => RunOutcome::Paused {
            reason: agent
                .pause_reason
                .clone()
                .unwrap_or_else(|| OPERATOR_PAUSE.to_string()),
            progress: progress.summary(),
        },
        AgentStatus::Error => RunOutcome::Failed {
            error: agent.last_error.clone().unwrap_or_default(),
            progress: progress.summary(),
        },
        _ => RunOutcome::Stopped {
            progress: progress.summary(),
        },
    }
}
