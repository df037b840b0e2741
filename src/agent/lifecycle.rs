//! Agent lifecycle state machine.
//!
//! ```text
//! idle -START-> starting -STEP-> running -COMPLETE-> completed -RESET-> idle
//!                  |                |  \-PAUSE-> paused -RESUME-> running
//!                  |                \--ERROR-> error -RETRY-> starting
//!   (any) -ABORT-> idle                 completed -RESUME-> running (review feedback)
//! ```
//!
//! STEP is guarded by the turn limit: at `current_turn >= max_turns` the
//! agent pauses with [`TURN_LIMIT_EXCEEDED`] instead of advancing.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Agent, AgentStatus, TaskId};
use crate::sandbox::ToolSet;

/// Pause reason set when the turn budget runs out.
pub const TURN_LIMIT_EXCEEDED: &str = "turn_limit_exceeded";

/// Inputs to the agent state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Start { task_id: TaskId },
    Step,
    Pause { reason: String },
    /// `turn_extension` is added to `max_turns` when the agent was paused at
    /// its turn limit.
    Resume {
        feedback: Option<String>,
        turn_extension: u32,
    },
    Error { message: String },
    Complete { summary: String },
    /// Releases a completed agent once its work has been accepted.
    Reset,
    /// Restarts an errored agent from where it stopped.
    Retry {
        extra_turns: u32,
        allowed_tools: Option<ToolSet>,
    },
    Abort,
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Start { .. } => "start",
            AgentEvent::Step => "step",
            AgentEvent::Pause { .. } => "pause",
            AgentEvent::Resume { .. } => "resume",
            AgentEvent::Error { .. } => "error",
            AgentEvent::Complete { .. } => "complete",
            AgentEvent::Reset => "reset",
            AgentEvent::Retry { .. } => "retry",
            AgentEvent::Abort => "abort",
        }
    }
}

/// What applying an event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    Moved { from: AgentStatus, to: AgentStatus },
    /// A turn was granted; `turn` is the new 1-based turn number.
    Stepped { turn: u32 },
    /// The turn guard fired and the agent is now paused.
    TurnLimitReached,
    /// The event had already been applied.
    Unchanged,
}

pub struct AgentLifecycle;

impl AgentLifecycle {
    /// `currentTurn < maxTurns`.
    pub fn within_turn_limit(agent: &Agent) -> bool {
        agent.current_turn < agent.max_turns
    }

    /// Status reached by applying `event` in `from`, ignoring guards.
    pub fn target(from: AgentStatus, event: &AgentEvent) -> Option<AgentStatus> {
        use AgentStatus as S;
        match (from, event) {
            (S::Idle, AgentEvent::Start { .. }) => Some(S::Starting),
            (S::Starting | S::Running, AgentEvent::Step) => Some(S::Running),
            (S::Starting | S::Running, AgentEvent::Pause { .. }) => Some(S::Paused),
            (S::Paused | S::Completed, AgentEvent::Resume { .. }) => Some(S::Running),
            (S::Starting | S::Running | S::Paused, AgentEvent::Error { .. }) => Some(S::Error),
            (S::Starting | S::Running, AgentEvent::Complete { .. }) => Some(S::Completed),
            (S::Completed, AgentEvent::Reset) => Some(S::Idle),
            (S::Error, AgentEvent::Retry { .. }) => Some(S::Starting),
            (_, AgentEvent::Abort) => Some(S::Idle),
            _ => None,
        }
    }

    /// Applies `event` to `agent`.
    ///
    /// Re-applying an event whose effect is already in place (pausing a
    /// paused agent, aborting an idle one) is `Unchanged`, never an error.
    pub fn apply(agent: &mut Agent, event: AgentEvent) -> Result<LifecycleOutcome> {
        let from = agent.status;

        if Self::already_applied(agent, &event) {
            return Ok(LifecycleOutcome::Unchanged);
        }

        let Some(to) = Self::target(from, &event) else {
            if let AgentEvent::Start { .. } = event {
                return Err(Error::AlreadyRunning(agent.id.to_string()));
            }
            return Err(Error::transition("agent", from, event.name()));
        };

        match event {
            AgentEvent::Start { task_id } => {
                agent.current_task_id = Some(task_id);
                agent.current_turn = 0;
                agent.pause_reason = None;
                agent.last_error = None;
                agent.pending_feedback.clear();
            }
            AgentEvent::Step => {
                if !Self::within_turn_limit(agent) {
                    agent.status = AgentStatus::Paused;
                    agent.pause_reason = Some(TURN_LIMIT_EXCEEDED.to_string());
                    tracing::info!(
                        agent_id = %agent.id,
                        turn = agent.current_turn,
                        max_turns = agent.max_turns,
                        "turn limit reached, pausing"
                    );
                    return Ok(LifecycleOutcome::TurnLimitReached);
                }
                agent.current_turn += 1;
                agent.status = to;
                return Ok(LifecycleOutcome::Stepped {
                    turn: agent.current_turn,
                });
            }
            AgentEvent::Pause { reason } => {
                agent.pause_reason = Some(reason);
            }
            AgentEvent::Resume {
                feedback,
                turn_extension,
            } => {
                if agent.pause_reason.as_deref() == Some(TURN_LIMIT_EXCEEDED)
                    || !Self::within_turn_limit(agent)
                {
                    agent.max_turns = agent.current_turn + turn_extension.max(1);
                }
                agent.pause_reason = None;
                agent.pending_feedback.extend(feedback);
            }
            AgentEvent::Error { message } => {
                agent.last_error = Some(message);
            }
            AgentEvent::Complete { .. } => {
                agent.pause_reason = None;
            }
            AgentEvent::Reset | AgentEvent::Abort => {
                agent.current_task_id = None;
                agent.pause_reason = None;
                agent.pending_feedback.clear();
            }
            AgentEvent::Retry {
                extra_turns,
                allowed_tools,
            } => {
                agent.max_turns = agent.max_turns.max(agent.current_turn) + extra_turns;
                if let Some(tools) = allowed_tools {
                    agent.allowed_tools = tools;
                }
                agent.last_error = None;
            }
        }

        agent.status = to;
        Ok(LifecycleOutcome::Moved { from, to })
    }

    fn already_applied(agent: &Agent, event: &AgentEvent) -> bool {
        match (agent.status, event) {
            (AgentStatus::Starting, AgentEvent::Start { task_id }) => {
                agent.current_task_id.as_ref() == Some(task_id)
            }
            (AgentStatus::Paused, AgentEvent::Pause { .. })
            | (AgentStatus::Error, AgentEvent::Error { .. })
            | (AgentStatus::Completed, AgentEvent::Complete { .. })
            | (AgentStatus::Idle, AgentEvent::Reset)
            | (AgentStatus::Idle, AgentEvent::Abort) => true,
            _ => false,
        }
    }

    /// Checks that a task is bound exactly when the agent is not idle.
    pub fn check_invariants(agent: &Agent) -> Result<()> {
        let idle = agent.status == AgentStatus::Idle;
        if idle == agent.current_task_id.is_some() {
            return Err(Error::Validation(format!(
                "agent {} is {} but current task is {:?}",
                agent.id, agent.status, agent.current_task_id
            )));
        }
        Ok(())
    }
}
