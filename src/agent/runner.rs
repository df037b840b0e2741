//! Agent runner port.
//!
//! A runner is asked for one turn at a time. It never drives the loop
//! itself, so pausing or aborting between turns needs no cooperation from it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{AgentId, TaskId};
use crate::sandbox::ToolKind;

use super::executor::ToolOutcome;

/// Extra arguments for tools that need more than a path or command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolArgs {
    #[default]
    None,
    /// Full file contents for `file_write`.
    Content { text: String },
    /// Exact-match replacement for `file_edit`.
    Replace { old: String, new: String },
    /// Regular expression for `search`.
    Pattern { pattern: String },
}

/// One tool invocation requested by the agent.
///
/// `input` is what the sandbox validates: a path for file tools, the command
/// line for `shell`, the URL for `network_fetch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: ToolKind,
    pub input: String,
    #[serde(default)]
    pub args: ToolArgs,
}

impl ToolCall {
    pub fn new(tool: ToolKind, input: impl Into<String>) -> Self {
        Self {
            tool,
            input: input.into(),
            args: ToolArgs::None,
        }
    }

    pub fn shell(command: impl Into<String>) -> Self {
        Self::new(ToolKind::Shell, command)
    }

    pub fn read(path: impl Into<String>) -> Self {
        Self::new(ToolKind::FileRead, path)
    }

    pub fn write(path: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tool: ToolKind::FileWrite,
            input: path.into(),
            args: ToolArgs::Content { text: text.into() },
        }
    }

    pub fn edit(path: impl Into<String>, old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            tool: ToolKind::FileEdit,
            input: path.into(),
            args: ToolArgs::Replace {
                old: old.into(),
                new: new.into(),
            },
        }
    }

    pub fn search(path: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            tool: ToolKind::Search,
            input: path.into(),
            args: ToolArgs::Pattern {
                pattern: pattern.into(),
            },
        }
    }
}

/// What the runner decided to do this turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum TurnPlan {
    ToolCalls { calls: Vec<ToolCall> },
    Complete { summary: String },
    Fail { reason: String },
}

/// Everything a runner sees when planning a turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub title: String,
    pub description: String,
    /// 1-based turn being planned.
    pub turn: u32,
    pub max_turns: u32,
    pub workspace: PathBuf,
    /// Reviewer or operator feedback not yet acknowledged.
    pub feedback: Vec<String>,
    /// Results of the previous turn's tool calls, denials included.
    pub last_outcomes: Vec<ToolOutcome>,
}

/// Produces agent turns.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Plans the next turn.
    async fn next_turn(&self, ctx: &TurnContext) -> Result<TurnPlan>;

    /// Returns the name of this runner.
    fn name(&self) -> &str;
}

/// Replays a fixed script of turns.
///
/// Turn `n` returns the `n`-th plan of the task's script (or of the default
/// script); once the script is exhausted every turn completes.
pub struct ScriptedRunner {
    default_script: Vec<TurnPlan>,
    task_scripts: Mutex<HashMap<TaskId, Vec<TurnPlan>>>,
    turn_delay: Option<Duration>,
}

impl ScriptedRunner {
    pub fn new(default_script: Vec<TurnPlan>) -> Self {
        Self {
            default_script,
            task_scripts: Mutex::new(HashMap::new()),
            turn_delay: None,
        }
    }

    /// A runner whose every task completes on its first turn.
    pub fn completing() -> Self {
        Self::new(Vec::new())
    }

    /// Uses `script` for one task instead of the default.
    pub fn with_task_script(self, task_id: TaskId, script: Vec<TurnPlan>) -> Self {
        self.task_scripts.lock().insert(task_id, script);
        self
    }

    pub fn set_task_script(&self, task_id: TaskId, script: Vec<TurnPlan>) {
        self.task_scripts.lock().insert(task_id, script);
    }

    /// Sleeps before answering each turn.
    pub fn with_turn_delay(mut self, delay: Duration) -> Self {
        self.turn_delay = Some(delay);
        self
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn next_turn(&self, ctx: &TurnContext) -> Result<TurnPlan> {
        if let Some(delay) = self.turn_delay {
            tokio::time::sleep(delay).await;
        }
        let index = ctx.turn.saturating_sub(1) as usize;
        let plan = {
            let scripts = self.task_scripts.lock();
            let script = scripts.get(&ctx.task_id).unwrap_or(&self.default_script);
            script.get(index).cloned()
        };
        Ok(plan.unwrap_or_else(|| TurnPlan::Complete {
            summary: format!("finished after {} turn(s)", ctx.turn),
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
