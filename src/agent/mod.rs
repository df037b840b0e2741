//! Agent lifecycle, turn planning and tool execution.

mod executor;
mod lifecycle;
mod progress;
mod runner;

pub use executor::{ToolExecutor, ToolOutcome, DEFAULT_MAX_OUTPUT};
pub use lifecycle::{AgentEvent, AgentLifecycle, LifecycleOutcome, TURN_LIMIT_EXCEEDED};
pub use progress::{ProgressSummary, RunProgress};
pub use runner::{AgentRunner, ScriptedRunner, ToolArgs, ToolCall, TurnContext, TurnPlan};
