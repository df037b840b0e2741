//! Progress tracking for one agent run.
//!
//! Tracks turns, tool calls, denials and touched files. Limits are enforced
//! by turn count in the lifecycle, so there is no wall-clock timeout here.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::sandbox::ToolKind;

use super::executor::ToolOutcome;

/// Tracks progress of a running agent.
#[derive(Debug)]
pub struct RunProgress {
    turns: u32,
    tool_calls: u32,
    denials: u32,
    failures: u32,
    files_read: BTreeSet<PathBuf>,
    files_written: BTreeSet<PathBuf>,
    start_time: Instant,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl RunProgress {
    pub fn new() -> Self {
        Self {
            turns: 0,
            tool_calls: 0,
            denials: 0,
            failures: 0,
            files_read: BTreeSet::new(),
            files_written: BTreeSet::new(),
            start_time: Instant::now(),
        }
    }

    /// Records that a turn was granted.
    pub fn record_turn(&mut self) {
        self.turns += 1;
    }

    /// Records the outcome of a tool call, allowed or not.
    pub fn record_outcome(&mut self, outcome: &ToolOutcome) {
        self.tool_calls += 1;
        if !outcome.allowed {
            self.denials += 1;
            return;
        }
        if !outcome.success {
            self.failures += 1;
            return;
        }
        let caps = outcome.tool.capabilities();
        if caps.path_bound {
            let path = PathBuf::from(outcome.input.trim());
            if caps.writes_fs {
                self.files_written.insert(path);
            } else if outcome.tool == ToolKind::FileRead {
                self.files_read.insert(path);
            }
        }
    }

    pub fn turns(&self) -> u32 {
        self.turns
    }

    pub fn denials(&self) -> u32 {
        self.denials
    }

    /// Returns whether any tool ran successfully.
    pub fn has_activity(&self) -> bool {
        self.tool_calls > self.denials + self.failures
    }

    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary::from(self)
    }
}

/// Summary of progress state for serialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub turns: u32,
    pub tool_calls: u32,
    pub denials: u32,
    pub failures: u32,
    pub files_read: Vec<PathBuf>,
    pub files_written: Vec<PathBuf>,
    pub total_duration_secs: f64,
}

impl From<&RunProgress> for ProgressSummary {
    fn from(progress: &RunProgress) -> Self {
        Self {
            turns: progress.turns,
            tool_calls: progress.tool_calls,
            denials: progress.denials,
            failures: progress.failures,
            files_read: progress.files_read.iter().cloned().collect(),
            files_written: progress.files_written.iter().cloned().collect(),
            total_duration_secs: progress.start_time.elapsed().as_secs_f64(),
        }
    }
}
