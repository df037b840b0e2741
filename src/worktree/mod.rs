//! Per-task git worktrees: plumbing, state machine and manager.

mod git;
mod lifecycle;
mod manager;

pub use git::{parse_numstat, parse_status, parse_worktree_list, GitCli, ListedWorktree, StatusReport};
pub use lifecycle::WorktreeLifecycle;
pub use manager::{MergeOutcome, WorktreeManager};
