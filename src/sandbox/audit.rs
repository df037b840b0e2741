//! Append-only audit log of sandbox decisions.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::AgentId;

use super::ToolKind;

/// One recorded decision. Entries are never modified after being appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    pub tool: ToolKind,
    pub input: String,
    pub workspace_root: PathBuf,
    pub allowed: bool,
    pub reason: String,
}

#[derive(Default)]
struct AuditState {
    entries: Vec<AuditEntry>,
    sink: Option<File>,
}

/// Thread-safe, append-only decision log with an optional JSON-lines sink.
#[derive(Default)]
pub struct AuditLog {
    state: Mutex<AuditState>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also appends every entry as one JSON line to `path`.
    pub fn with_sink(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            state: Mutex::new(AuditState {
                entries: Vec::new(),
                sink: Some(file),
            }),
        })
    }

    pub(crate) fn append(
        &self,
        agent_id: Option<&AgentId>,
        tool: ToolKind,
        input: &str,
        workspace_root: &Path,
        allowed: bool,
        reason: String,
    ) {
        let mut state = self.state.lock();
        let entry = AuditEntry {
            sequence: state.entries.len() as u64,
            timestamp: Utc::now(),
            agent_id: agent_id.cloned(),
            tool,
            input: input.to_string(),
            workspace_root: workspace_root.to_path_buf(),
            allowed,
            reason,
        };

        if let Some(sink) = state.sink.as_mut() {
            let written = serde_json::to_string(&entry)
                .map_err(std::io::Error::other)
                .and_then(|line| writeln!(sink, "{}", line));
            if let Err(e) = written {
                tracing::warn!(error = %e, "failed to write audit entry to sink");
            }
        }
        state.entries.push(entry);
    }

    /// Snapshot of all entries in append order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.state.lock().entries.clone()
    }

    pub fn denials(&self) -> Vec<AuditEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| !e.allowed)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn entries_are_sequenced_in_append_order() {
        let log = AuditLog::new();
        log.append(None, ToolKind::Shell, "ls", Path::new("/ws"), true, "allowed".into());
        log.append(None, ToolKind::Shell, "sudo ls", Path::new("/ws"), false, "nope".into());

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 0);
        assert_eq!(entries[1].sequence, 1);
        assert_eq!(log.denials().len(), 1);
        assert_eq!(log.denials()[0].input, "sudo ls");
    }

    #[test]
    fn sink_receives_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit/decisions.jsonl");
        let log = AuditLog::with_sink(&path).unwrap();
        let agent = AgentId::from("agent-1");
        log.append(
            Some(&agent),
            ToolKind::FileRead,
            "README.md",
            Path::new("/ws"),
            true,
            "allowed".into(),
        );

        let content = std::fs::read_to_string(&path).unwrap();
        let entry: AuditEntry = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(entry.agent_id, Some(agent));
        assert_eq!(entry.tool, ToolKind::FileRead);
    }
}
