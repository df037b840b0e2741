//! Closed set of tool identifiers and their capability table.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Every tool an agent can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    FileRead,
    FileWrite,
    FileEdit,
    ListDir,
    Search,
    Shell,
    NetworkFetch,
}

/// What a tool is able to do once allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub reads_fs: bool,
    pub writes_fs: bool,
    pub executes: bool,
    pub network: bool,
    /// Input is a filesystem path that must stay inside the workspace.
    pub path_bound: bool,
}

impl ToolKind {
    pub const ALL: [ToolKind; 7] = [
        ToolKind::FileRead,
        ToolKind::FileWrite,
        ToolKind::FileEdit,
        ToolKind::ListDir,
        ToolKind::Search,
        ToolKind::Shell,
        ToolKind::NetworkFetch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::FileRead => "file_read",
            ToolKind::FileWrite => "file_write",
            ToolKind::FileEdit => "file_edit",
            ToolKind::ListDir => "list_dir",
            ToolKind::Search => "search",
            ToolKind::Shell => "shell",
            ToolKind::NetworkFetch => "network_fetch",
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        let none = Capabilities {
            reads_fs: false,
            writes_fs: false,
            executes: false,
            network: false,
            path_bound: false,
        };
        match self {
            ToolKind::FileRead | ToolKind::ListDir | ToolKind::Search => Capabilities {
                reads_fs: true,
                path_bound: true,
                ..none
            },
            ToolKind::FileWrite | ToolKind::FileEdit => Capabilities {
                reads_fs: true,
                writes_fs: true,
                path_bound: true,
                ..none
            },
            ToolKind::Shell => Capabilities {
                reads_fs: true,
                writes_fs: true,
                executes: true,
                ..none
            },
            ToolKind::NetworkFetch => Capabilities {
                network: true,
                ..none
            },
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = Error;

    /// Accepts the snake_case identifiers and the CLI-style names agents report
    /// (`Read`, `Write`, `Edit`, `LS`, `Grep`, `Bash`, `WebFetch`).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "file_read" | "Read" => Ok(ToolKind::FileRead),
            "file_write" | "Write" => Ok(ToolKind::FileWrite),
            "file_edit" | "Edit" => Ok(ToolKind::FileEdit),
            "list_dir" | "LS" => Ok(ToolKind::ListDir),
            "search" | "Grep" | "Glob" => Ok(ToolKind::Search),
            "shell" | "Bash" => Ok(ToolKind::Shell),
            "network_fetch" | "WebFetch" => Ok(ToolKind::NetworkFetch),
            other => Err(Error::Validation(format!("unknown tool '{}'", other))),
        }
    }
}

/// A whitelist of tools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolSet(BTreeSet<ToolKind>);

impl ToolSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self(ToolKind::ALL.into_iter().collect())
    }

    /// Everything except network access.
    pub fn with_sensible_defaults() -> Self {
        Self(
            ToolKind::ALL
                .into_iter()
                .filter(|t| !t.capabilities().network)
                .collect(),
        )
    }

    pub fn contains(&self, tool: ToolKind) -> bool {
        self.0.contains(&tool)
    }

    pub fn insert(&mut self, tool: ToolKind) {
        self.0.insert(tool);
    }

    /// Tools allowed by both sets.
    pub fn intersect(&self, other: &ToolSet) -> ToolSet {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = ToolKind> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ToolKind> for ToolSet {
    fn from_iter<I: IntoIterator<Item = ToolKind>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
