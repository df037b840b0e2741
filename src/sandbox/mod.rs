//! Security sandbox gating every agent tool call.
//!
//! [`SecuritySandbox::validate`] applies its rules in order and the first match wins:
//!
//! 1. tool not in the agent's effective whitelist,
//! 2. shell command matching a blocked pattern ([`CommandPolicy`]),
//! 3. working directory or a path argument resolving outside the workspace
//!    root (the temp dir and `/dev/null` excepted),
//! 4. otherwise allowed.
//!
//! Every decision is appended to the [`AuditLog`].

mod audit;
pub mod paths;
mod policy;
mod tools;

pub use audit::{AuditEntry, AuditLog};
pub use policy::{BlockedRule, CommandPolicy, PolicyViolation};
pub use tools::{Capabilities, ToolKind, ToolSet};

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::model::AgentId;

/// Why a call was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    ToolNotAllowed(ToolKind),
    Blocked(PolicyViolation),
    PathEscape(String),
    Malformed(String),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::ToolNotAllowed(tool) => write!(f, "tool '{}' is not whitelisted", tool),
            DenyReason::Blocked(v) => write!(f, "{}: {}", v.rule, v.detail),
            DenyReason::PathEscape(path) => write!(f, "path '{}' is outside the workspace", path),
            DenyReason::Malformed(msg) => write!(f, "malformed input: {}", msg),
        }
    }
}

/// Outcome of validating one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// Converts a denial into the matching security error.
    pub fn into_result(self, tool: ToolKind) -> crate::error::Result<()> {
        match self {
            Decision::Allowed => Ok(()),
            Decision::Denied(DenyReason::PathEscape(path)) => {
                Err(Error::PathTraversal(PathBuf::from(path)))
            }
            Decision::Denied(reason) => Err(Error::ToolDenied {
                tool: tool.to_string(),
                reason: reason.to_string(),
            }),
        }
    }
}

/// Validates tool invocations against whitelist, blocked patterns and path containment.
pub struct SecuritySandbox {
    policy: CommandPolicy,
    temp_dir: PathBuf,
    audit: AuditLog,
}

impl Default for SecuritySandbox {
    fn default() -> Self {
        Self::new(CommandPolicy::new(), std::env::temp_dir(), AuditLog::new())
    }
}

impl SecuritySandbox {
    pub fn new(policy: CommandPolicy, temp_dir: PathBuf, audit: AuditLog) -> Self {
        Self {
            policy,
            temp_dir: paths::normalize(&temp_dir),
            audit,
        }
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Validates and records the decision.
    pub fn validate(
        &self,
        allowed: &ToolSet,
        tool: ToolKind,
        input: &str,
        workspace_root: &Path,
    ) -> Decision {
        self.validate_as(None, allowed, tool, input, workspace_root)
    }

    /// Like [`validate`](Self::validate), attributing the audit entry to an agent.
    pub fn validate_as(
        &self,
        agent_id: Option<&AgentId>,
        allowed: &ToolSet,
        tool: ToolKind,
        input: &str,
        workspace_root: &Path,
    ) -> Decision {
        let decision = self.evaluate(allowed, tool, input, workspace_root);
        let reason = match &decision {
            Decision::Allowed => "allowed".to_string(),
            Decision::Denied(reason) => reason.to_string(),
        };
        if let Decision::Denied(reason) = &decision {
            tracing::info!(
                agent_id = ?agent_id.map(AgentId::as_str),
                tool = %tool,
                input = %input,
                root = ?workspace_root,
                reason = %reason,
                "tool call denied"
            );
        }
        self.audit.append(
            agent_id,
            tool,
            input,
            workspace_root,
            decision.is_allowed(),
            reason,
        );
        decision
    }

    /// Pure decision function; does not touch the audit log or the filesystem.
    pub fn evaluate(
        &self,
        allowed: &ToolSet,
        tool: ToolKind,
        input: &str,
        workspace_root: &Path,
    ) -> Decision {
        if !allowed.contains(tool) {
            return Decision::Denied(DenyReason::ToolNotAllowed(tool));
        }
        let root = paths::normalize(workspace_root);

        match tool {
            ToolKind::Shell => self.evaluate_shell(input, &root),
            ToolKind::NetworkFetch => {
                let trimmed = input.trim();
                if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
                    Decision::Allowed
                } else {
                    Decision::Denied(DenyReason::Malformed(format!(
                        "'{}' is not an http(s) URL",
                        trimmed
                    )))
                }
            }
            _ => {
                // Path-bound tools; an empty path means the workspace root.
                let raw = if input.trim().is_empty() { "." } else { input.trim() };
                self.check_containment(&root, &root, raw)
            }
        }
    }

    fn evaluate_shell(&self, command: &str, root: &Path) -> Decision {
        if command.trim().is_empty() {
            return Decision::Denied(DenyReason::Malformed("empty command".to_string()));
        }
        let segments = match paths::parse_command(command) {
            Ok(segments) => segments,
            Err(msg) => return Decision::Denied(DenyReason::Malformed(msg)),
        };

        if let Some(violation) = self.policy.check(command, &segments, root) {
            return Decision::Denied(DenyReason::Blocked(violation));
        }

        let mut cwd = root.to_path_buf();
        for segment in &segments {
            let mut candidates: Vec<&str> = paths::path_arguments(segment);
            candidates.extend(segment.redirects.iter().map(|r| r.target.as_str()));
            // A relative program path like ../../bin/tool also has to stay inside.
            if let Some(first) = segment.words.first() {
                if !first.starts_with('/') && first.contains('/') {
                    candidates.push(first);
                }
            }
            for raw in candidates {
                if let Decision::Denied(reason) = self.check_containment(&cwd, root, raw) {
                    return Decision::Denied(reason);
                }
            }

            if segment.program() == Some("cd") {
                let target = segment.args().first().map(String::as_str).unwrap_or("~");
                match paths::resolve(&cwd, target) {
                    Some(next) if self.is_permitted(&next, root) => cwd = next,
                    _ => return Decision::Denied(DenyReason::PathEscape(target.to_string())),
                }
            }
        }
        Decision::Allowed
    }

    fn check_containment(&self, cwd: &Path, root: &Path, raw: &str) -> Decision {
        match paths::resolve(cwd, raw) {
            Some(path) if self.is_permitted(&path, root) => Decision::Allowed,
            _ => Decision::Denied(DenyReason::PathEscape(raw.to_string())),
        }
    }

    fn is_permitted(&self, path: &Path, root: &Path) -> bool {
        paths::is_within(path, root)
            || paths::is_within(path, &self.temp_dir)
            || path == Path::new("/dev/null")
    }
}
