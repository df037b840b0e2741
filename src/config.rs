//! Configuration loading and validation.
//!
//! Configuration is read from TOML or YAML and validated before use to catch
//! errors early.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::ProjectId;
use crate::sandbox::{ToolKind, ToolSet};

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Admission control limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Concurrent agents per project unless overridden.
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent: usize,
    /// Upper bound on queued requests per project. Unbounded when absent.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    /// Per-project limits keyed by project id.
    #[serde(default)]
    pub projects: HashMap<String, usize>,
}

fn default_max_concurrent() -> usize {
    2
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent: default_max_concurrent(),
            queue_capacity: None,
            projects: HashMap::new(),
        }
    }
}

impl AdmissionConfig {
    /// Configured limit for a project, falling back to the default.
    pub fn limit_for(&self, project_id: &ProjectId) -> usize {
        self.projects
            .get(project_id.as_str())
            .copied()
            .unwrap_or(self.default_max_concurrent)
    }
}

/// Defaults for newly created agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Turn budget per run.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Turns added when resuming an agent paused at its turn limit.
    #[serde(default = "default_turn_extension")]
    pub turn_extension: u32,
    /// Global tool whitelist; agents get the intersection with their own set.
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,
}

fn default_max_turns() -> u32 {
    50
}

fn default_turn_extension() -> u32 {
    25
}

fn default_allowed_tools() -> Vec<String> {
    ToolSet::with_sensible_defaults()
        .iter()
        .map(|t| t.as_str().to_string())
        .collect()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            turn_extension: default_turn_extension(),
            allowed_tools: default_allowed_tools(),
        }
    }
}

impl AgentConfig {
    /// Parses `allowed_tools` into the closed tool set.
    pub fn tool_set(&self) -> Result<ToolSet> {
        self.allowed_tools
            .iter()
            .map(|name| name.parse::<ToolKind>())
            .collect()
    }
}

/// Worktree placement and housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeConfig {
    /// Directory holding all task worktrees. Defaults to a temp directory.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Prefix for task branch names.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Base branch used when a project does not name one.
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Days without activity after which an active worktree counts as stale.
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: u32,
}

fn default_branch_prefix() -> String {
    "autopilot".to_string()
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_stale_after_days() -> u32 {
    7
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            root: None,
            branch_prefix: default_branch_prefix(),
            base_branch: default_base_branch(),
            stale_after_days: default_stale_after_days(),
        }
    }
}

impl WorktreeConfig {
    /// Resolved worktree root directory.
    pub fn root_dir(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("kanban-autopilot-worktrees"))
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.stale_after_days))
    }
}

/// Sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Directory agents may touch outside their workspace.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Additional blocked command prefixes, e.g. `git push --force`.
    #[serde(default)]
    pub extra_blocked_commands: Vec<String>,
    /// JSON-lines file receiving every sandbox decision.
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            extra_blocked_commands: Vec::new(),
            audit_log: None,
        }
    }
}

impl SandboxConfig {
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutopilotConfig {
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub worktree: WorktreeConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl AutopilotConfig {
    /// Loads configuration from a `.toml`, `.yaml` or `.yml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("invalid YAML in {}: {}", path.display(), e))),
            Some("toml") | None => toml::from_str(&content)
                .map_err(|e| Error::Config(format!("invalid TOML in {}: {}", path.display(), e))),
            Some(other) => Err(Error::Config(format!(
                "unsupported config format '{}' for {}",
                other,
                path.display()
            ))),
        }
    }

    /// Loads and validates, logging warnings.
    pub fn load_validated(path: &Path) -> Result<Self> {
        let config = Self::load(path)?;
        for warning in config.validate().into_result()? {
            tracing::warn!(path = ?path, "{}", warning);
        }
        Ok(config)
    }
}

impl Validate for AdmissionConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.default_max_concurrent == 0 {
            result.add_error("admission.default_max_concurrent must be at least 1");
        }

        if self.default_max_concurrent > 16 {
            result.add_warning("admission.default_max_concurrent > 16 may exhaust local resources");
        }

        if self.queue_capacity == Some(0) {
            result.add_warning("admission.queue_capacity = 0 rejects every request over capacity");
        }

        for (project, limit) in &self.projects {
            if *limit == 0 {
                result.add_warning(format!(
                    "project '{}' has a concurrency limit of 0 and can never run agents",
                    project
                ));
            }
        }

        result
    }
}

impl Validate for AgentConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.max_turns == 0 {
            result.add_error("agent.max_turns must be at least 1");
        }

        if self.max_turns > 500 {
            result.add_warning("agent.max_turns > 500 may indicate a misconfiguration");
        }

        for tool in &self.allowed_tools {
            if tool.parse::<ToolKind>().is_err() {
                result.add_error(format!("unknown tool '{}' in agent.allowed_tools", tool));
            }
        }

        if self.allowed_tools.is_empty() {
            result.add_warning("agent.allowed_tools is empty; every tool call will be denied");
        }

        result
    }
}

impl Validate for WorktreeConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        let prefix = self.branch_prefix.trim();
        if prefix.is_empty() {
            result.add_error("worktree.branch_prefix cannot be empty");
        }
        if prefix.contains(char::is_whitespace) || prefix.contains("..") {
            result.add_error(format!(
                "worktree.branch_prefix '{}' is not a valid git ref component",
                prefix
            ));
        }

        if self.base_branch.trim().is_empty() {
            result.add_error("worktree.base_branch cannot be empty");
        }

        if self.stale_after_days == 0 {
            result.add_warning("worktree.stale_after_days = 0 marks every worktree stale");
        }

        result
    }
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Some(dir) = &self.temp_dir {
            if !dir.is_absolute() {
                result.add_error(format!(
                    "sandbox.temp_dir '{}' must be absolute",
                    dir.display()
                ));
            }
            if dir == Path::new("/") {
                result.add_error("sandbox.temp_dir cannot be the filesystem root");
            }
        }

        for pattern in &self.extra_blocked_commands {
            if shlex::split(pattern).map_or(true, |w| w.is_empty()) {
                result.add_warning(format!("ignoring unparsable blocked command '{}'", pattern));
            }
        }

        result
    }
}

impl Validate for AutopilotConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.merge(self.admission.validate());
        result.merge(self.agent.validate());
        result.merge(self.worktree.validate());
        result.merge(self.sandbox.validate());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn config_has_sensible_defaults() {
        let config = AutopilotConfig::default();

        assert_eq!(config.admission.default_max_concurrent, 2);
        assert!(config.admission.queue_capacity.is_none());
        assert_eq!(config.agent.max_turns, 50);
        assert_eq!(config.worktree.branch_prefix, "autopilot");
        assert_eq!(config.worktree.stale_after_days, 7);
        assert!(config.validate().is_valid());
    }

    #[test]
    fn default_tools_parse() {
        let tools = AgentConfig::default().tool_set().unwrap();
        assert!(tools.contains(ToolKind::Shell));
        assert!(!tools.contains(ToolKind::NetworkFetch));
    }

    #[test]
    fn project_override_wins() {
        let mut admission = AdmissionConfig::default();
        admission.projects.insert("web".to_string(), 5);
        assert_eq!(admission.limit_for(&ProjectId::from("web")), 5);
        assert_eq!(admission.limit_for(&ProjectId::from("api")), 2);
    }

    #[test]
    fn zero_limits_fail_validation() {
        let mut config = AutopilotConfig::default();
        config.admission.default_max_concurrent = 0;
        config.agent.max_turns = 0;
        let result = config.validate();
        assert!(!result.is_valid());
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn unknown_tool_fails_validation() {
        let mut agent = AgentConfig::default();
        agent.allowed_tools.push("teleport".to_string());
        let result = agent.validate();
        assert!(result.errors.iter().any(|e| e.contains("teleport")));
    }

    #[test]
    fn relative_temp_dir_fails_validation() {
        let sandbox = SandboxConfig {
            temp_dir: Some(PathBuf::from("tmp")),
            ..Default::default()
        };
        assert!(!sandbox.validate().is_valid());
    }

    #[test]
    fn bad_branch_prefix_fails_validation() {
        let worktree = WorktreeConfig {
            branch_prefix: "my prefix".to_string(),
            ..Default::default()
        };
        assert!(!worktree.validate().is_valid());
    }

    #[test]
    fn into_result_returns_warnings() {
        let mut result = ValidationResult::default();
        result.add_warning("careful");
        assert_eq!(result.into_result().unwrap(), vec!["careful".to_string()]);

        let mut result = ValidationResult::default();
        result.add_error("broken");
        assert!(matches!(result.into_result(), Err(Error::Config(_))));
    }

    #[test]
    fn config_deserializes_from_toml() {
        let toml = r#"
            [admission]
            default_max_concurrent = 1
            queue_capacity = 10

            [admission.projects]
            web = 3

            [agent]
            max_turns = 20
            allowed_tools = ["file_read", "shell"]

            [worktree]
            branch_prefix = "bot"
            stale_after_days = 3
        "#;

        let config: AutopilotConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.admission.default_max_concurrent, 1);
        assert_eq!(config.admission.queue_capacity, Some(10));
        assert_eq!(config.admission.projects.get("web"), Some(&3));
        assert_eq!(config.agent.max_turns, 20);
        assert_eq!(config.agent.turn_extension, 25);
        assert_eq!(config.agent.tool_set().unwrap().len(), 2);
        assert_eq!(config.worktree.branch_prefix, "bot");
        assert_eq!(config.worktree.base_branch, "main");
    }

    #[test]
    fn load_picks_format_from_extension() {
        let dir = TempDir::new().unwrap();

        let yaml_path = dir.path().join("autopilot.yaml");
        std::fs::write(&yaml_path, "agent:\n  max_turns: 7\n").unwrap();
        let config = AutopilotConfig::load(&yaml_path).unwrap();
        assert_eq!(config.agent.max_turns, 7);

        let toml_path = dir.path().join("autopilot.toml");
        std::fs::write(&toml_path, "[worktree]\nstale_after_days = 1\n").unwrap();
        let config = AutopilotConfig::load_validated(&toml_path).unwrap();
        assert_eq!(config.worktree.stale_after_days, 1);

        let json_path = dir.path().join("autopilot.json");
        std::fs::write(&json_path, "{}").unwrap();
        assert!(matches!(
            AutopilotConfig::load(&json_path),
            Err(Error::Config(_))
        ));
    }
}
