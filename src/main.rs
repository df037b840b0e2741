//! Kanban Autopilot CLI
//!
//! Operator utilities around the orchestration core: sandbox checks, stale
//! worktree cleanup and config validation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use autopilot::config::{AutopilotConfig, Validate};
use autopilot::exec::LocalBackend;
use autopilot::sandbox::{AuditLog, CommandPolicy, SecuritySandbox, ToolKind, ToolSet};
use autopilot::store::{InMemoryStore, Store};
use autopilot::{Decision, Project, Result, WorktreeManager};
use chrono::{DateTime, Utc};

const USAGE: &str = "\
Usage:
  kanban-autopilot check <workspace> <command...>   Show the sandbox verdict for a shell command
  kanban-autopilot prune <repo> [--days N]          Remove autopilot worktrees idle for N days
  kanban-autopilot config <file>                    Load and validate a config file

Environment variables:
  AUTOPILOT_CONFIG=<file>  Config used by check and prune (default: built-in defaults)";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    };

    let result = match command.as_str() {
        "check" => check(rest),
        "prune" => prune(rest).await,
        "config" => config(rest),
        "-h" | "--help" | "help" => {
            println!("{}", USAGE);
            Ok(true)
        }
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(1);
        }
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn load_config() -> Result<AutopilotConfig> {
    match std::env::var("AUTOPILOT_CONFIG") {
        Ok(path) => AutopilotConfig::load_validated(Path::new(&path)),
        Err(_) => Ok(AutopilotConfig::default()),
    }
}

fn usage_error(message: &str) -> ! {
    eprintln!("{}\n\n{}", message, USAGE);
    std::process::exit(1);
}

/// Prints the sandbox decision for a shell command run in `workspace`.
fn check(args: &[String]) -> Result<bool> {
    if args.len() < 2 {
        usage_error("check needs a workspace and a command");
    }
    let workspace = PathBuf::from(&args[0]);
    let command = args[1..].join(" ");

    let config = load_config()?;
    let policy = CommandPolicy::new()
        .with_blocked_commands(config.sandbox.extra_blocked_commands.iter());
    let sandbox = SecuritySandbox::new(policy, config.sandbox.temp_dir(), AuditLog::new());
    let tools: ToolSet = config.agent.tool_set()?;

    match sandbox.validate(&tools, ToolKind::Shell, &command, &workspace) {
        Decision::Allowed => {
            println!("allowed: {}", command);
            Ok(true)
        }
        Decision::Denied(reason) => {
            println!("denied: {}", reason);
            Ok(false)
        }
    }
}

/// Removes worktrees under the configured root whose directory has not
/// changed for `--days` days.
async fn prune(args: &[String]) -> Result<bool> {
    let Some(repo) = args.first() else {
        usage_error("prune needs a repository path");
    };
    let mut config = load_config()?;
    match args.get(1).map(String::as_str) {
        None => {}
        Some("--days") => match args.get(2).and_then(|d| d.parse::<u32>().ok()) {
            Some(days) => config.worktree.stale_after_days = days,
            None => usage_error("--days needs a whole number"),
        },
        Some(other) => usage_error(&format!("unexpected argument: {}", other)),
    }

    let repo = std::fs::canonicalize(repo)?;
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let manager = WorktreeManager::new(
        Arc::new(LocalBackend::new()),
        store.clone(),
        config.worktree.clone(),
    );
    let project = Project::new(
        repo.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repo".to_string()),
        &repo,
        config.worktree.base_branch.clone(),
    );
    store.put_project(&project).await?;

    let cutoff = Utc::now() - config.worktree.stale_after();
    let mut removed = 0usize;
    for orphan in manager.orphaned_worktrees(&project).await? {
        if let Some(modified) = last_modified(&orphan.path) {
            if modified > cutoff {
                tracing::debug!(path = ?orphan.path, modified = %modified, "worktree still fresh");
                continue;
            }
        }
        manager.remove_orphan(&repo, &orphan).await?;
        println!("removed {}", orphan.path.display());
        removed += 1;
    }
    manager.git().run(&repo, &["worktree", "prune"]).await?;
    println!(
        "pruned {} worktree(s) idle for {} day(s) under {}",
        removed,
        config.worktree.stale_after_days,
        manager.config().root_dir().display()
    );
    Ok(true)
}

fn last_modified(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

/// Loads a config file and reports validation errors and warnings.
fn config(args: &[String]) -> Result<bool> {
    let Some(path) = args.first() else {
        usage_error("config needs a file path");
    };
    let path = Path::new(path);
    let config = AutopilotConfig::load(path)?;
    let validation = config.validate();

    for warning in &validation.warnings {
        println!("warning: {}", warning);
    }
    for error in &validation.errors {
        println!("error: {}", error);
    }
    if !validation.is_valid() {
        return Ok(false);
    }

    let rendered = serde_json::to_string_pretty(&config)
        .map_err(|e| autopilot::Error::Config(format!("failed to render config: {}", e)))?;
    println!("{}", rendered);
    Ok(true)
}
