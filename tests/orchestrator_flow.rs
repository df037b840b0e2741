//! End-to-end runs through the orchestrator against real git repositories.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use autopilot::agent::{ScriptedRunner, ToolCall, TurnPlan, TURN_LIMIT_EXCEEDED};
use autopilot::config::AutopilotConfig;
use autopilot::events::{kinds, RecordingPublisher};
use autopilot::exec::LocalBackend;
use autopilot::model::{AgentId, AgentStatus, Project, Stage, Task, WorktreeStatus};
use autopilot::orchestrator::{Orchestrator, Ports, RetryOptions, RunOutcome, RunResult};
use autopilot::store::{InMemoryStore, Store, StoreExt};
use autopilot::Error;
use common::{create_temp_git_repo, git};
use tempfile::TempDir;

struct Harness {
    repo: TempDir,
    root: TempDir,
    _scratch: TempDir,
    store: Arc<InMemoryStore>,
    events: RecordingPublisher,
    runner: Arc<ScriptedRunner>,
    orchestrator: Orchestrator,
    project: Project,
}

async fn harness(limit: usize, runner: ScriptedRunner) -> Harness {
    let repo = create_temp_git_repo();
    let root_dir = TempDir::new().expect("failed to create temp dir");
    let scratch = TempDir::new().expect("failed to create temp dir");

    let mut config = AutopilotConfig::default();
    config.worktree.root = Some(root_dir.path().canonicalize().expect("canonical root"));
    config.sandbox.temp_dir = Some(scratch.path().to_path_buf());

    let store = Arc::new(InMemoryStore::new());
    let events = RecordingPublisher::new();
    let runner = Arc::new(runner);
    let ports = Ports::new(store.clone(), Arc::new(LocalBackend::new()), runner.clone())
        .with_events(Arc::new(events.clone()));
    let orchestrator = Orchestrator::new(config, ports).unwrap();

    let project = orchestrator
        .register_project(
            Project::new("demo", repo.path(), "main").with_max_concurrent_agents(limit),
        )
        .await
        .unwrap();

    Harness {
        repo,
        root: root_dir,
        _scratch: scratch,
        store,
        events,
        runner,
        orchestrator,
        project,
    }
}

impl Harness {
    async fn task(&self, title: &str, script: Vec<TurnPlan>) -> Task {
        let task = self
            .orchestrator
            .create_task(&self.project.id, title, "")
            .await
            .unwrap();
        if !script.is_empty() {
            self.runner.set_task_script(task.id.clone(), script);
        }
        task
    }

    async fn reload(&self, task: &Task) -> Task {
        self.store.task(&task.id).await.unwrap()
    }

    async fn agent_status(&self, agent_id: &AgentId) -> AgentStatus {
        self.store.agent(agent_id).await.unwrap().status
    }

    async fn finish(&self, agent_id: &AgentId) -> RunOutcome {
        tokio::time::timeout(Duration::from_secs(30), self.orchestrator.wait(agent_id))
            .await
            .expect("agent loop did not finish")
            .unwrap()
            .expect("no agent loop tracked")
    }
}

fn write(path: &str, text: &str) -> TurnPlan {
    TurnPlan::ToolCalls {
        calls: vec![ToolCall::write(path, text)],
    }
}

fn busy_turns(n: usize) -> Vec<TurnPlan> {
    (0..n)
        .map(|_| TurnPlan::ToolCalls {
            calls: vec![ToolCall::new(autopilot::ToolKind::ListDir, ".")],
        })
        .collect()
}

fn admitted(result: RunResult) -> AgentId {
    match result {
        RunResult::Admitted { agent_id, .. } => agent_id,
        other => panic!("expected admission, got {:?}", other),
    }
}

#[tokio::test]
async fn full_project_queues_and_promotes_on_approval() {
    let h = harness(1, ScriptedRunner::completing()).await;
    let first = h.task("first", vec![write("feature.txt", "hello\n")]).await;
    let second = h.task("second", vec![]).await;

    let first_agent = admitted(h.orchestrator.run(&h.project.id, &first.id).await.unwrap());
    let queued = h.orchestrator.run(&h.project.id, &second.id).await.unwrap();
    let RunResult::Queued {
        agent_id: second_agent,
        position,
        ..
    } = queued
    else {
        panic!("expected queue, got {:?}", queued);
    };
    assert_eq!(position, 1);
    assert_eq!(h.orchestrator.get_running_count(&h.project.id), 1);
    assert_eq!(h.events.of_type(kinds::TASK_QUEUED).len(), 1);

    // Asking again keeps the existing place in line.
    let again = h.orchestrator.start(&second_agent, &second.id).await.unwrap();
    assert!(matches!(again, RunResult::Queued { position: 1, .. }));
    assert_eq!(h.orchestrator.get_queued_tasks(&h.project.id).len(), 1);

    let outcome = h.finish(&first_agent).await;
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    let first = h.reload(&first).await;
    assert_eq!(first.stage, Stage::WaitingApproval);
    assert_eq!(first.diff_summary.as_ref().unwrap().additions, 1);
    // Review does not free the slot.
    assert_eq!(h.orchestrator.get_running_count(&h.project.id), 1);
    assert_eq!(h.reload(&second).await.stage, Stage::Backlog);

    let verified = h.orchestrator.approve(&first.id).await.unwrap();
    assert_eq!(verified.stage, Stage::Verified);
    assert!(verified.worktree_id.is_none());
    assert!(h.repo.path().join("feature.txt").exists());
    assert_eq!(h.agent_status(&first_agent).await, AgentStatus::Idle);

    // The queued run took the freed slot.
    assert!(h.orchestrator.get_queued_tasks(&h.project.id).is_empty());
    assert_eq!(h.orchestrator.get_running_count(&h.project.id), 1);
    let outcome = h.finish(&second_agent).await;
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(h.reload(&second).await.stage, Stage::WaitingApproval);
}

#[tokio::test]
async fn completion_and_approval_are_idempotent() {
    let h = harness(2, ScriptedRunner::completing()).await;
    let task = h.task("docs", vec![write("docs.md", "# Docs\n")]).await;

    let moved = h
        .orchestrator
        .move_column(&task.id, Stage::InProgress, None)
        .await
        .unwrap();
    // The run may already have finished by the time the move returns.
    assert!(matches!(moved.stage, Stage::InProgress | Stage::WaitingApproval));
    let agent_id = moved.agent_id.clone().unwrap();
    h.finish(&agent_id).await;

    let before = h.reload(&task).await;
    let again = h.orchestrator.finish_run(&task.id, "done twice").await.unwrap();
    assert_eq!(again.stage, Stage::WaitingApproval);
    assert_eq!(again.diff_summary, before.diff_summary);
    assert_eq!(h.agent_status(&agent_id).await, AgentStatus::Completed);

    let verified = h
        .orchestrator
        .move_column(&task.id, Stage::Verified, None)
        .await
        .unwrap();
    assert_eq!(verified.stage, Stage::Verified);
    let main_after = git(h.repo.path(), &["rev-parse", "main"]);

    let repeated = h.orchestrator.approve(&task.id).await.unwrap();
    assert_eq!(repeated.stage, Stage::Verified);
    assert_eq!(git(h.repo.path(), &["rev-parse", "main"]), main_after);
    assert_eq!(h.orchestrator.get_running_count(&h.project.id), 0);
}

#[tokio::test]
async fn rejection_resumes_the_same_agent_with_feedback() {
    let h = harness(1, ScriptedRunner::completing()).await;
    let task = h
        .task(
            "greeting",
            vec![
                write("hello.txt", "hi\n"),
                TurnPlan::Complete {
                    summary: "wrote greeting".into(),
                },
                write("hello.txt", "hello, world\n"),
            ],
        )
        .await;

    let agent_id = admitted(h.orchestrator.run(&h.project.id, &task.id).await.unwrap());
    h.finish(&agent_id).await;
    assert_eq!(h.reload(&task).await.stage, Stage::WaitingApproval);

    assert!(matches!(
        h.orchestrator.reject(&task.id, "   ").await,
        Err(Error::Validation(_))
    ));

    let rejected = h
        .orchestrator
        .reject(&task.id, "greet the whole world")
        .await
        .unwrap();
    assert_eq!(rejected.stage, Stage::InProgress);
    assert_eq!(rejected.rejection_count, 1);
    assert_eq!(h.events.of_type(kinds::TASK_REJECTED).len(), 1);

    let outcome = h.finish(&agent_id).await;
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    let task = h.reload(&task).await;
    assert_eq!(task.stage, Stage::WaitingApproval);
    assert_eq!(task.rejection_reasons, vec!["greet the whole world".to_string()]);
    let agent = h.store.agent(&agent_id).await.unwrap();
    assert!(agent.pending_feedback.is_empty());
    assert_eq!(agent.current_task_id.as_ref(), Some(&task.id));

    // Approving from another stage is refused.
    let other = h.task("untouched", vec![]).await;
    assert!(matches!(
        h.orchestrator.approve(&other.id).await,
        Err(Error::NotWaitingApproval { .. })
    ));

    h.orchestrator.approve(&task.id).await.unwrap();
    let content = std::fs::read_to_string(h.repo.path().join("hello.txt")).unwrap();
    assert_eq!(content, "hello, world\n");
}

#[tokio::test]
async fn denied_tool_call_does_not_abort_the_run() {
    let h = harness(1, ScriptedRunner::completing()).await;
    let task = h
        .task(
            "sneaky",
            vec![TurnPlan::ToolCalls {
                calls: vec![
                    ToolCall::shell("cat ../../../../../../etc/passwd"),
                    ToolCall::write("ok.txt", "fine\n"),
                ],
            }],
        )
        .await;

    let agent_id = admitted(h.orchestrator.run(&h.project.id, &task.id).await.unwrap());
    let outcome = h.finish(&agent_id).await;
    let RunOutcome::Completed { progress, .. } = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(progress.denials, 1);
    assert_eq!(progress.files_written, vec![PathBuf::from("ok.txt")]);

    let denied = h.events.of_type(kinds::TOOL_DENIED);
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].entity_id, agent_id.as_str());
    let audit = h.orchestrator.sandbox().audit_log();
    assert_eq!(audit.denials().len(), 1);
    assert_eq!(audit.denials()[0].agent_id.as_ref(), Some(&agent_id));

    let task = h.reload(&task).await;
    assert_eq!(task.stage, Stage::WaitingApproval);
    assert_eq!(task.diff_summary.unwrap().files.len(), 1);
}

#[tokio::test]
async fn turn_limit_pauses_and_resume_extends_budget() {
    let h = harness(1, ScriptedRunner::completing()).await;
    let task = h.task("long", busy_turns(3)).await;
    let mut agent = h
        .orchestrator
        .create_agent(&h.project.id, None)
        .await
        .unwrap();
    agent.max_turns = 2;
    h.store.put_agent(&agent).await.unwrap();

    admitted(h.orchestrator.start(&agent.id, &task.id).await.unwrap());
    let outcome = h.finish(&agent.id).await;
    let RunOutcome::Paused { reason, progress } = outcome else {
        panic!("expected pause, got {:?}", outcome);
    };
    assert_eq!(reason, TURN_LIMIT_EXCEEDED);
    assert_eq!(progress.turns, 2);
    assert_eq!(h.agent_status(&agent.id).await, AgentStatus::Paused);

    let resumed = h.orchestrator.resume(&agent.id, None).await.unwrap();
    let extension = h.orchestrator.config().agent.turn_extension;
    assert!(matches!(
        resumed,
        RunResult::Resumed { max_turns, .. } if max_turns == 2 + extension
    ));

    let outcome = h.finish(&agent.id).await;
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(h.reload(&task).await.stage, Stage::WaitingApproval);
}

#[tokio::test]
async fn failed_run_can_be_retried_in_place() {
    let h = harness(1, ScriptedRunner::completing()).await;
    let task = h
        .task(
            "flaky",
            vec![TurnPlan::Fail {
                reason: "tests exploded".into(),
            }],
        )
        .await;

    let agent_id = admitted(h.orchestrator.run(&h.project.id, &task.id).await.unwrap());
    let outcome = h.finish(&agent_id).await;
    assert!(matches!(outcome, RunOutcome::Failed { ref error, .. } if error == "tests exploded"));
    assert_eq!(h.agent_status(&agent_id).await, AgentStatus::Error);
    let failed = h.reload(&task).await;
    assert_eq!(failed.stage, Stage::InProgress);
    assert_eq!(failed.last_error.as_deref(), Some("tests exploded"));
    // The slot stays taken until a recovery path is chosen.
    assert_eq!(h.orchestrator.get_running_count(&h.project.id), 1);

    // Resume is only for paused agents.
    assert!(h.orchestrator.resume(&agent_id, None).await.is_err());

    let retried = h
        .orchestrator
        .retry(
            &agent_id,
            RetryOptions {
                extra_turns: 1,
                allowed_tools: None,
            },
        )
        .await
        .unwrap();
    assert!(matches!(retried, RunResult::Resumed { .. }));

    let outcome = h.finish(&agent_id).await;
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    let task = h.reload(&task).await;
    assert_eq!(task.stage, Stage::WaitingApproval);
    assert!(task.last_error.is_none());
    assert_eq!(task.worktree_id, failed.worktree_id);
}

#[tokio::test]
async fn pause_stop_and_restart_keep_the_worktree() {
    let runner = ScriptedRunner::completing().with_turn_delay(Duration::from_millis(50));
    let h = harness(1, runner).await;
    let task = h.task("slow", busy_turns(200)).await;

    let agent_id = admitted(h.orchestrator.run(&h.project.id, &task.id).await.unwrap());
    tokio::time::sleep(Duration::from_millis(120)).await;

    let paused = h.orchestrator.pause(&agent_id).await.unwrap();
    assert!(matches!(paused, RunResult::Paused { .. }));
    assert!(matches!(h.finish(&agent_id).await, RunOutcome::Paused { .. }));

    let stopped = h.orchestrator.stop(&agent_id).await.unwrap();
    assert!(matches!(stopped, RunResult::Stopped { task_id: Some(_), .. }));
    assert_eq!(h.agent_status(&agent_id).await, AgentStatus::Idle);
    assert_eq!(h.orchestrator.get_running_count(&h.project.id), 0);

    let kept = h.reload(&task).await;
    assert_eq!(kept.stage, Stage::InProgress);
    assert!(kept.agent_id.is_none());
    let worktree_id = kept.worktree_id.clone().unwrap();
    let worktree = h.store.worktree(&worktree_id).await.unwrap();
    assert!(worktree.path.exists());

    // A fresh start picks up the existing worktree.
    let result = h.orchestrator.start(&agent_id, &task.id).await.unwrap();
    let RunResult::Admitted {
        worktree_id: reused,
        ..
    } = result
    else {
        panic!("expected admission, got {:?}", result);
    };
    assert_eq!(reused, worktree_id);

    h.orchestrator.stop(&agent_id).await.unwrap();
    assert!(matches!(h.finish(&agent_id).await, RunOutcome::Stopped { .. }));
}

#[tokio::test]
async fn skip_cancels_running_and_queued_work() {
    let runner = ScriptedRunner::completing().with_turn_delay(Duration::from_millis(50));
    let h = harness(1, runner).await;
    let running = h.task("running", busy_turns(200)).await;
    let waiting = h.task("waiting", vec![]).await;

    let agent_id = admitted(h.orchestrator.run(&h.project.id, &running.id).await.unwrap());
    let queued = h.orchestrator.run(&h.project.id, &waiting.id).await.unwrap();
    assert!(matches!(queued, RunResult::Queued { .. }));

    // Cancelling the queued task only drops its queue entry.
    let skipped = h.orchestrator.skip(&waiting.id).await.unwrap();
    assert_eq!(skipped.stage, Stage::Backlog);
    assert!(h.orchestrator.get_queued_tasks(&h.project.id).is_empty());
    assert!(!h.orchestrator.cancel_queued(&waiting.id).await.unwrap());

    let worktree_id = h.reload(&running).await.worktree_id.unwrap();
    let path = h.store.worktree(&worktree_id).await.unwrap().path;

    let cancelled = h
        .orchestrator
        .move_column(&running.id, Stage::Backlog, None)
        .await
        .unwrap();
    assert_eq!(cancelled.stage, Stage::Backlog);
    assert!(cancelled.worktree_id.is_none());
    assert!(cancelled.agent_id.is_none());
    assert_eq!(cancelled.position, 1);
    assert!(!path.exists());
    assert_eq!(
        h.store.worktree(&worktree_id).await.unwrap().status,
        WorktreeStatus::Removed
    );
    assert_eq!(h.agent_status(&agent_id).await, AgentStatus::Idle);
    assert_eq!(h.orchestrator.get_running_count(&h.project.id), 0);
    assert!(matches!(h.finish(&agent_id).await, RunOutcome::Stopped { .. }));
}

#[tokio::test]
async fn conflicting_approval_keeps_task_in_review() {
    let h = harness(2, ScriptedRunner::completing()).await;
    let a = h.task("readme a", vec![write("README.md", "# A\n")]).await;
    let b = h.task("readme b", vec![write("README.md", "# B\n")]).await;

    let agent_a = admitted(h.orchestrator.run(&h.project.id, &a.id).await.unwrap());
    let agent_b = admitted(h.orchestrator.run(&h.project.id, &b.id).await.unwrap());
    h.finish(&agent_a).await;
    h.finish(&agent_b).await;

    h.orchestrator.approve(&a.id).await.unwrap();
    let main_after_a = git(h.repo.path(), &["rev-parse", "main"]);

    let err = h.orchestrator.approve(&b.id).await.unwrap_err();
    let Error::MergeConflict { files, .. } = err else {
        panic!("expected merge conflict, got {:?}", err);
    };
    assert_eq!(files, vec![PathBuf::from("README.md")]);
    assert_eq!(git(h.repo.path(), &["rev-parse", "main"]), main_after_a);

    let b = h.reload(&b).await;
    assert_eq!(b.stage, Stage::WaitingApproval);
    assert!(b.last_error.is_some());
    let worktree = h.store.worktree(b.worktree_id.as_ref().unwrap()).await.unwrap();
    assert_eq!(worktree.status, WorktreeStatus::Conflict);
    assert_eq!(h.orchestrator.get_running_count(&h.project.id), 1);
}

#[tokio::test]
async fn stale_worktrees_send_tasks_back_to_backlog() {
    let h = harness(1, ScriptedRunner::completing()).await;
    let task = h.task("forgotten", vec![]).await;

    let agent_id = admitted(h.orchestrator.run(&h.project.id, &task.id).await.unwrap());
    h.finish(&agent_id).await;
    let worktree_id = h.reload(&task).await.worktree_id.unwrap();

    let later = chrono::Utc::now() + chrono::Duration::days(30);
    let pruned = h.orchestrator.prune_stale(&h.project.id, later).await.unwrap();
    assert_eq!(pruned, vec![worktree_id]);

    let task = h.reload(&task).await;
    assert_eq!(task.stage, Stage::Backlog);
    assert!(task.worktree_id.is_none());
    assert!(task.last_error.is_some());
    assert_eq!(h.agent_status(&agent_id).await, AgentStatus::Idle);
    assert_eq!(h.orchestrator.get_running_count(&h.project.id), 0);
}

#[tokio::test]
async fn register_project_checks_base_branch() {
    let h = harness(1, ScriptedRunner::completing()).await;
    let err = h
        .orchestrator
        .register_project(Project::new("bad", h.repo.path(), "does-not-exist"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(h.store.list_projects().await.unwrap().len() == 1);
}

#[tokio::test]
async fn failed_worktree_setup_releases_the_slot_and_start_can_be_retried() {
    let h = harness(1, ScriptedRunner::completing()).await;
    let task = h.task("blocked", vec![write("done.txt", "ok\n")]).await;
    let blocker = h
        .root
        .path()
        .canonicalize()
        .unwrap()
        .join(h.project.id.short());
    std::fs::write(&blocker, "not a directory").unwrap();

    let err = h.orchestrator.run(&h.project.id, &task.id).await.unwrap_err();
    assert!(matches!(err, Error::WorktreeCreationFailed(_)), "{:?}", err);
    assert_eq!(h.orchestrator.get_running_count(&h.project.id), 0);

    let failed = h.reload(&task).await;
    assert_eq!(failed.stage, Stage::Backlog);
    assert!(failed.worktree_id.is_none());
    assert!(failed.last_error.is_some());
    assert!(h
        .events
        .of_type(kinds::WORKTREE_STATUS_CHANGED)
        .iter()
        .any(|e| e.payload["status"] == "error"));

    std::fs::remove_file(&blocker).unwrap();
    let agent = admitted(h.orchestrator.run(&h.project.id, &task.id).await.unwrap());
    assert_eq!(h.orchestrator.get_running_count(&h.project.id), 1);
    assert!(matches!(h.finish(&agent).await, RunOutcome::Completed { .. }));

    let task = h.reload(&task).await;
    assert_eq!(task.stage, Stage::WaitingApproval);
    assert!(task.last_error.is_none());
}

#[tokio::test]
async fn project_limit_cannot_drop_below_running_agents() {
    let h = harness(2, ScriptedRunner::completing()).await;
    for title in ["one", "two"] {
        let task = h.task(title, vec![]).await;
        let agent = admitted(h.orchestrator.run(&h.project.id, &task.id).await.unwrap());
        h.finish(&agent).await;
    }
    // Tasks in review keep their slots.
    assert_eq!(h.orchestrator.get_running_count(&h.project.id), 2);

    let err = h
        .orchestrator
        .set_project_limit(&h.project.id, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LimitExceeded { limit: 1, .. }), "{:?}", err);
    let project = h.store.project(&h.project.id).await.unwrap();
    assert_eq!(project.max_concurrent_agents, Some(2));

    h.orchestrator.set_project_limit(&h.project.id, 3).await.unwrap();
    assert_eq!(h.orchestrator.admission().limit(&h.project.id), 3);
}
