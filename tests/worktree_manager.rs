//! Worktree manager against real git repositories.

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use autopilot::config::WorktreeConfig;
use autopilot::exec::LocalBackend;
use autopilot::model::{Project, Task, WorktreeStatus};
use autopilot::store::{InMemoryStore, Store, StoreExt};
use autopilot::worktree::{MergeOutcome, WorktreeManager};
use autopilot::Error;
use chrono::{Duration, Utc};
use common::{commit_file, create_temp_git_repo, git};
use tempfile::TempDir;

struct Fixture {
    repo: TempDir,
    _root: TempDir,
    root: PathBuf,
    store: Arc<InMemoryStore>,
    manager: WorktreeManager,
    project: Project,
}

async fn fixture() -> Fixture {
    let repo = create_temp_git_repo();
    let root_dir = TempDir::new().expect("failed to create temp dir");
    let root = root_dir.path().canonicalize().expect("canonical root");

    let store = Arc::new(InMemoryStore::new());
    let config = WorktreeConfig {
        root: Some(root.clone()),
        ..WorktreeConfig::default()
    };
    let manager = WorktreeManager::new(Arc::new(LocalBackend::new()), store.clone(), config);

    let project = Project::new("demo", repo.path(), "main");
    store.put_project(&project).await.unwrap();

    Fixture {
        repo,
        _root: root_dir,
        root,
        store,
        manager,
        project,
    }
}

async fn new_task(f: &Fixture, title: &str) -> Task {
    let task = Task::new(f.project.id.clone(), title);
    f.store.put_task(&task).await.unwrap();
    task
}

fn head(dir: &Path, rev: &str) -> String {
    git(dir, &["rev-parse", rev])
}

#[tokio::test]
async fn create_makes_active_worktree_on_new_branch() {
    let f = fixture().await;
    let task = new_task(&f, "add feature").await;

    let wt = f.manager.create(&f.project, &task).await.unwrap();

    assert_eq!(wt.status, WorktreeStatus::Active);
    assert!(wt.path.starts_with(&f.root));
    assert!(wt.path.join("README.md").exists());
    assert_eq!(wt.branch, f.manager.branch_name(&task));
    assert_eq!(head(&wt.path, "HEAD"), head(f.repo.path(), "main"));

    let listed = f.manager.list_git_worktrees(&f.project).await.unwrap();
    assert!(listed.iter().any(|l| l.branch.as_deref() == Some(wt.branch.as_str())));
}

#[tokio::test]
async fn second_create_for_same_task_fails_with_branch_exists() {
    let f = fixture().await;
    let task = new_task(&f, "add feature").await;
    f.manager.create(&f.project, &task).await.unwrap();

    let err = f.manager.create(&f.project, &task).await.unwrap_err();
    assert!(matches!(err, Error::BranchExists(_)));
}

#[tokio::test]
async fn failed_create_frees_branch_and_path_for_the_next_attempt() {
    let f = fixture().await;
    let task = new_task(&f, "add feature").await;
    let blocker = f.root.join(f.project.id.short());
    std::fs::write(&blocker, "not a directory").unwrap();

    let err = f.manager.create(&f.project, &task).await.unwrap_err();
    assert!(matches!(err, Error::WorktreeCreationFailed(_)), "{:?}", err);

    let records = f.store.list_worktrees(&f.project.id, None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, WorktreeStatus::Removed);
    assert!(records[0].error.is_some());
    assert!(f.manager.find_live(&task).await.unwrap().is_none());

    std::fs::remove_file(&blocker).unwrap();
    let wt = f.manager.create(&f.project, &task).await.unwrap();
    assert_eq!(wt.status, WorktreeStatus::Active);
    assert_eq!(wt.branch, records[0].branch);
}

#[tokio::test]
async fn commit_and_diff_summary_track_changes() {
    let f = fixture().await;
    let task = new_task(&f, "add feature").await;
    let wt = f.manager.create(&f.project, &task).await.unwrap();

    assert_eq!(f.manager.commit(&wt.id, "noop").await.unwrap(), None);

    std::fs::write(wt.path.join("feature.txt"), "one\ntwo\n").unwrap();
    let report = f.manager.status(&wt.id).await.unwrap();
    assert!(report.is_dirty());
    assert_eq!(
        f.store.worktree(&wt.id).await.unwrap().status,
        WorktreeStatus::Dirty
    );

    let hash = f.manager.commit(&wt.id, "add feature").await.unwrap();
    assert!(hash.is_some());
    assert_eq!(
        f.store.worktree(&wt.id).await.unwrap().status,
        WorktreeStatus::Active
    );

    let diff = f.manager.diff_summary(&wt.id).await.unwrap();
    assert_eq!(diff.files.len(), 1);
    assert_eq!(diff.files[0].path, PathBuf::from("feature.txt"));
    assert_eq!(diff.additions, 2);
}

#[tokio::test]
async fn merge_fast_forwards_and_is_idempotent() {
    let f = fixture().await;
    let task = new_task(&f, "add feature").await;
    let wt = f.manager.create(&f.project, &task).await.unwrap();

    std::fs::write(wt.path.join("feature.txt"), "feature\n").unwrap();
    f.manager.commit(&wt.id, "add feature").await.unwrap();

    let outcome = f.manager.merge(&wt.id).await.unwrap();
    assert!(matches!(outcome, MergeOutcome::FastForward { .. }));
    assert_eq!(head(f.repo.path(), "main"), head(&wt.path, "HEAD"));
    // The checked-out base branch follows the ref.
    assert!(f.repo.path().join("feature.txt").exists());

    let again = f.manager.merge(&wt.id).await.unwrap();
    assert_eq!(again, MergeOutcome::AlreadyMerged);
}

#[tokio::test]
async fn diverged_branches_get_a_merge_commit() {
    let f = fixture().await;
    let task = new_task(&f, "add feature").await;
    let wt = f.manager.create(&f.project, &task).await.unwrap();

    std::fs::write(wt.path.join("feature.txt"), "feature\n").unwrap();
    f.manager.commit(&wt.id, "add feature").await.unwrap();
    commit_file(f.repo.path(), "other.txt", "other\n", "unrelated work");

    let outcome = f.manager.merge(&wt.id).await.unwrap();
    let MergeOutcome::Merged { commit } = outcome else {
        panic!("expected merge commit, got {:?}", outcome);
    };
    assert_eq!(head(f.repo.path(), "main"), commit);
    assert!(f.repo.path().join("feature.txt").exists());
    assert!(f.repo.path().join("other.txt").exists());
    assert_eq!(
        f.store.worktree(&wt.id).await.unwrap().status,
        WorktreeStatus::Active
    );
}

#[tokio::test]
async fn conflict_leaves_base_untouched_until_resolved() {
    let f = fixture().await;
    let task = new_task(&f, "rewrite readme").await;
    let wt = f.manager.create(&f.project, &task).await.unwrap();

    std::fs::write(wt.path.join("README.md"), "# From the task\n").unwrap();
    f.manager.commit(&wt.id, "task readme").await.unwrap();
    commit_file(f.repo.path(), "README.md", "# From main\n", "main readme");
    let main_before = head(f.repo.path(), "main");

    let outcome = f.manager.merge(&wt.id).await.unwrap();
    let MergeOutcome::Conflict { files } = outcome else {
        panic!("expected conflict, got {:?}", outcome);
    };
    assert_eq!(files, vec![PathBuf::from("README.md")]);
    assert_eq!(head(f.repo.path(), "main"), main_before);
    assert_eq!(
        f.store.worktree(&wt.id).await.unwrap().status,
        WorktreeStatus::Conflict
    );

    // Conflicted worktrees are not removable without force.
    assert!(f.manager.remove(&wt.id, false).await.is_err());
    assert!(matches!(
        f.manager.resolve_conflict(&wt.id).await,
        Err(Error::MergeConflict { .. })
    ));

    git(&wt.path, &["merge", "-X", "ours", "--no-edit", "main"]);
    let resolved = f.manager.resolve_conflict(&wt.id).await.unwrap();
    assert_eq!(resolved.status, WorktreeStatus::Active);

    let outcome = f.manager.merge(&wt.id).await.unwrap();
    assert!(matches!(outcome, MergeOutcome::FastForward { .. }));
    let readme = std::fs::read_to_string(f.repo.path().join("README.md")).unwrap();
    assert_eq!(readme, "# From the task\n");
}

#[tokio::test]
async fn remove_deletes_directory_and_branch() {
    let f = fixture().await;
    let task = new_task(&f, "add feature").await;
    let wt = f.manager.create(&f.project, &task).await.unwrap();

    f.manager.remove(&wt.id, false).await.unwrap();

    let stored = f.store.worktree(&wt.id).await.unwrap();
    assert_eq!(stored.status, WorktreeStatus::Removed);
    assert!(!wt.path.exists());
    let branches = git(f.repo.path(), &["branch", "--list", &wt.branch]);
    assert!(branches.is_empty());

    // Already removed.
    f.manager.remove(&wt.id, false).await.unwrap();
}

#[tokio::test]
async fn dirty_worktree_needs_force_to_remove() {
    let f = fixture().await;
    let task = new_task(&f, "add feature").await;
    let wt = f.manager.create(&f.project, &task).await.unwrap();

    std::fs::write(wt.path.join("scratch.txt"), "wip\n").unwrap();
    f.manager.status(&wt.id).await.unwrap();

    assert!(f.manager.remove(&wt.id, false).await.is_err());
    f.manager.remove(&wt.id, true).await.unwrap();
    assert!(!wt.path.exists());
}

#[tokio::test]
async fn prune_stale_removes_idle_active_worktrees() {
    let f = fixture().await;
    let stale_task = new_task(&f, "old").await;
    let fresh_task = new_task(&f, "new").await;
    let stale = f.manager.create(&f.project, &stale_task).await.unwrap();
    let fresh = f.manager.create(&f.project, &fresh_task).await.unwrap();

    let mut record = f.store.worktree(&stale.id).await.unwrap();
    record.last_activity = Utc::now() - Duration::days(10);
    f.store.put_worktree(&record).await.unwrap();

    let found = f
        .manager
        .stale_worktrees(&f.project.id, Utc::now())
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, stale.id);

    let pruned = f.manager.prune_stale(&f.project, Utc::now()).await.unwrap();
    assert_eq!(pruned.len(), 1);
    assert!(!stale.path.exists());
    assert!(fresh.path.exists());
    assert_eq!(
        f.store.worktree(&fresh.id).await.unwrap().status,
        WorktreeStatus::Active
    );
}

#[tokio::test]
async fn unrecorded_worktrees_under_root_are_orphans() {
    let f = fixture().await;
    let task = new_task(&f, "tracked").await;
    f.manager.create(&f.project, &task).await.unwrap();

    let orphan_path = f.root.join("leftover");
    git(
        f.repo.path(),
        &[
            "worktree",
            "add",
            "-b",
            "autopilot/leftover",
            orphan_path.to_str().unwrap(),
            "main",
        ],
    );

    let orphans = f.manager.orphaned_worktrees(&f.project).await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].path, orphan_path);

    f.manager
        .remove_orphan(f.repo.path(), &orphans[0])
        .await
        .unwrap();
    assert!(!orphan_path.exists());
    assert!(f.manager.orphaned_worktrees(&f.project).await.unwrap().is_empty());
}
