#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

/// Runs git in `dir`, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Creates a repository with one commit on `main`.
pub fn create_temp_git_repo() -> TempDir {
    let temp_dir = TempDir::new().expect("failed to create temp dir");

    git(temp_dir.path(), &["init"]);
    git(temp_dir.path(), &["symbolic-ref", "HEAD", "refs/heads/main"]);

    // Configure git user for commits
    git(temp_dir.path(), &["config", "user.email", "test@test.com"]);
    git(temp_dir.path(), &["config", "user.name", "Test User"]);

    // Create initial commit (required for worktrees)
    std::fs::write(temp_dir.path().join("README.md"), "# Test Repo\n")
        .expect("failed to write README");
    git(temp_dir.path(), &["add", "."]);
    git(temp_dir.path(), &["commit", "-m", "Initial commit"]);

    temp_dir
}

/// Writes `content` to `file` in `dir` and commits it.
pub fn commit_file(dir: &Path, file: &str, content: &str, message: &str) {
    std::fs::write(dir.join(file), content).expect("failed to write file");
    git(dir, &["add", file]);
    git(dir, &["commit", "-m", message]);
}
