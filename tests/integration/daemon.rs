//! Integration tests for the daemon control plane. Most edit the queue file
//! only; one starts a real daemon process.

use std::fs;
use std::path::Path;
use std::process::{Child, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use predicates::prelude::*;
use tempfile::TempDir;

use crate::cli::{project, ralph_cmd, COMPLETING_AGENT, TWO_STORY_PRD};

#[allow(deprecated)]
fn spawn_daemon(root: &Path, cwd: &Path) -> Child {
    std::process::Command::new(assert_cmd::cargo::cargo_bin("ralph"))
        .args(["daemon", "start", "--workers", "1", "--root"])
        .arg(root)
        .current_dir(cwd)
        .env("RALPH__DAEMON__POLL_INTERVAL_MS", "100")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn daemon")
}

fn daemon_status(root: &Path) -> serde_json::Value {
    let output = ralph_cmd()
        .args(["daemon", "status", "--json", "--root"])
        .arg(root)
        .output()
        .expect("run status");
    serde_json::from_slice(&output.stdout).expect("status is JSON")
}

#[test]
fn test_submit_queue_cancel() {
    let dir = project(TWO_STORY_PRD, None);
    let backlog = dir.path().join("prd.json");

    ralph_cmd()
        .args(["daemon", "submit", "--priority", "high", "--root"])
        .arg(dir.path())
        .arg(&backlog)
        .assert()
        .success()
        .stdout(predicate::str::contains("task-1 queued (high)"));

    ralph_cmd()
        .args(["daemon", "queue", "--root"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("task-1"))
        .stdout(predicate::str::contains("queued"));

    ralph_cmd()
        .args(["daemon", "cancel", "task-1", "--root"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("removed from the queue"));

    ralph_cmd()
        .args(["daemon", "cancel", "task-1", "--root"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("already finished"));
}

#[test]
fn test_submit_rejects_invalid_backlog() {
    let dir = project("{ not json", None);

    ralph_cmd()
        .args(["daemon", "submit", "--root"])
        .arg(dir.path())
        .arg(dir.path().join("prd.json"))
        .assert()
        .code(1);
}

#[test]
fn test_status_and_pause() {
    let dir = project(TWO_STORY_PRD, None);

    ralph_cmd()
        .args(["daemon", "status", "--root"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::starts_with("daemon stopped"));

    ralph_cmd()
        .args(["daemon", "pause", "--root"])
        .arg(dir.path())
        .assert()
        .success();

    let output = ralph_cmd()
        .args(["daemon", "status", "--json", "--root"])
        .arg(dir.path())
        .output()
        .expect("run status");
    let status: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("status is JSON");
    assert_eq!(status["paused"], true);
    assert_eq!(status["running"], false);
}

#[test]
fn test_cancel_unknown_task_fails() {
    let dir = project(TWO_STORY_PRD, None);

    ralph_cmd()
        .args(["daemon", "cancel", "task-9", "--root"])
        .arg(dir.path())
        .assert()
        .code(1);
}

#[test]
fn test_daemon_started_elsewhere_runs_relative_submission() {
    let dir = project(TWO_STORY_PRD, Some(COMPLETING_AGENT));

    // Submitted from the project directory with the default root
    ralph_cmd()
        .current_dir(dir.path())
        .args(["daemon", "submit", "prd.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("task-1 queued"));

    let elsewhere = TempDir::new().expect("temp dir");
    let mut daemon = spawn_daemon(dir.path(), elsewhere.path());

    let deadline = Instant::now() + Duration::from_secs(60);
    let finished = loop {
        let status = daemon_status(dir.path());
        if status["done"] == 1 {
            break true;
        }
        if Instant::now() > deadline {
            break false;
        }
        thread::sleep(Duration::from_millis(100));
    };

    ralph_cmd()
        .args(["daemon", "stop", "--root"])
        .arg(dir.path())
        .assert()
        .success();
    let stopped = (0..100).any(|_| {
        thread::sleep(Duration::from_millis(100));
        matches!(daemon.try_wait(), Ok(Some(_)))
    });
    if !stopped {
        let _ = daemon.kill();
    }

    assert!(finished, "daemon did not finish the task");
    assert!(stopped, "daemon did not stop");
    ralph_cmd()
        .args(["daemon", "queue", "--root"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("all stories complete"));
    let updated = fs::read_to_string(dir.path().join("prd.json")).expect("read backlog");
    assert!(!updated.contains(r#""passes": false"#));
}
