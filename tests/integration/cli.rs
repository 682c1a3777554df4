//! Integration tests for the single-backlog commands.
//!
//! The agent is a shell one-liner that flips every `passes` flag in the
//! backlog named by `RALPH_BACKLOG`, and the gate list is empty, so no
//! external tooling is needed.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

pub const TWO_STORY_PRD: &str = r#"{
    "project": "CliTestProject",
    "branchName": "test/cli",
    "description": "Backlog for CLI integration tests",
    "userStories": [
        {
            "id": "US-001",
            "title": "Add the parser",
            "description": "Parse the input format",
            "acceptanceCriteria": ["Parses valid input"],
            "priority": 1,
            "passes": false
        },
        {
            "id": "US-002",
            "title": "Add the printer",
            "description": "Print the parsed value",
            "acceptanceCriteria": ["Prints parsed input"],
            "priority": 2,
            "passes": false,
            "dependsOn": ["US-001"]
        }
    ]
}"#;

const CYCLIC_PRD: &str = r#"{
    "project": "Cyclic",
    "branchName": "test/cyclic",
    "userStories": [
        {"id": "A", "title": "A", "priority": 1, "passes": false, "dependsOn": ["B"]},
        {"id": "B", "title": "B", "priority": 2, "passes": false, "dependsOn": ["A"]}
    ]
}"#;

pub const COMPLETING_AGENT: &str = r#"
[agent]
command = '''sed -i 's/"passes": false/"passes": true/' "$RALPH_BACKLOG"'''

[gates]
gates = []
"#;

const IDLE_AGENT: &str = r#"
[agent]
command = "true"

[gates]
gates = []
"#;

/// Get a Command instance for the ralph binary
#[allow(deprecated)]
pub fn ralph_cmd() -> Command {
    Command::cargo_bin("ralph").expect("Failed to find ralph binary")
}

/// Project directory with `prd.json` and an optional `.ralph/config.toml`.
pub fn project(prd: &str, config: Option<&str>) -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    fs::write(dir.path().join("prd.json"), prd).expect("Failed to write prd.json");
    if let Some(config) = config {
        let state = dir.path().join(".ralph");
        fs::create_dir_all(&state).expect("Failed to create .ralph");
        fs::write(state.join("config.toml"), config).expect("Failed to write config");
    }
    dir
}

fn read_prd(root: &Path) -> serde_json::Value {
    let raw = fs::read_to_string(root.join("prd.json")).expect("Failed to read prd.json");
    serde_json::from_str(&raw).expect("prd.json is valid JSON")
}

#[test]
fn test_run_completes_backlog() {
    let dir = project(TWO_STORY_PRD, Some(COMPLETING_AGENT));

    ralph_cmd()
        .args(["run", "--non-interactive", "--root"])
        .arg(dir.path())
        .assert()
        .code(0)
        .stdout(predicate::str::contains("all stories complete"));

    let prd = read_prd(dir.path());
    let stories = prd["userStories"].as_array().expect("stories");
    assert!(stories.iter().all(|s| s["passes"] == true));
    assert!(dir.path().join(".ralph").join("checkpoints").exists());
    assert!(dir.path().join(".ralph").join("archive").exists());
}

#[test]
fn test_budget_exhausted_exits_partial() {
    let dir = project(TWO_STORY_PRD, Some(IDLE_AGENT));

    ralph_cmd()
        .args(["run", "--non-interactive", "--max-iterations", "2", "--root"])
        .arg(dir.path())
        .assert()
        .code(2)
        .stdout(predicate::str::contains("iteration budget exhausted"))
        .stdout(predicate::str::contains("remaining: US-001, US-002"));
}

#[test]
fn test_cyclic_backlog_is_rejected() {
    let dir = project(CYCLIC_PRD, Some(IDLE_AGENT));

    ralph_cmd()
        .args(["run", "--non-interactive", "--root"])
        .arg(dir.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn test_status_reports_progress() {
    let dir = project(TWO_STORY_PRD, None);

    ralph_cmd()
        .args(["status", "--root"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("0/2 stories pass"))
        .stdout(predicate::str::contains("next: US-001"));
}

#[test]
fn test_status_json() {
    let dir = project(TWO_STORY_PRD, None);

    let output = ralph_cmd()
        .args(["status", "--json", "--root"])
        .arg(dir.path())
        .output()
        .expect("run status");
    assert!(output.status.success());
    let status: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("status is JSON");
    assert_eq!(status["passed"], 0);
    assert_eq!(status["total"], 2);
    assert_eq!(status["next_story"], "US-001");
}

#[test]
fn test_split_list_when_empty() {
    let dir = project(TWO_STORY_PRD, None);

    ralph_cmd()
        .args(["split", "list", "--root"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("No open split proposals"));
}

#[test]
fn test_split_approve_unknown_proposal_fails() {
    let dir = project(TWO_STORY_PRD, None);

    ralph_cmd()
        .args(["split", "approve", "split-missing", "--root"])
        .arg(dir.path())
        .assert()
        .code(1);
}

#[test]
fn test_init_config_refuses_to_overwrite() {
    let dir = TempDir::new().expect("Failed to create temp dir");

    ralph_cmd()
        .args(["init-config", "--root"])
        .arg(dir.path())
        .assert()
        .success();
    let written = fs::read_to_string(dir.path().join(".ralph").join("config.toml"))
        .expect("config written");
    assert!(written.contains("[engine]"));
    assert!(written.contains("max_iterations"));

    ralph_cmd()
        .args(["init-config", "--root"])
        .arg(dir.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_env_override_is_validated() {
    let dir = project(TWO_STORY_PRD, Some(IDLE_AGENT));

    ralph_cmd()
        .env("RALPH__ENGINE__MAX_ITERATIONS", "0")
        .args(["run", "--non-interactive", "--root"])
        .arg(dir.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("max_iterations"));
}

#[test]
fn test_parallel_runs_each_backlog() {
    let dir = project(TWO_STORY_PRD, Some(COMPLETING_AGENT));
    let second = dir.path().join("second");
    fs::create_dir_all(&second).expect("mkdir");
    fs::write(
        second.join("prd.json"),
        TWO_STORY_PRD.replace("test/cli", "test/cli-second"),
    )
    .expect("write second backlog");

    ralph_cmd()
        .args(["parallel", "--max-workers", "2", "--root"])
        .arg(dir.path())
        .arg(dir.path().join("prd.json"))
        .arg(second.join("prd.json"))
        .assert()
        .code(0)
        .stdout(predicate::str::contains("completed"));
}

#[test]
fn test_parallel_with_relative_paths_from_project_dir() {
    let dir = project(TWO_STORY_PRD, Some(COMPLETING_AGENT));
    let backlogs = dir.path().join("backlogs");
    fs::create_dir_all(&backlogs).expect("mkdir");
    fs::write(
        backlogs.join("a.json"),
        TWO_STORY_PRD.replace("test/cli", "test/cli-a"),
    )
    .expect("write backlog");

    ralph_cmd()
        .current_dir(dir.path())
        .args(["parallel", "backlogs/a.json"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("all stories complete"));

    let updated = fs::read_to_string(backlogs.join("a.json")).expect("read backlog");
    assert!(!updated.contains(r#""passes": false"#));
}
