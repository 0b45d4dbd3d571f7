//! CLI Integration Tests
//!
//! These tests verify the `stormweaver` binary end-to-end: config loading,
//! overrides, exit codes, outcome files and offline checking.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

fn cli_cmd() -> Command {
    Command::cargo_bin("stormweaver").expect("Failed to find stormweaver binary")
}

fn scenarios_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../scenarios")
}

/// Write a sim-backed config plus script into `dir`.
fn write_workload(dir: &Path, script: &str) -> PathBuf {
    std::fs::write(dir.join("workload.lua"), script).unwrap();
    let config = dir.join("workload.json");
    std::fs::write(
        &config,
        r#"{
            "name": "cli-test",
            "workers": 2,
            "iterations": 5,
            "seed": 7,
            "scripts": ["workload.lua"],
            "backends": [{ "name": "main", "driver": "sim" }]
        }"#,
    )
    .unwrap();
    config
}

const BALANCED: &str = r#"
invariant{ name = "clean", kind = "no_errors" }
function step(ctx)
    return { sql = "INSERT INTO t VALUES (?)", params = { ctx.random(1, 100) }, tag = "insert" }
end
"#;

const UNBALANCED: &str = r#"
invariant{ name = "inserted == selected", kind = "balance", left = "insert", right = "select" }
function step(ctx)
    return { sql = "INSERT INTO t VALUES (1)", tag = "insert" }
end
"#;

// ============================================================================
// Run Command Tests
// ============================================================================

#[test]
fn test_dry_run_demo_passes() {
    cli_cmd()
        .arg("run")
        .arg(scenarios_dir().join("bank-dry-run.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Result: PASSED"))
        .stdout(predicate::str::contains("seed=42"));
}

#[test]
fn test_run_writes_outcomes_and_report() {
    let temp = TempDir::new().unwrap();
    let config = write_workload(temp.path(), BALANCED);
    let outcomes = temp.path().join("outcomes.jsonl");
    let report = temp.path().join("report.md");

    cli_cmd()
        .arg("run")
        .arg(&config)
        .arg("--output")
        .arg(&outcomes)
        .arg("--report")
        .arg(&report)
        .assert()
        .success()
        .stdout(predicate::str::contains("Actions: 10"));

    let lines = std::fs::read_to_string(&outcomes).unwrap();
    assert_eq!(lines.lines().count(), 10);
    let report = std::fs::read_to_string(&report).unwrap();
    assert!(report.contains("# Stormweaver run report: cli-test"));
    assert!(report.contains("- [x] `clean`"));
}

#[test]
fn test_overrides_apply() {
    let temp = TempDir::new().unwrap();
    let config = write_workload(temp.path(), BALANCED);

    cli_cmd()
        .arg("run")
        .arg(&config)
        .args(["--workers", "3", "--iterations", "4", "--seed", "99"])
        .assert()
        .success()
        .stdout(predicate::str::contains("seed=99"))
        .stdout(predicate::str::contains("worker 3"))
        .stdout(predicate::str::contains("Actions: 12"));
}

#[test]
fn test_json_summary() {
    let temp = TempDir::new().unwrap();
    let config = write_workload(temp.path(), BALANCED);

    let output = cli_cmd().arg("run").arg(&config).arg("--json").output().unwrap();
    assert!(output.status.success());

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["name"], "cli-test");
    assert_eq!(summary["seed"], 7);
    assert_eq!(summary["workers"].as_array().unwrap().len(), 2);
}

#[test]
fn test_violation_exits_with_one() {
    let temp = TempDir::new().unwrap();
    let config = write_workload(temp.path(), UNBALANCED);

    cli_cmd()
        .arg("run")
        .arg(&config)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("VIOLATION inserted == selected"))
        .stdout(predicate::str::contains("Result: FAILED"));
}

#[test]
fn test_script_error_exits_with_one() {
    let temp = TempDir::new().unwrap();
    let config = write_workload(temp.path(), "function step(ctx) error('broken') end");

    cli_cmd().arg("run").arg(&config).assert().code(1);
}

#[test]
fn test_missing_config_exits_with_two() {
    cli_cmd()
        .arg("run")
        .arg("does-not-exist.json")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Failed to read config"));
}

#[test]
fn test_invalid_config_exits_with_two() {
    let temp = TempDir::new().unwrap();
    let config = write_workload(temp.path(), BALANCED);
    std::fs::write(&config, r#"{ "workers": 0, "scripts": ["workload.lua"], "backends": [] }"#)
        .unwrap();

    cli_cmd().arg("run").arg(&config).assert().code(2);
}

// ============================================================================
// Check Command Tests
// ============================================================================

#[test]
fn test_check_recorded_run() {
    let temp = TempDir::new().unwrap();
    let config = write_workload(temp.path(), UNBALANCED);
    let outcomes = temp.path().join("outcomes.jsonl");

    cli_cmd()
        .arg("run")
        .arg(&config)
        .arg("--output")
        .arg(&outcomes)
        .assert()
        .code(1);

    // Same verdict offline.
    cli_cmd()
        .arg("check")
        .arg(&outcomes)
        .arg("--config")
        .arg(&config)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Outcomes: 10"))
        .stdout(predicate::str::contains("VIOLATION inserted == selected"));

    // Without the script only sequence integrity is checked.
    cli_cmd()
        .arg("check")
        .arg(&outcomes)
        .assert()
        .success()
        .stdout(predicate::str::contains("Result: PASSED"));
}

#[test]
fn test_check_rejects_corrupt_stream() {
    let temp = TempDir::new().unwrap();
    let outcomes = temp.path().join("outcomes.jsonl");
    std::fs::write(&outcomes, "not json\n").unwrap();

    cli_cmd()
        .arg("check")
        .arg(&outcomes)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Failed to read outcomes"));
}
