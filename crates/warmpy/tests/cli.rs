//! End-to-end tests for the warmpy CLI.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn warmpy() -> Command {
    let mut cmd = Command::cargo_bin("warmpy").expect("warmpy binary");
    cmd.env("WARMPY_WORKER_PATH", env!("CARGO_BIN_EXE_warmpy-worker"));
    cmd.env_remove("WARMPY_MAX_EXECUTIONS");
    cmd.env_remove("WARMPY_TIMEOUT_SECS");
    cmd
}

#[test]
fn test_help_lists_commands() {
    warmpy()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("bench"));
}

#[test]
fn test_run_prints_bindings() {
    warmpy()
        .args(["run", "x = 40 + 2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"x\": 42"))
        .stdout(predicate::str::contains("\"workerPid\""));
}

#[test]
fn test_run_fragment_error_exits_nonzero() {
    warmpy()
        .args(["run", "raise ValueError('nope')"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("ValueError: nope"))
        .stdout(predicate::str::contains("traceback"));
}

#[test]
fn test_run_reads_stdin() {
    warmpy()
        .arg("run")
        .write_stdin("print('from stdin')")
        .assert()
        .success()
        .stdout(predicate::str::contains("from stdin"));
}

#[test]
fn test_run_reads_file() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("fragment.py");
    fs::write(&path, "total = sum(range(10))\nprint(total)\n").expect("write fragment");

    warmpy()
        .arg("run")
        .arg("--file")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"total\": 45"));
}

#[test]
fn test_run_passes_input() {
    warmpy()
        .args(["run", "line = input()", "--input", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"line\": \"hello\""));
}

#[test]
fn test_run_timeout_reports_hint() {
    warmpy()
        .args(["run", "import time; time.sleep(30)", "--timeout", "0.5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("timed out"))
        .stderr(predicate::str::contains("hint"));
}

#[test]
fn test_run_missing_worker() {
    warmpy()
        .args(["run", "pass", "--worker", "/nonexistent/warmpy-worker"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("worker unavailable"));
}

#[test]
fn test_bench_json_summary() {
    warmpy()
        .args(["bench", "x = 1", "-n", "5", "--warmup", "1", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"iterations\": 5"))
        .stdout(predicate::str::contains("\"p99Ms\""));
}

#[test]
fn test_bench_text_summary() {
    warmpy()
        .args(["bench", "pass", "-n", "3", "--warmup", "0", "--max-executions", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Throughput:"))
        .stdout(predicate::str::contains("Restarts:    1"));
}
