//! CLI smoke tests for `ctabs`.
//!
//! Each test runs the binary against a temp HOME so the user's own config
//! file never leaks in.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn ctabs(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ctabs").expect("ctabs binary");
    cmd.env_remove("CTABS_CONFIG")
        .env_remove("RUST_LOG")
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join(".config"));
    cmd
}

fn scenario_path(name: &str) -> String {
    format!("{}/scenarios/{name}", env!("CARGO_MANIFEST_DIR"))
}

fn stdout_lines(output: &std::process::Output) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect()
}

// =============================================================================
// config
// =============================================================================

#[test]
fn config_show_prints_defaults() {
    let home = TempDir::new().unwrap();
    ctabs(&home)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[throttle]"))
        .stdout(predicate::str::contains("min_delay_ms = 100"))
        .stdout(predicate::str::contains("network_prediction_enabled = true"));
}

#[test]
fn config_show_reads_explicit_file_as_json() {
    let home = TempDir::new().unwrap();
    let path = home.path().join("custom.toml");
    std::fs::write(&path, "[throttle]\nmin_delay_ms = 300\nmax_delay_ms = 900\n").unwrap();

    let output = ctabs(&home)
        .args(["--config", path.to_str().unwrap(), "config", "show", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let config: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(config["throttle"]["min_delay_ms"], 300);
    assert_eq!(config["throttle"]["max_delay_ms"], 900);
}

#[test]
fn config_env_var_is_honoured() {
    let home = TempDir::new().unwrap();
    let path = home.path().join("env.toml");
    std::fs::write(&path, "[connection]\nevent_buffer = 4\n").unwrap();

    ctabs(&home)
        .env("CTABS_CONFIG", &path)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("env.toml"));
}

#[test]
fn config_path_without_file_uses_defaults() {
    let home = TempDir::new().unwrap();
    ctabs(&home)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("using defaults"));
}

#[test]
fn invalid_config_fails_with_remediation() {
    let home = TempDir::new().unwrap();
    let path = home.path().join("bad.toml");
    std::fs::write(&path, "[throttle]\nmin_delay_ms = 5000\nmax_delay_ms = 10\n").unwrap();

    ctabs(&home)
        .args(["config", "check", path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"))
        .stderr(predicate::str::contains("To fix:"));
}

#[test]
fn missing_explicit_config_fails() {
    let home = TempDir::new().unwrap();
    ctabs(&home)
        .args(["--config", "/nonexistent/ctabs.toml", "config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("/nonexistent/ctabs.toml"));
}

// =============================================================================
// replay
// =============================================================================

#[test]
fn replay_bundled_scenario() {
    let home = TempDir::new().unwrap();
    let output = ctabs(&home)
        .args(["--log-level", "warn", "replay", "--summary"])
        .arg(scenario_path("speculate_and_navigate.json"))
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let lines = stdout_lines(&output);
    let step = |op: &str| {
        lines
            .iter()
            .find(|line| line["op"] == op)
            .unwrap_or_else(|| panic!("no {op} step"))
    };

    assert_eq!(step("may_launch_url")["result"]["accepted"], true);
    let navigate = &step("navigate")["result"];
    assert_eq!(navigate["disposition"], "promoted");
    assert_eq!(navigate["classification"]["outcome"], "good_prediction");
    assert_eq!(step("post_message")["result"], "SUCCESS");

    let summary = lines.last().unwrap();
    assert_eq!(summary["summary"]["steps"], 15);
    assert_eq!(summary["summary"]["clients"], 1);
    let final_snapshot = &lines[14];
    assert_eq!(final_snapshot["op"], "snapshot");
    assert_eq!(final_snapshot["result"]["sessions"], 0);
}

#[test]
fn replay_reads_stdin() {
    let home = TempDir::new().unwrap();
    let scenario = r#"{"steps": [
        {"op": "bind", "client": "a", "uid": 1, "package": "com.a"},
        {"op": "new_session", "client": "a", "token": "t"},
        {"op": "new_session", "client": "a", "token": "t"}
    ]}"#;
    let output = ctabs(&home)
        .args(["replay", "-"])
        .write_stdin(scenario)
        .output()
        .unwrap();
    assert!(output.status.success());
    let lines = stdout_lines(&output);
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[1]["result"], true);
    assert_eq!(lines[2]["result"], false);
}

#[test]
fn replay_rejects_malformed_scenario() {
    let home = TempDir::new().unwrap();
    ctabs(&home)
        .args(["replay", "-"])
        .write_stdin(r#"{"steps": [{"op": "bind"}]}"#)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid scenario document"));
}

#[test]
fn replay_missing_file_fails() {
    let home = TempDir::new().unwrap();
    ctabs(&home)
        .args(["replay", "/nonexistent/scenario.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read scenario"));
}
