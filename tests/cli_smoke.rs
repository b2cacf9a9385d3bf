//! End-to-end checks of the `switchboard` binary. Every test points
//! `SWITCHBOARD_DATA_DIR` at its own tempdir so runs stay hermetic.

use assert_cmd::Command;
use tempfile::TempDir;

fn switchboard(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("switchboard").expect("binary builds");
    cmd.env("SWITCHBOARD_DATA_DIR", data_dir.path());
    cmd.env_remove("SWITCHBOARD_LOG");
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().expect("command runs");
    String::from_utf8(output.stdout).expect("utf-8 stdout")
}

#[test]
fn status_on_a_fresh_data_dir_reports_the_default_profile() {
    let dir = TempDir::new().unwrap();
    let mut cmd = switchboard(&dir);
    cmd.arg("status");
    let out = stdout_of(&mut cmd);
    assert!(out.contains("Active profile : sqlite"), "{out}");
    assert!(out.contains("No switch transactions recorded."), "{out}");
    switchboard(&dir).arg("status").assert().success();
}

#[test]
fn status_json_is_parseable() {
    let dir = TempDir::new().unwrap();
    let mut cmd = switchboard(&dir);
    cmd.args(["status", "--json"]);
    let out = stdout_of(&mut cmd);
    let payload: serde_json::Value = serde_json::from_str(&out).expect("json payload");
    assert_eq!(payload["active"]["profile"], "sqlite");
    assert!(payload["transactions"].as_array().unwrap().is_empty());
}

#[test]
fn validate_sqlite_succeeds_and_reports_the_missing_schema() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("probe.sqlite3");
    let mut cmd = switchboard(&dir);
    cmd.args([
        "validate",
        "sqlite",
        "--set",
        &format!("SQLITE_PATH={}", db_path.display()),
    ]);
    let output = cmd.output().unwrap();
    assert!(output.status.success(), "{output:?}");
    let out = String::from_utf8(output.stdout).unwrap();
    assert!(out.contains("Reachable : yes"), "{out}");
    assert!(out.contains("Schema    : absent"), "{out}");
}

#[test]
fn validate_json_carries_the_probe_fields() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("probe.sqlite3");
    let mut cmd = switchboard(&dir);
    cmd.args([
        "validate",
        "sqlite",
        "--json",
        "--set",
        &format!("SQLITE_PATH={}", db_path.display()),
    ]);
    let out = stdout_of(&mut cmd);
    let report: serde_json::Value = serde_json::from_str(&out).expect("json report");
    assert_eq!(report["profile"], "sqlite");
    assert_eq!(report["reachable"], true);
    assert_eq!(report["attempts"], 1);
}

#[test]
fn validate_mysql_without_settings_reports_the_missing_keys() {
    let dir = TempDir::new().unwrap();
    let mut cmd = switchboard(&dir);
    cmd.args(["validate", "mysql"]);
    for key in ["MYSQL_HOST", "MYSQL_USER", "MYSQL_PASSWORD", "MYSQL_DATABASE"] {
        cmd.env_remove(key);
    }
    let output = cmd.output().unwrap();
    assert!(!output.status.success());
    let err = String::from_utf8(output.stderr).unwrap();
    assert!(err.contains("Missing settings for profile mysql"), "{err}");
}

#[test]
fn unknown_profile_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut cmd = switchboard(&dir);
    cmd.args(["validate", "postgres"]);
    let output = cmd.output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn rollback_with_no_transactions_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    let mut cmd = switchboard(&dir);
    cmd.arg("rollback");
    let output = cmd.output().unwrap();
    assert!(!output.status.success());
    let err = String::from_utf8(output.stderr).unwrap();
    assert!(err.contains("No switch transactions"), "{err}");
}

#[test]
fn malformed_set_pair_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut cmd = switchboard(&dir);
    cmd.args(["validate", "sqlite", "--set", "SQLITE_PATH"]);
    let output = cmd.output().unwrap();
    assert!(!output.status.success());
    let err = String::from_utf8(output.stderr).unwrap();
    assert!(err.contains("KEY=VALUE"), "{err}");
}
