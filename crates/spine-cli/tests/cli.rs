//! CLI command integration tests.
//! Each test uses a temp directory via SPINE_DATA_DIR for full isolation.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

fn spine_cmd(data_dir: &TempDir) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("spine").unwrap();
    cmd.env("SPINE_DATA_DIR", data_dir.path())
        .env_remove("SPINE_CONFIG")
        .env_remove("SPINE_EMIT_ENABLED")
        .env_remove("SPINE_EMIT_SINK")
        .env_remove("SPINE_EMIT_PATH")
        .env_remove("RUST_LOG");
    cmd
}

fn record(id: &str, event_type: &str, secs: u32, payload: &str) -> String {
    format!(
        r#"{{"event_id":"{id}","event_type":"{event_type}","occurred_at":"2026-03-01T10:{:02}:{:02}Z","session_id":"s1","schema_version":"1.0","payload":{payload}}}"#,
        secs / 60,
        secs % 60
    )
}

/// Session start plus two first-time tools.
fn sample_lines() -> Vec<String> {
    vec![
        record("e1", "session_started", 0, "{}"),
        record("e2", "analysis_started", 5, r#"{"tool_id":"cam"}"#),
        record("e3", "analysis_started", 30, r#"{"tool_id":"drill"}"#),
    ]
}

fn write_log(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, lines.join("\n")).unwrap();
    path
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

// --- replay ---

#[test]
fn replay_reports_moments() {
    let dir = TempDir::new().unwrap();
    let log = write_log(dir.path(), "s1.jsonl", &sample_lines());

    let output = spine_cmd(&dir).arg("replay").arg(&log).output().unwrap();
    assert!(output.status.success());

    let report = stdout_json(&output);
    assert_eq!(report["mode"], "M0");
    assert_eq!(report["events_total"], 3);
    assert_eq!(report["events_accepted"], 3);
    assert_eq!(report["sessions"]["s1"]["moment_counts"]["FIRST_SIGNAL"], 2);
}

#[test]
fn replay_accepts_json_array() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("s1.json");
    std::fs::write(&path, format!("[{}]", sample_lines().join(",\n"))).unwrap();

    let output = spine_cmd(&dir)
        .args(["replay", "--mode", "M1"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["mode"], "M1");
    assert_eq!(report["events_accepted"], 3);
}

#[test]
fn replay_glob_input() {
    let dir = TempDir::new().unwrap();
    let lines = sample_lines();
    write_log(dir.path(), "a.jsonl", &lines[..2]);
    write_log(dir.path(), "b.jsonl", &lines[2..]);

    let pattern = format!("{}/*.jsonl", dir.path().display());
    let output = spine_cmd(&dir).args(["replay", &pattern]).output().unwrap();
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["events_total"], 3);
}

#[test]
fn replay_missing_file_fails_but_reports_the_rest() {
    let dir = TempDir::new().unwrap();
    let log = write_log(dir.path(), "s1.jsonl", &sample_lines());
    let missing = dir.path().join("missing.jsonl");

    let output = spine_cmd(&dir)
        .arg("replay")
        .arg(&log)
        .arg(&missing)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(stdout_json(&output)["events_total"], 3);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not found"), "stderr: {stderr}");
    assert!(stderr.contains("missing.jsonl"), "stderr: {stderr}");
}

#[test]
fn replay_malformed_file_names_line() {
    let dir = TempDir::new().unwrap();
    let mut lines = sample_lines();
    lines.insert(1, "{not json".to_string());
    let log = write_log(dir.path(), "bad.jsonl", &lines);

    spine_cmd(&dir)
        .arg("replay")
        .arg(&log)
        .assert()
        .failure()
        .stderr(predicate::str::contains("bad.jsonl"))
        .stderr(predicate::str::contains("line 2"));
}

#[test]
fn replay_schema_violation_is_skipped_not_fatal() {
    let dir = TempDir::new().unwrap();
    let mut lines = sample_lines();
    lines.push(
        r#"{"event_id":"e9","event_type":"session_ended","occurred_at":"2026-03-01T10:05:00Z","session_id":"s1","schema_version":"2.0"}"#
            .to_string(),
    );
    let log = write_log(dir.path(), "s1.jsonl", &lines);

    let output = spine_cmd(&dir).arg("replay").arg(&log).output().unwrap();
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["events_total"], 4);
    assert_eq!(report["events_accepted"], 3);
    assert_eq!(report["rejected"][0]["event_id"], "e9");
    assert_eq!(report["rejected"][0]["error"], "schema");
}

#[test]
fn replay_summary_only_drops_detail() {
    let dir = TempDir::new().unwrap();
    let log = write_log(dir.path(), "s1.jsonl", &sample_lines());

    let output = spine_cmd(&dir)
        .args(["replay", "--summary-only", "--verbose"])
        .arg(&log)
        .output()
        .unwrap();
    assert!(output.status.success());
    let session = &stdout_json(&output)["sessions"]["s1"];
    assert_eq!(session["moment_counts"]["FIRST_SIGNAL"], 2);
    for detail in ["moments", "decisions", "trail", "uwsm_audit"] {
        let empty = session
            .get(detail)
            .is_none_or(|v| v.as_array().is_some_and(|a| a.is_empty()));
        assert!(empty, "{detail} should be stripped");
    }
}

#[test]
fn replay_verbose_includes_trail() {
    let dir = TempDir::new().unwrap();
    let log = write_log(dir.path(), "s1.jsonl", &sample_lines());

    let output = spine_cmd(&dir)
        .args(["replay", "--verbose"])
        .arg(&log)
        .output()
        .unwrap();
    assert!(output.status.success());
    let trail = stdout_json(&output)["sessions"]["s1"]["trail"].clone();
    assert_eq!(trail.as_array().map(Vec::len), Some(3));
}

#[test]
fn replay_rejects_unknown_mode() {
    let dir = TempDir::new().unwrap();
    let log = write_log(dir.path(), "s1.jsonl", &sample_lines());
    spine_cmd(&dir)
        .args(["replay", "--mode", "M9"])
        .arg(&log)
        .assert()
        .failure()
        .stderr(predicate::str::contains("M9"));
}

#[test]
fn replay_invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    let log = write_log(dir.path(), "s1.jsonl", &sample_lines());
    let config = dir.path().join("spine.toml");
    std::fs::write(&config, "[uwsm]\nsample_gain = 3.0\n").unwrap();

    spine_cmd(&dir)
        .arg("--config")
        .arg(&config)
        .arg("replay")
        .arg(&log)
        .assert()
        .failure()
        .stderr(predicate::str::contains("sample_gain"));
}

// --- scoreboard ---

fn replay_to_file(dir: &TempDir) -> PathBuf {
    let log = write_log(dir.path(), "s1.jsonl", &sample_lines());
    let output = spine_cmd(dir).arg("replay").arg(&log).output().unwrap();
    assert!(output.status.success());
    let report = dir.path().join("report.json");
    std::fs::write(&report, &output.stdout).unwrap();
    report
}

#[test]
fn scoreboard_text() {
    let dir = TempDir::new().unwrap();
    let report = replay_to_file(&dir);

    spine_cmd(&dir)
        .arg("scoreboard")
        .arg(&report)
        .arg(&report)
        .assert()
        .success()
        .stdout(predicate::str::contains("reports:       2"))
        .stdout(predicate::str::contains("sessions:      2"))
        .stdout(predicate::str::contains("FIRST_SIGNAL"));
}

#[test]
fn scoreboard_json() {
    let dir = TempDir::new().unwrap();
    let report = replay_to_file(&dir);

    let output = spine_cmd(&dir)
        .args(["scoreboard", "--json"])
        .arg(&report)
        .output()
        .unwrap();
    assert!(output.status.success());
    let board = stdout_json(&output);
    assert_eq!(board["sessions"], 1);
    assert_eq!(board["moment_distribution"]["FIRST_SIGNAL"], 2);
}

#[test]
fn scoreboard_rejects_non_report() {
    let dir = TempDir::new().unwrap();
    let bogus = dir.path().join("bogus.json");
    std::fs::write(&bogus, "{\"hello\": 1}").unwrap();
    spine_cmd(&dir)
        .arg("scoreboard")
        .arg(&bogus)
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a replay report"));
}

#[test]
fn scoreboard_rejects_other_report_major() {
    let dir = TempDir::new().unwrap();
    let report = replay_to_file(&dir);
    let mut json: Value = serde_json::from_slice(&std::fs::read(&report).unwrap()).unwrap();
    json["schema_version"] = Value::from("2.0");
    let future = dir.path().join("future.json");
    std::fs::write(&future, serde_json::to_vec(&json).unwrap()).unwrap();

    spine_cmd(&dir)
        .arg("scoreboard")
        .arg(&report)
        .arg(&future)
        .assert()
        .failure()
        .stderr(predicate::str::contains("schema error"))
        .stderr(predicate::str::contains("future.json"))
        .stdout(predicate::str::is_empty());

    // a newer minor of the same major is still accepted
    json["schema_version"] = Value::from("1.7");
    std::fs::write(&future, serde_json::to_vec(&json).unwrap()).unwrap();
    spine_cmd(&dir).arg("scoreboard").arg(&future).assert().success();
}

// --- emit ---

#[test]
fn emit_is_inert_by_default() {
    let dir = TempDir::new().unwrap();
    spine_cmd(&dir)
        .current_dir(dir.path())
        .args(["emit", "--session", "s1", "--event-type", "session_started"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    assert!(!dir.path().join("spine-events.jsonl").exists());
}

#[test]
fn emit_file_sink_then_replay() {
    let dir = TempDir::new().unwrap();
    let sink = dir.path().join("out").join("events.jsonl");

    for (event_type, payload) in [
        ("session_started", "{}"),
        ("analysis_started", r#"{"tool_id":"cam"}"#),
    ] {
        spine_cmd(&dir)
            .env("SPINE_EMIT_ENABLED", "1")
            .env("SPINE_EMIT_SINK", "file")
            .env("SPINE_EMIT_PATH", &sink)
            .args(["emit", "--session", "live", "--event-type", event_type])
            .args(["--payload", payload])
            .assert()
            .success();
    }

    let text = std::fs::read_to_string(&sink).unwrap();
    assert_eq!(text.lines().count(), 2);

    let output = spine_cmd(&dir).arg("replay").arg(&sink).output().unwrap();
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["sessions"]["live"]["moment_counts"]["FIRST_SIGNAL"], 1);
}

#[test]
fn emit_stdout_sink() {
    let dir = TempDir::new().unwrap();
    let output = spine_cmd(&dir)
        .env("SPINE_EMIT_ENABLED", "true")
        .env("SPINE_EMIT_SINK", "stdout")
        .args(["emit", "--session", "s1", "--event-type", "session_ended"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let event = stdout_json(&output);
    assert_eq!(event["session_id"], "s1");
    assert_eq!(event["event_type"], "session_ended");
    assert_eq!(event["schema_version"], "1.0");
}

#[test]
fn emit_rejects_bad_payload() {
    let dir = TempDir::new().unwrap();
    spine_cmd(&dir)
        .args(["emit", "--session", "s1", "--event-type", "user_action"])
        .args(["--payload", "[1, 2]"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("JSON object"));

    spine_cmd(&dir)
        .args(["emit", "--session", "s1", "--event-type", "user_action"])
        .args(["--payload", r#"{"action":"juggle"}"#])
        .assert()
        .failure()
        .stderr(predicate::str::contains("validation"));
}

// --- profiles ---

#[test]
fn profile_list_fresh_db() {
    let dir = TempDir::new().unwrap();
    spine_cmd(&dir)
        .args(["profile", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("profiles:   0"));
    assert!(dir.path().join("profiles.db").exists());
}

#[test]
fn replay_saves_profiles() {
    let dir = TempDir::new().unwrap();
    let log = write_log(dir.path(), "s1.jsonl", &sample_lines());
    let db = dir.path().join("profiles.db");

    spine_cmd(&dir)
        .arg("replay")
        .arg(&log)
        .arg("--profile-db")
        .arg(&db)
        .assert()
        .success();

    spine_cmd(&dir)
        .args(["profile", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("profiles:   1"))
        .stdout(predicate::str::contains("s1"));

    let output = spine_cmd(&dir)
        .args(["profile", "show", "s1"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let profile = stdout_json(&output);
    assert_eq!(profile["session_id"], "s1");
    assert!(profile["dimensions"]["automation_comfort"]["value"].is_number());

    spine_cmd(&dir)
        .args(["profile", "prune", "--retention-days", "30"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pruned:     0"))
        .stdout(predicate::str::contains("remaining:  1"));
}

#[test]
fn profile_show_unknown_session() {
    let dir = TempDir::new().unwrap();
    spine_cmd(&dir)
        .args(["profile", "show", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ghost"));
}
