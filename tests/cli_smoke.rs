use assert_cmd::cargo::cargo_bin_cmd;
use hindsight::config::TraceConfig;
use hindsight::instrument::{ModelWrapper, ToolWrapper};
use hindsight::recorder::{RunSpec, TraceRecorder};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

static TEST_GUARD: Mutex<()> = Mutex::new(());

fn guard() -> std::sync::MutexGuard<'static, ()> {
    TEST_GUARD.lock().unwrap_or_else(PoisonError::into_inner)
}

fn args(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn record_run(dir: &Path) -> PathBuf {
    let mut config = TraceConfig::strict();
    config.recorder.base_dir = dir.to_path_buf();
    let recorder = TraceRecorder::init(
        RunSpec {
            tools: vec!["search".to_string()],
            ..RunSpec::default()
        },
        &config,
    )
    .expect("init");
    let run_dir = recorder.run_dir();
    ModelWrapper::new(&recorder)
        .call(args(json!({"p": "hi"})), |_| Ok(json!("use search")))
        .expect("model");
    ToolWrapper::new(&recorder, "search", 0)
        .call(args(json!({"q": 1})), |_, _| Ok(json!("R")))
        .expect("tool");
    recorder.stop("success").expect("stop");
    run_dir
}

#[test]
fn help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("hindsight");
    cmd.arg("--help");
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");
    assert!(stdout.contains("inspect"));
    assert!(stdout.contains("replay"));
    assert!(stdout.contains("analyze"));
    assert!(stdout.contains("test"));
}

#[test]
fn inspect_valid_run_exits_zero() {
    let _guard = guard();
    let temp = tempfile::tempdir().expect("tempdir");
    let run_dir = record_run(temp.path());

    let mut cmd = cargo_bin_cmd!("hindsight");
    cmd.arg("inspect").arg(&run_dir);
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");
    assert!(stdout.contains("status=success"));
    assert!(stdout.contains("steps=2"));
}

#[test]
fn inspect_missing_run_exits_nonzero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("hindsight");
    cmd.arg("inspect").arg(temp.path().join("no_such_run"));
    cmd.assert().failure();
}

#[test]
fn replay_clean_run_exits_zero() {
    let _guard = guard();
    let temp = tempfile::tempdir().expect("tempdir");
    let run_dir = record_run(temp.path());

    let mut cmd = cargo_bin_cmd!("hindsight");
    cmd.arg("replay").arg(&run_dir);
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");
    assert!(stdout.contains("no divergences"));
}

#[test]
fn analyze_prints_diagnostics_and_exits_zero() {
    let _guard = guard();
    let temp = tempfile::tempdir().expect("tempdir");
    let run_dir = record_run(temp.path());

    let mut cmd = cargo_bin_cmd!("hindsight");
    cmd.arg("analyze").arg(&run_dir);
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");
    assert!(stdout.contains("check retry_ceiling: pass"));
    assert!(stdout.contains("root cause: none"));
}

#[test]
fn test_subcommand_applies_assertion_file() {
    let _guard = guard();
    let temp = tempfile::tempdir().expect("tempdir");
    let run_dir = record_run(temp.path());

    let passing = temp.path().join("passing.toml");
    std::fs::write(
        &passing,
        r#"
[[assert]]
kind = "status"
equals = "success"

[[assert]]
kind = "phase_sequence"
phases = ["reason", "tool"]

[[assert]]
kind = "no_errors"
"#,
    )
    .expect("write assertions");

    let mut cmd = cargo_bin_cmd!("hindsight");
    cmd.arg("test").arg(&run_dir).arg(&passing);
    cmd.assert().success();

    let failing = temp.path().join("failing.toml");
    std::fs::write(
        &failing,
        r#"
[[assert]]
kind = "status"
equals = "failure"
"#,
    )
    .expect("write assertions");

    let mut cmd = cargo_bin_cmd!("hindsight");
    cmd.arg("test").arg(&run_dir).arg(&failing);
    cmd.assert().failure();
}

#[test]
fn test_subcommand_without_assertions_runs_builtin_checks() {
    let _guard = guard();
    let temp = tempfile::tempdir().expect("tempdir");
    let run_dir = record_run(temp.path());

    let mut cmd = cargo_bin_cmd!("hindsight");
    cmd.arg("test").arg(&run_dir);
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");
    assert!(stdout.contains("check retry_ceiling: pass"));
    assert!(stdout.contains("check tool_ordering: pass"));
}
