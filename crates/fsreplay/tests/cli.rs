use std::path::Path;
use std::process::Output;

use fsreplay_trace::Trace;

fn run_fsreplay(args: &[&str], cwd: &Path) -> Output {
    std::process::Command::new(env!("CARGO_BIN_EXE_fsreplay"))
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("spawn fsreplay")
}

fn report_line(stdout: &str) -> serde_json::Value {
    let line = stdout
        .lines()
        .rev()
        .find(|line| line.starts_with('{'))
        .expect("report line");
    serde_json::from_str(line).expect("report json")
}

#[test]
fn full_run_succeeds_and_writes_artifacts() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ws = tmp.path().join("ws");

    let out = run_fsreplay(&[ws.to_str().expect("utf-8 workspace")], tmp.path());
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );

    let text = std::fs::read_to_string(tmp.path().join("trace.csv")).expect("trace.csv");
    let trace = Trace::try_parse(&text).expect("parse trace");
    assert_eq!(13, trace.len());
    assert!(!trace.has_errors());

    let report = report_line(&String::from_utf8_lossy(&out.stdout));
    assert_eq!(Some(true), report["ok"].as_bool());
    assert_eq!(Some(13), report["success_count"].as_u64());
    assert_eq!(Some(0), report["failure_count"].as_u64());
    assert_eq!(Some("trace.csv"), report["trace_path"].as_str());
}

#[test]
fn missing_argument_is_a_usage_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let out = run_fsreplay(&[], tmp.path());
    assert_eq!(Some(2), out.status.code());
}

#[test]
fn failed_operations_exit_with_code_one() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ws = tmp.path().join("ws");
    // A plain file where the workload expects to mkdir: the run keeps going,
    // records the failures and reports them through the exit code.
    std::fs::create_dir(&ws).expect("pre-create workspace");
    std::fs::write(ws.join("foo"), b"in the way").expect("plant file");

    let out = run_fsreplay(&[ws.to_str().expect("utf-8 workspace")], tmp.path());
    assert_eq!(Some(1), out.status.code());

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("[WARNING]"), "stderr: {stderr}");

    let text = std::fs::read_to_string(tmp.path().join("trace.csv")).expect("trace.csv");
    let trace = Trace::try_parse(&text).expect("parse trace");
    assert_eq!(13, trace.len());
    assert!(trace.has_errors());

    let report = report_line(&String::from_utf8_lossy(&out.stdout));
    assert_eq!(Some(false), report["ok"].as_bool());
}

#[test]
fn trace_path_override_is_honored() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ws = tmp.path().join("ws");
    let custom = tmp.path().join("out/run.csv");
    std::fs::create_dir(tmp.path().join("out")).expect("out dir");

    let out = run_fsreplay(
        &[
            ws.to_str().expect("utf-8 workspace"),
            "--trace-path",
            custom.to_str().expect("utf-8 trace path"),
        ],
        tmp.path(),
    );
    assert!(out.status.success());

    let text = std::fs::read_to_string(&custom).expect("custom trace");
    assert!(Trace::try_parse(&text).is_ok());
    assert!(!tmp.path().join("trace.csv").exists());
}
