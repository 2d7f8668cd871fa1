// CLI integration tests for local signal/wait flows.
use std::process::Command;
use std::time::{Duration, Instant};

use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_pollflag");
    Command::new(exe)
}

fn parse_json(value: &[u8]) -> Value {
    serde_json::from_slice(value).expect("valid json")
}

#[test]
fn signal_peek_wait_flow() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("flags");
    let dir = dir.to_str().unwrap();

    let peek = cmd()
        .args(["--dir", dir, "peek", "orders"])
        .output()
        .expect("peek");
    assert!(peek.status.success());
    assert_eq!(parse_json(&peek.stdout)["pending"], false);

    let signal = cmd()
        .args(["--dir", dir, "signal", "orders"])
        .output()
        .expect("signal");
    assert!(signal.status.success());
    let signal_json = parse_json(&signal.stdout);
    assert_eq!(signal_json["channel"], "orders");
    assert_eq!(signal_json["signaled"], true);

    let peek = cmd()
        .args(["--dir", dir, "peek", "orders"])
        .output()
        .expect("peek");
    assert_eq!(parse_json(&peek.stdout)["pending"], true);

    let started = Instant::now();
    let wait = cmd()
        .args(["--dir", dir, "wait", "orders", "--timeout-secs", "5"])
        .output()
        .expect("wait");
    assert!(wait.status.success());
    assert!(started.elapsed() < Duration::from_secs(3));
    let wait_json = parse_json(&wait.stdout);
    assert_eq!(wait_json["channel"], "orders");
    assert_eq!(wait_json["signaled"], true);

    let peek = cmd()
        .args(["--dir", dir, "peek", "orders"])
        .output()
        .expect("peek");
    assert_eq!(parse_json(&peek.stdout)["pending"], false);
}

#[test]
fn wait_times_out_without_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().unwrap();

    let started = Instant::now();
    let wait = cmd()
        .args([
            "--dir",
            dir,
            "wait",
            "quiet",
            "--timeout-secs",
            "2",
            "--interval-secs",
            "1",
        ])
        .output()
        .expect("wait");
    let elapsed = started.elapsed();
    assert!(wait.status.success());
    assert!(elapsed >= Duration::from_secs(2), "returned early: {elapsed:?}");
    assert_eq!(parse_json(&wait.stdout)["signaled"], false);
}

#[test]
fn clear_drops_pending_signal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().unwrap();

    let signal = cmd()
        .args(["--dir", dir, "signal", "orders"])
        .output()
        .expect("signal");
    assert!(signal.status.success());

    let clear = cmd()
        .args(["--dir", dir, "clear", "orders"])
        .output()
        .expect("clear");
    assert!(clear.status.success());
    assert_eq!(parse_json(&clear.stdout)["cleared"], true);

    let wait = cmd()
        .args(["--dir", dir, "wait", "orders", "--timeout-secs", "1"])
        .output()
        .expect("wait");
    assert_eq!(parse_json(&wait.stdout)["signaled"], false);
}

#[test]
fn expired_signal_is_not_reported() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().unwrap();

    let signal = cmd()
        .args(["--dir", dir, "signal", "orders", "--ttl-secs", "1"])
        .output()
        .expect("signal");
    assert!(signal.status.success());
    std::thread::sleep(Duration::from_millis(1100));

    let peek = cmd()
        .args(["--dir", dir, "peek", "orders"])
        .output()
        .expect("peek");
    assert_eq!(parse_json(&peek.stdout)["pending"], false);
}

#[test]
fn invalid_channel_is_usage_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().unwrap();

    let output = cmd()
        .args(["--dir", dir, "signal", "../escape"])
        .output()
        .expect("signal");
    assert_eq!(output.status.code(), Some(2));
    let err = parse_json(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
    assert!(output.stdout.is_empty());
}

#[test]
fn zero_timeout_is_usage_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().to_str().unwrap();

    let output = cmd()
        .args(["--dir", dir, "wait", "orders", "--timeout-secs", "0"])
        .output()
        .expect("wait");
    assert_eq!(output.status.code(), Some(2));
    let err = parse_json(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
    assert_eq!(err["error"]["channel"], "orders");
}

#[test]
fn corrupt_record_reports_corrupt_kind() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    std::fs::write(dir.join("orders.flag"), b"garbage").expect("write");

    let output = cmd()
        .args(["--dir", dir.to_str().unwrap(), "peek", "orders"])
        .output()
        .expect("peek");
    assert_eq!(output.status.code(), Some(7));
    let err = parse_json(&output.stderr);
    assert_eq!(err["error"]["kind"], "Corrupt");
    assert!(err["error"]["hint"].as_str().unwrap().contains("pollflag clear"));
}

#[test]
fn unknown_flag_reports_usage_hint() {
    let output = cmd()
        .args(["wait", "orders", "--bogus"])
        .output()
        .expect("wait");
    assert_eq!(output.status.code(), Some(2));
    let err = parse_json(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
    assert_eq!(err["error"]["hint"], "Try `pollflag wait --help`.");
}

#[test]
fn serve_check_reports_effective_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = cmd()
        .args([
            "--dir",
            temp.path().to_str().unwrap(),
            "serve",
            "--bind",
            "127.0.0.1:9799",
            "check",
        ])
        .output()
        .expect("serve check");
    assert!(output.status.success());
    let report = parse_json(&output.stdout);
    assert_eq!(report["check"]["status"], "valid");
    assert_eq!(report["check"]["listen"], "127.0.0.1:9799");
    assert_eq!(report["check"]["timing"]["wait_timeout_secs"], 15);
    assert_eq!(report["check"]["timing"]["flag_ttl_secs"], 300);
}

#[test]
fn serve_check_rejects_public_bind_without_token_file() {
    let output = cmd()
        .args(["serve", "--bind", "0.0.0.0:9799", "check"])
        .output()
        .expect("serve check");
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(parse_json(&output.stderr)["error"]["kind"], "Usage");
}

#[test]
fn version_reports_package_version() {
    let output = cmd().arg("version").output().expect("version");
    assert!(output.status.success());
    let value = parse_json(&output.stdout);
    assert_eq!(value["name"], "pollflag");
    assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
}
