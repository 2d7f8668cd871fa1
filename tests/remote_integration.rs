//! Purpose: End-to-end tests for the HTTP long-poll server and remote client.
//! Exports: None (integration test module).
//! Role: Validate signal/wait/peek/clear and the new-order endpoint across TCP and processes.
//! Invariants: Uses loopback-only server with temp store directory.
//! Invariants: Server wait timeouts are shortened so tests stay bounded.
//! Invariants: Server processes are cleaned up on drop.

use pollflag::api::{ErrorKind, NEW_ORDER_CHANNEL, RemoteClient, WaitOptions, WaitOutcome};
use serde_json::Value;
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, Instant};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

static SERVER_LOCK: Mutex<()> = Mutex::new(());

struct TestServer {
    child: Child,
    base_url: String,
    token: Option<String>,
    _server_guard: MutexGuard<'static, ()>,
}

impl TestServer {
    fn start(store_dir: &std::path::Path) -> TestResult<Self> {
        Self::start_with_options(store_dir, None, &[])
    }

    fn start_with_token(store_dir: &std::path::Path, token: &str) -> TestResult<Self> {
        Self::start_with_options(store_dir, Some(token), &[])
    }

    fn start_with_options(
        store_dir: &std::path::Path,
        token: Option<&str>,
        extra_args: &[&str],
    ) -> TestResult<Self> {
        let guard = SERVER_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let mut last_err: Option<Box<dyn std::error::Error>> = None;
        for _attempt in 0..3 {
            let port = pick_port()?;
            let bind = format!("127.0.0.1:{port}");
            let base_url = format!("http://{bind}");

            let mut command = Command::new(env!("CARGO_BIN_EXE_pollflag"));
            command
                .arg("--dir")
                .arg(store_dir)
                .arg("serve")
                .arg("--bind")
                .arg(&bind)
                .arg("--wait-timeout-secs")
                .arg("2")
                .args(extra_args)
                .stdout(Stdio::null())
                .stderr(Stdio::piped());
            if let Some(token) = token {
                command.arg("--token").arg(token);
            }
            let mut child = command.spawn()?;

            match wait_for_server(&mut child, bind.parse()?) {
                Ok(()) => {
                    return Ok(Self {
                        child,
                        base_url,
                        token: token.map(str::to_string),
                        _server_guard: guard,
                    });
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_err = Some(err);
                    sleep(Duration::from_millis(30));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| "server failed to start".into()))
    }

    fn client(&self) -> TestResult<RemoteClient> {
        Ok(RemoteClient::new(self.base_url.clone())?)
    }

    fn client_with_token(&self) -> TestResult<RemoteClient> {
        let mut client = RemoteClient::new(self.base_url.clone())?;
        if let Some(token) = &self.token {
            client = client.with_token(token.clone());
        }
        Ok(client)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_pollflag"))
}

#[test]
fn new_order_endpoint_reports_once_then_times_out() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(temp_dir.path())?;
    let client = server.client()?;

    client.order_created(Some(1042))?;
    let started = Instant::now();
    assert!(client.check_new_orders()?);
    assert!(started.elapsed() < Duration::from_secs(1));

    let started = Instant::now();
    assert!(!client.check_new_orders()?);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "returned late: {elapsed:?}");
    Ok(())
}

#[test]
fn signal_during_wait_is_observed() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(temp_dir.path())?;
    let client = server.client()?;

    let signaler = client.clone();
    let handle = std::thread::spawn(move || {
        sleep(Duration::from_millis(400));
        signaler.signal("refunds")
    });

    let outcome = client.wait("refunds", WaitOptions::from_secs(5, 1))?;
    handle.join().map_err(|_| "signal thread panicked")??;
    assert_eq!(outcome, WaitOutcome::Signaled);
    assert!(!client.pending("refunds")?);
    Ok(())
}

#[test]
fn peek_and_clear_round_trip() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(temp_dir.path())?;
    let client = server.client()?;

    assert!(!client.pending("inventory")?);
    client.signal("inventory")?;
    assert!(client.pending("inventory")?);
    assert!(client.pending("inventory")?);
    client.clear("inventory")?;
    assert!(!client.pending("inventory")?);
    assert_eq!(
        client.wait("inventory", WaitOptions::from_secs(1, 1))?,
        WaitOutcome::TimedOut
    );
    Ok(())
}

#[test]
fn cli_signal_is_consumed_by_server() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(temp_dir.path())?;
    let client = server.client()?;

    let output = cli()
        .arg("--dir")
        .arg(temp_dir.path())
        .args(["signal", NEW_ORDER_CHANNEL])
        .output()?;
    assert!(output.status.success());

    assert!(client.check_new_orders()?);

    let peek = cli()
        .arg("--dir")
        .arg(temp_dir.path())
        .args(["peek", NEW_ORDER_CHANNEL])
        .output()?;
    assert!(peek.status.success());
    let value: Value = serde_json::from_slice(&peek.stdout)?;
    assert_eq!(value["pending"], false);
    Ok(())
}

#[test]
fn concurrent_waiters_share_one_signal() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(temp_dir.path())?;
    let client = server.client()?;

    let waiters = (0..4)
        .map(|_| {
            let client = client.clone();
            std::thread::spawn(move || client.wait("orders", WaitOptions::from_secs(3, 1)))
        })
        .collect::<Vec<_>>();

    sleep(Duration::from_millis(300));
    client.signal("orders")?;

    let mut signaled = 0;
    for waiter in waiters {
        let outcome = waiter.join().map_err(|_| "waiter panicked")??;
        if outcome.is_signaled() {
            signaled += 1;
        }
    }
    assert_eq!(signaled, 1);
    Ok(())
}

#[test]
fn remote_errors_keep_their_kind() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(temp_dir.path())?;
    let client = server.client()?;

    let err = client
        .wait("orders", WaitOptions::from_secs(600, 1))
        .expect_err("timeout above server max");
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert_eq!(err.channel(), Some("orders"));

    let err = client.signal("../escape").expect_err("invalid channel");
    assert_eq!(err.kind(), ErrorKind::Usage);
    Ok(())
}

#[test]
fn token_is_required_when_configured() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start_with_token(temp_dir.path(), "devtoken")?;

    let err = server
        .client()?
        .signal("orders")
        .expect_err("missing token");
    assert_eq!(err.kind(), ErrorKind::Permission);

    let client = server.client_with_token()?;
    client.signal("orders")?;
    assert!(client.pending("orders")?);
    Ok(())
}

#[test]
fn sigterm_releases_open_waits_and_exits_cleanly() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let mut server = TestServer::start(temp_dir.path())?;
    let client = server.client()?;

    let waiter = std::thread::spawn(move || client.wait("orders", WaitOptions::from_secs(30, 1)));
    sleep(Duration::from_millis(300));

    let started = Instant::now();
    let pid = libc::pid_t::try_from(server.child.id())?;
    // SAFETY: `pid` names the server child this test spawned and still owns.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    assert_eq!(rc, 0);

    let status = loop {
        if let Some(status) = server.child.try_wait()? {
            break status;
        }
        if started.elapsed() > Duration::from_secs(5) {
            return Err("server did not exit after SIGTERM".into());
        }
        sleep(Duration::from_millis(20));
    };
    assert!(status.success(), "server exit status: {status}");

    let outcome = waiter.join().map_err(|_| "waiter panicked")??;
    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[test]
fn unreachable_server_is_io_error() -> TestResult<()> {
    let port = pick_port()?;
    let client = RemoteClient::new(format!("http://127.0.0.1:{port}"))?;
    let err = client.check_new_orders().expect_err("nothing listening");
    assert_eq!(err.kind(), ErrorKind::Io);
    Ok(())
}

#[test]
fn watch_prints_new_order_events() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(temp_dir.path())?;
    server.client()?.order_created(None)?;

    let output = cli()
        .args(["watch", &server.base_url, "--max-checks", "1"])
        .output()?;
    assert!(output.status.success());
    let text = String::from_utf8(output.stdout)?;
    let line = text.lines().next().ok_or("missing event line")?;
    let value: Value = serde_json::from_str(line)?;
    assert_eq!(value["event"], "new_orders");
    assert!(value["time"].as_str().is_some());
    Ok(())
}

#[test]
fn watch_reports_failed_checks_and_continues() -> TestResult<()> {
    let port = pick_port()?;
    let output = cli()
        .args([
            "watch",
            &format!("http://127.0.0.1:{port}"),
            "--max-checks",
            "2",
            "--retry-delay-ms",
            "10",
        ])
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    let lines = stdout.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 1);
    let summary: Value = serde_json::from_str(lines[0])?;
    assert_eq!(summary["event"], "watch_ended");
    assert_eq!(summary["checks"], 2);
    assert_eq!(summary["notifications"], 0);
    assert_eq!(summary["failures"], 2);
    let stderr = String::from_utf8(output.stderr)?;
    let notices = stderr
        .lines()
        .map(serde_json::from_str::<Value>)
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(notices.len(), 2);
    for notice in notices {
        assert_eq!(notice["notice"]["kind"], "check_failed");
        assert_eq!(notice["notice"]["cmd"], "watch");
        assert_eq!(notice["notice"]["details"]["error_kind"], "Io");
    }
    Ok(())
}

fn pick_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

fn wait_for_server(child: &mut Child, addr: SocketAddr) -> TestResult<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Err(format!("server exited early ({status}): {stderr}").into());
        }
        if TcpStream::connect_timeout(&addr, Duration::from_millis(100)).is_ok() {
            return Ok(());
        }
        sleep(Duration::from_millis(20));
    }
    Err("server did not start in time".into())
}
