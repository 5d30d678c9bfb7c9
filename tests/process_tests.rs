//! End-to-end tests that run the `storefront` binary as a supervisor with
//! real worker processes.
//!
//! Each test binds its own free port, so they can run in parallel.
//!
//! Run with: cargo test --test process_tests
#![cfg(unix)]

use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

const BINARY: &str = env!("CARGO_BIN_EXE_storefront");
const STARTUP_TIMEOUT: Duration = Duration::from_secs(20);

/// Ask the OS for a port nobody is listening on
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn write_config(dir: &Path, port: u16, extra: &str) -> std::path::PathBuf {
    write_config_with_server(dir, port, "workers = 2", extra)
}

/// `server` holds extra `[server]` keys; `extra` is appended as further sections
fn write_config_with_server(
    dir: &Path,
    port: u16,
    server: &str,
    extra: &str,
) -> std::path::PathBuf {
    let path = dir.join("storefront.toml");
    let contents = format!(
        r#"
[server]
bind = "127.0.0.1:{port}"
{server}
timeout = 30
graceful_timeout = 5

[logging]
errorlog = "-"
loglevel = "info"

{extra}
"#
    );
    std::fs::write(&path, contents).unwrap();
    path
}

/// A running supervisor whose stderr is forwarded line by line
struct ServerManager {
    process: Child,
    lines: mpsc::Receiver<String>,
}

impl ServerManager {
    /// Run `storefront serve` with the given configuration file
    fn start(config: &Path) -> Self {
        Self::spawn([OsStr::new("serve"), OsStr::new("--config"), config.as_os_str()])
    }

    fn spawn<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut process = Command::new(BINARY)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .expect("Failed to start storefront");

        let stderr = process.stderr.take().unwrap();
        let (tx, lines) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                eprintln!("[storefront] {line}");
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        Self { process, lines }
    }

    /// Wait until `count` log lines containing `needle` have been seen
    fn wait_for_lines(&self, needle: &str, count: usize) -> usize {
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        let mut seen = 0;
        while seen < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.lines.recv_timeout(remaining) {
                Ok(line) if line.contains(needle) => seen += 1,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        seen
    }

    fn signal(&self, signal: Signal) {
        kill(Pid::from_raw(self.process.id() as i32), signal).unwrap();
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(status) = self.process.try_wait().unwrap() {
                return Some(status);
            }
            thread::sleep(Duration::from_millis(50));
        }
        None
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        if let Ok(None) = self.process.try_wait() {
            let _ = self.process.kill();
            let _ = self.process.wait();
        }
    }
}

/// Plain HTTP/1.1 request, returning the raw response
fn http_get(port: u16, path: &str) -> Option<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).ok()?;
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok()?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).ok()?;

    let mut response = String::new();
    stream.read_to_string(&mut response).ok()?;
    Some(response)
}

fn wait_for_health(port: u16) -> String {
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    while Instant::now() < deadline {
        if let Some(response) = http_get(port, "/health") {
            if !response.is_empty() {
                return response;
            }
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("storefront did not answer on port {port}");
}

#[test]
fn test_supervisor_serves_health_from_workers() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_config(dir.path(), port, "");

    let mut server = ServerManager::start(&config);
    assert_eq!(server.wait_for_lines("Booting worker", 2), 2);

    let response = wait_for_health(port);
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#"{"status":"healthy"}"#), "{response}");

    server.signal(Signal::SIGTERM);
    let status = server
        .wait_for_exit(Duration::from_secs(15))
        .expect("supervisor did not stop");
    assert!(status.success(), "{status:?}");
}

#[test]
fn test_post_to_health_is_rejected_by_worker() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_config(dir.path(), port, "");

    let mut server = ServerManager::start(&config);
    wait_for_health(port);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
        .write_all(
            b"POST /health HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 405"), "{response}");

    server.signal(Signal::SIGINT);
    assert!(server.wait_for_exit(Duration::from_secs(15)).is_some());
}

#[test]
fn test_pidfile_lives_as_long_as_the_supervisor() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let pidfile = dir.path().join("storefront.pid");
    let extra = format!("[process]\npidfile = \"{}\"\n", pidfile.display());
    let config = write_config(dir.path(), port, &extra);

    let mut server = ServerManager::start(&config);
    wait_for_health(port);

    let pid = std::fs::read_to_string(&pidfile).unwrap();
    assert_eq!(pid.trim(), server.process.id().to_string());

    server.signal(Signal::SIGTERM);
    assert!(server.wait_for_exit(Duration::from_secs(15)).is_some());
    assert!(!pidfile.exists());
}

#[test]
fn test_worker_boot_failure_halts_supervisor() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_config(
        dir.path(),
        port,
        "[process]\nuser = \"storefront-no-such-user\"\n",
    );

    let mut server = ServerManager::start(&config);
    let status = server
        .wait_for_exit(STARTUP_TIMEOUT)
        .expect("supervisor kept running after a boot failure");
    assert!(!status.success());
}

#[test]
fn test_check_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[server]\nworker_class = \"threads-of-doom\"\n").unwrap();

    let output = Command::new(BINARY)
        .arg("check")
        .arg("--config")
        .arg(&path)
        .output()
        .unwrap();
    assert!(!output.status.success());

    let valid = write_config(dir.path(), free_port(), "");
    let output = Command::new(BINARY)
        .arg("check")
        .arg("--config")
        .arg(&valid)
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("OK"));
}

#[test]
fn test_worker_is_replaced_after_max_requests() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_config_with_server(
        dir.path(),
        port,
        "workers = 1\nmax_requests = 2\nmax_requests_jitter = 0",
        "",
    );

    let mut server = ServerManager::start(&config);
    wait_for_health(port);
    let second = http_get(port, "/health").unwrap();
    assert!(second.starts_with("HTTP/1.1 200"), "{second}");

    assert_eq!(server.wait_for_lines("Worker exited, replacing it", 1), 1);

    // The replacement worker serves a fresh budget
    let response = wait_for_health(port);
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");

    server.signal(Signal::SIGTERM);
    assert!(server.wait_for_exit(Duration::from_secs(15)).is_some());
}

#[test]
fn test_dev_server_serves_health() {
    let port = free_port();
    let port_arg = port.to_string();

    let mut server = ServerManager::spawn(["dev", "--port", port_arg.as_str()]);
    assert_eq!(server.wait_for_lines("This is a development server", 1), 1);

    let response = wait_for_health(port);
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#"{"status":"healthy"}"#), "{response}");

    server.signal(Signal::SIGTERM);
    let status = server
        .wait_for_exit(Duration::from_secs(15))
        .expect("development server did not stop");
    assert!(status.success(), "{status:?}");
}
