// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(dead_code)]

use dd_devmon::backoff::BackoffConfig;
use dd_devmon::ipc::IpcChannel;
use dd_devmon::{
    NotificationBus, Notification, NotificationKind, NotificationSink, Supervisor,
    SupervisorConfig, SupervisorError, SupervisorState,
};
use nix::sys::signal;
use nix::unistd::Pid;
use std::io::{BufRead, BufReader as StdBufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sink that keeps every notification for later assertions.
#[derive(Default)]
pub struct RecordingSink {
    seen: Mutex<Vec<Notification>>,
}

impl NotificationSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn notify(&self, n: &Notification) {
        self.seen.lock().unwrap().push(n.clone());
    }
}

impl RecordingSink {
    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.kind == kind)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.of_kind(kind).len()
    }

    pub fn messages(&self, kind: NotificationKind) -> Vec<String> {
        self.of_kind(kind).into_iter().map(|n| n.message).collect()
    }

    /// Wait until at least `n` notifications of `kind` have arrived.
    pub async fn wait_for(&self, kind: NotificationKind, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count(kind) >= n {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until a notification of `kind` whose message contains `pattern`
    /// arrives.
    pub async fn wait_for_message(
        &self,
        kind: NotificationKind,
        pattern: &str,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.messages(kind).iter().any(|m| m.contains(pattern)) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// A supervisor wired to a recording sink, with its IPC socket and project
/// root in a private temp directory.
pub struct TestSupervisor {
    pub supervisor: Arc<Supervisor>,
    pub sink: Arc<RecordingSink>,
    pub bus: NotificationBus,
    pub root: PathBuf,
    runner: Option<JoinHandle<Result<(), SupervisorError>>>,
    _dir: TempDir,
}

impl TestSupervisor {
    /// Build a supervisor for `command args...`. `customize` may adjust the
    /// config (rules, backoff, ...) before the supervisor is created.
    pub fn new(command: &str, args: &[&str], customize: impl FnOnce(&mut SupervisorConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let mut config = SupervisorConfig {
            root_directory: root.clone(),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            kill_timeout_ms: 2_000,
            backoff: BackoffConfig::default(),
            ..Default::default()
        };
        customize(&mut config);

        let bus = NotificationBus::new();
        let sink = Arc::new(RecordingSink::default());
        bus.register(sink.clone()).unwrap();
        let ipc = Arc::new(IpcChannel::new(bus.clone(), &root));
        let supervisor = Arc::new(Supervisor::with_ipc(config, bus.clone(), ipc));

        Self {
            supervisor,
            sink,
            bus,
            root,
            runner: None,
            _dir: dir,
        }
    }

    /// Drive the supervision cycle in the background.
    pub fn start(&mut self) {
        let supervisor = Arc::clone(&self.supervisor);
        self.runner = Some(tokio::spawn(async move { supervisor.start().await }));
    }

    /// Start and wait for the first child to be running.
    pub async fn start_and_wait(&mut self) -> u32 {
        self.start();
        assert!(
            self.wait_for_state(SupervisorState::Started, DEFAULT_TIMEOUT)
                .await,
            "supervisor never reached Started"
        );
        self.supervisor.status().pid.unwrap()
    }

    pub async fn wait_for_state(&self, state: SupervisorState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.supervisor.state() == state {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until a child other than `old` is running.
    pub async fn wait_for_new_pid(&self, old: u32, timeout: Duration) -> Option<u32> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.supervisor.status();
            if status.state == SupervisorState::Started
                && let Some(pid) = status.pid
                && pid != old
            {
                return Some(pid);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn write_file(&self, rel: &str, contents: &str) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents)
            .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
    }

    /// Shut down and return what the supervision cycle returned.
    pub async fn shutdown(&mut self) -> Result<(), SupervisorError> {
        self.supervisor.shutdown().await.unwrap();
        let result = match self.runner.take() {
            Some(runner) => tokio::time::timeout(DEFAULT_TIMEOUT, runner)
                .await
                .expect("supervision cycle did not end after shutdown")
                .expect("supervision task panicked"),
            None => Ok(()),
        };
        self.bus.close().await;
        result
    }
}

/// The child's side of the IPC socket.
pub struct FakeChild {
    reader: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl FakeChild {
    pub async fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path)
            .await
            .unwrap_or_else(|e| panic!("failed to connect to {}: {e}", path.display()));
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader).lines(),
            writer,
        }
    }

    pub async fn send(&mut self, msg: serde_json::Value) {
        let mut line = serde_json::to_vec(&msg).unwrap();
        line.push(b'\n');
        self.writer.write_all(&line).await.unwrap();
    }

    /// Next message from the supervisor, or `None` on timeout or close.
    pub async fn recv(&mut self, timeout: Duration) -> Option<serde_json::Value> {
        match tokio::time::timeout(timeout, self.reader.next_line()).await {
            Ok(Ok(Some(line))) => Some(serde_json::from_str(&line).unwrap()),
            _ => None,
        }
    }
}

/// Handle to a running dd-devmon binary.
pub struct DevmonHandle {
    child: Child,
    log_lines: Arc<Mutex<Vec<String>>>,
    _readers: Vec<std::thread::JoinHandle<()>>,
}

impl DevmonHandle {
    /// Start dd-devmon in `root` with a piped stdin for file change events.
    pub fn start(root: &Path, args: &[&str]) -> Self {
        let bin = env!("CARGO_BIN_EXE_dd-devmon");
        let mut child = Command::new(bin)
            .arg("--root")
            .arg(root)
            .args(args)
            .env_remove("DD_DEVMON_CONFIG")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to start dd-devmon");

        let log_lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let stdout = child.stdout.take().expect("failed to capture stdout");
        let stderr = child.stderr.take().expect("failed to capture stderr");
        let readers = vec![
            forward(stdout, "devmon", Arc::clone(&log_lines)),
            forward(stderr, "devmon:err", Arc::clone(&log_lines)),
        ];

        Self {
            child,
            log_lines,
            _readers: readers,
        }
    }

    /// Report a changed file on the binary's stdin.
    pub fn report_change(&mut self, path: &str) {
        use std::io::Write;
        let stdin = self.child.stdin.as_mut().expect("stdin already closed");
        writeln!(stdin, "{path}").expect("failed to write to dd-devmon stdin");
        stdin.flush().unwrap();
    }

    pub fn count_log_matches(&self, pattern: &str) -> usize {
        let lines = self.log_lines.lock().unwrap();
        lines.iter().filter(|l| l.contains(pattern)).count()
    }

    pub fn wait_for_log_count(&self, pattern: &str, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count_log_matches(pattern) >= n {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Extract PIDs from "spawned (pid=NNN" log lines.
    pub fn spawned_pids(&self) -> Vec<u32> {
        let lines = self.log_lines.lock().unwrap();
        lines
            .iter()
            .filter_map(|l| {
                let marker = "spawned (pid=";
                let start = l.find(marker)? + marker.len();
                let end = l[start..].find(|c: char| !c.is_ascii_digit())? + start;
                l[start..end].parse().ok()
            })
            .collect()
    }

    pub fn send_signal(&self, sig: signal::Signal) {
        let pid = i32::try_from(self.child.id()).unwrap();
        signal::kill(Pid::from_raw(pid), sig).expect("failed to signal dd-devmon");
    }

    /// Wait for the binary to exit within the given timeout.
    pub fn wait_with_timeout(&mut self, timeout: Duration) -> std::process::ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait().expect("failed to check dd-devmon status") {
                Some(status) => return status,
                None => {
                    if Instant::now() >= deadline {
                        self.child.kill().ok();
                        return self.child.wait().expect("failed to wait on killed dd-devmon");
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

impl Drop for DevmonHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn forward(
    stream: impl std::io::Read + Send + 'static,
    tag: &'static str,
    lines: Arc<Mutex<Vec<String>>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for line in StdBufReader::new(stream).lines() {
            match line {
                Ok(l) => {
                    eprintln!("[{tag}] {l}");
                    lines.lock().unwrap().push(l);
                }
                Err(_) => break,
            }
        }
    })
}

/// Check if a PID is still alive.
pub fn pid_is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(i32::try_from(pid).unwrap()), None).is_ok()
}

/// Wait until a PID is no longer alive, or timeout.
pub async fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pid_is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Blocking variant for tests that don't run inside a runtime.
pub fn wait_for_pid_gone_blocking(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pid_is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
