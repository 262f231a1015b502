// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::bus::NotificationBus;
use crate::errors::SupervisorError;
use crate::notification::{ChildProcessId, Notification, NotificationKind, OutputStream};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};

/// How long to keep forwarding output after the child exits. Grandchildren
/// can hold the pipes open; they are killed with the group, but don't wait
/// on them forever.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Snapshot of one spawned child. Replaced, never mutated, on every spawn.
#[derive(Debug, Clone)]
pub struct ChildProcessHandle {
    pub id: ChildProcessId,
    pub pid: u32,
    /// Equal to `pid`: every child leads its own process group.
    pub pgid: i32,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
    pub started_at: Instant,
}

impl ChildProcessHandle {
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// A running child plus the tasks forwarding its output to the bus.
pub struct SpawnedChild {
    pub handle: ChildProcessHandle,
    child: Child,
    output: Vec<JoinHandle<()>>,
}

impl SpawnedChild {
    /// Wait for the group leader to exit, kill anything it left behind in
    /// its process group, then let output forwarding finish.
    pub async fn wait(mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await;
        if let Err(e) = signal_group(self.handle.pgid, Signal::SIGKILL) {
            debug!(
                "[{}] could not reap process group {}: {e}",
                self.handle.id, self.handle.pgid
            );
        }
        for mut task in self.output {
            if timeout(OUTPUT_DRAIN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }
        status
    }
}

/// Spawn `program` in a new process group with exactly `env`, forwarding
/// stdout and stderr line by line as notifications tagged with `id`.
pub fn spawn_child(
    id: ChildProcessId,
    program: &str,
    args: &[String],
    env: &[(String, String)],
    working_dir: &Path,
    bus: &NotificationBus,
) -> Result<SpawnedChild, SupervisorError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k, v)))
        .current_dir(working_dir)
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let command: Vec<String> = std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect();

    let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        command: command.join(" "),
        source,
    })?;

    let pid = child.id().unwrap_or(0);
    let pgid = i32::try_from(pid).unwrap_or(0);

    let mut output = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        output.push(forward_lines(stdout, NotificationKind::StdOut, id, bus.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        output.push(forward_lines(stderr, NotificationKind::StdErr, id, bus.clone()));
    }

    info!(
        "[{id}] spawned (pid={pid}, cmd={})",
        command.join(" ")
    );

    Ok(SpawnedChild {
        handle: ChildProcessHandle {
            id,
            pid,
            pgid,
            command,
            env: env.to_vec(),
            working_dir: working_dir.to_path_buf(),
            started_at: Instant::now(),
        },
        child,
        output,
    })
}

fn forward_lines<R>(
    reader: R,
    kind: NotificationKind,
    id: ChildProcessId,
    bus: NotificationBus,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    bus.notify(Notification::new(kind, Some(id), line));
                }
                Err(e) => {
                    debug!("[{id}] {kind} closed: {e}");
                    break;
                }
            }
        }
    })
}

/// Signal every process in group `pgid`. A group that no longer exists
/// counts as success.
pub fn signal_group(pgid: i32, sig: Signal) -> Result<(), nix::Error> {
    if pgid <= 0 {
        return Err(Errno::EINVAL);
    }
    match killpg(Pid::from_raw(pgid), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Run a short-lived task to completion in its own process group. Output is
/// buffered and published only once the task has exited.
pub async fn run_task(
    task: &str,
    env: &[(String, String)],
    working_dir: &Path,
    id: Option<ChildProcessId>,
    bus: &NotificationBus,
) -> Result<(), SupervisorError> {
    let mut parts = task.split_whitespace();
    let Some(program) = parts.next() else {
        return Err(SupervisorError::TaskFailed {
            task: task.to_string(),
            reason: "empty command".to_string(),
        });
    };

    info!("running task: {task}");
    bus.notify(Notification::new(NotificationKind::OOBTaskStarted, id, task));

    let output = Command::new(program)
        .args(parts)
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k, v)))
        .current_dir(working_dir)
        .process_group(0)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| SupervisorError::TaskFailed {
            task: task.to_string(),
            reason: e.to_string(),
        })?;

    for (bytes, stream) in [
        (&output.stdout, OutputStream::Stdout),
        (&output.stderr, OutputStream::Stderr),
    ] {
        for line in String::from_utf8_lossy(bytes).lines() {
            bus.notify(
                Notification::new(NotificationKind::OOBTaskOutput, id, line).with_stream(stream),
            );
        }
    }

    if output.status.success() {
        debug!("task finished: {task}");
        Ok(())
    } else {
        warn!("task `{task}` exited with {}", output.status);
        Err(SupervisorError::TaskFailed {
            task: task.to_string(),
            reason: format!("exited with {}", output.status),
        })
    }
}
