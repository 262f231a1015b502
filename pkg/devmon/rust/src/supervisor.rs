// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! The process supervisor: owns one child process, its restart policy and
//! the IPC channel it coordinates soft reloads over.
//!
//! ```text
//! Stopped --start--> Starting --spawn ok--> Started --stop/hard restart--> Stopping
//!    ^                                         |                              |
//!    |                                         +--unexpected exit--> Stopping |
//!    +------------------------ confirmed exit ------------------------------+
//! ```
//!
//! [`Supervisor::start`] drives the whole cycle on the caller's task,
//! respawning after crashes (with backoff) and after hard restarts until a
//! stop or shutdown ends it.

use crate::backoff::BackoffState;
use crate::bus::NotificationBus;
use crate::config::SupervisorConfig;
use crate::env::build_child_env;
use crate::errors::SupervisorError;
use crate::ipc::{IPC_CHANNEL_ENV, IpcChannel, IpcMessage};
use crate::notification::{ChildProcessId, Notification, NotificationKind};
use crate::process::{self, ChildProcessHandle, SpawnedChild};
use crate::rules::{HARD_RELOAD_TASK, RestartAction, SOFT_RELOAD_TASK, relative_path};
use crate::state::{AtomicState, SupervisorState};
use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, oneshot, watch};
use tokio::time::{Duration, Instant, sleep_until, timeout};

const SIGKILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Point-in-time view of the supervisor, readable without blocking on the
/// process lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub child_process_id: Option<ChildProcessId>,
    pub ipc_connected: bool,
    /// The child announced `startup` over IPC.
    pub ready: bool,
}

/// The single process slot. `handle` is the only mutable state with several
/// writers and is always accessed under its lock; `pid`, `id` and `running`
/// mirror it for lock-free readers and exit waiters.
struct ProcessSlot {
    handle: tokio::sync::Mutex<Option<ChildProcessHandle>>,
    running: watch::Sender<Option<ChildProcessId>>,
    pid: AtomicU32,
    id: Mutex<Option<ChildProcessId>>,
}

impl ProcessSlot {
    fn new() -> Self {
        let (running, _) = watch::channel(None);
        Self {
            handle: tokio::sync::Mutex::new(None),
            running,
            pid: AtomicU32::new(0),
            id: Mutex::new(None),
        }
    }

    fn id(&self) -> Option<ChildProcessId> {
        *locked(&self.id)
    }

    async fn install(&self, handle: ChildProcessHandle) {
        let mut slot = self.handle.lock().await;
        self.pid.store(handle.pid, Ordering::SeqCst);
        *locked(&self.id) = Some(handle.id);
        self.running.send_replace(Some(handle.id));
        *slot = Some(handle);
    }

    async fn clear(&self, id: ChildProcessId) {
        let mut slot = self.handle.lock().await;
        if slot.as_ref().is_some_and(|h| h.id == id) {
            *slot = None;
            self.pid.store(0, Ordering::SeqCst);
            self.running.send_replace(None);
        }
    }
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn describe(status: &std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("unknown status ({e})"),
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    bus: NotificationBus,
    ipc: Arc<IpcChannel>,
    state: AtomicState,
    slot: Arc<ProcessSlot>,
    backoff: Mutex<BackoffState>,
    /// Set by stop/hard restart before signalling, cleared when a new spawn
    /// begins. An exit while this is unset is a crash.
    expecting_shutdown: AtomicBool,
    /// At most one pending hard restart; duplicates coalesce into it.
    restart_requested: AtomicBool,
    cycle_active: AtomicBool,
    closed: AtomicBool,
    wake: Notify,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, bus: NotificationBus) -> Self {
        let ipc = Arc::new(IpcChannel::new(bus.clone(), &std::env::temp_dir()));
        Self::with_ipc(config, bus, ipc)
    }

    /// Use a caller-provided IPC channel, e.g. one whose socket lives in a
    /// specific directory.
    pub fn with_ipc(config: SupervisorConfig, bus: NotificationBus, ipc: Arc<IpcChannel>) -> Self {
        let backoff = BackoffState::new(&config.backoff);
        Self {
            config,
            bus,
            ipc,
            state: AtomicState::new(SupervisorState::Stopped),
            slot: Arc::new(ProcessSlot::new()),
            backoff: Mutex::new(backoff),
            expecting_shutdown: AtomicBool::new(false),
            restart_requested: AtomicBool::new(false),
            cycle_active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn ipc(&self) -> &Arc<IpcChannel> {
        &self.ipc
    }

    pub fn state(&self) -> SupervisorState {
        self.state.get()
    }

    pub fn status(&self) -> SupervisorStatus {
        let pid = self.slot.pid.load(Ordering::SeqCst);
        SupervisorStatus {
            state: self.state.get(),
            pid: (pid != 0).then_some(pid),
            child_process_id: self.slot.id(),
            ipc_connected: self.ipc.is_connected(),
            ready: self.ipc.is_ready(),
        }
    }

    fn emit(&self, kind: NotificationKind, message: impl Into<String>) {
        self.bus
            .notify(Notification::new(kind, self.slot.id(), message));
    }

    fn backoff(&self) -> MutexGuard<'_, BackoffState> {
        locked(&self.backoff)
    }

    /// Environment handed to the child and to tasks. Env files are re-read
    /// every time so edits take effect on the next restart.
    fn child_env(&self) -> Vec<(String, String)> {
        let mut env = build_child_env(
            &self.config.root_directory,
            &self.config.env,
            &self.config.rules.env_files,
        );
        env.retain(|(k, _)| k != IPC_CHANNEL_ENV);
        env.push((
            IPC_CHANNEL_ENV.to_string(),
            self.ipc.path().display().to_string(),
        ));
        env
    }

    /// Run the supervised cycle. Returns when the child exits after an
    /// explicit [`Supervisor::stop`], after [`Supervisor::shutdown`], or with
    /// an error when spawning, a prestart task or the crash-loop budget fails.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        if self.cycle_active.swap(true, Ordering::SeqCst) {
            return Err(SupervisorError::InvalidState {
                operation: "start",
                state: self.state.get(),
            });
        }
        if let Err(state) = self
            .state
            .transition(SupervisorState::Stopped, SupervisorState::Starting)
        {
            self.cycle_active.store(false, Ordering::SeqCst);
            return Err(SupervisorError::InvalidState {
                operation: "start",
                state,
            });
        }

        self.closed.store(false, Ordering::SeqCst);
        self.backoff().reset();
        let mut result = self.run_cycle(false).await;
        while self.finish_cycle() {
            if let Err(state) = self
                .state
                .transition(SupervisorState::Stopped, SupervisorState::Starting)
            {
                debug!("unexpected state {state} before late restart");
                self.cycle_active.store(false, Ordering::SeqCst);
                break;
            }
            info!("hard restart arrived as the cycle ended, restarting");
            self.backoff().reset();
            result = self.run_cycle(true).await;
        }
        result
    }

    /// Release the cycle. A hard restart that landed after the cycle decided
    /// to end is picked up here; returns true with the cycle re-claimed when
    /// one is pending.
    fn finish_cycle(&self) -> bool {
        self.cycle_active.store(false, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst)
            || !self.restart_requested.swap(false, Ordering::SeqCst)
        {
            return false;
        }
        self.cycle_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    async fn run_cycle(&self, mut restarted: bool) -> Result<(), SupervisorError> {
        loop {
            self.expecting_shutdown.store(false, Ordering::SeqCst);
            self.restart_requested.store(false, Ordering::SeqCst);

            let exited = match self.spawn_once().await {
                Ok(Some(exited)) => exited,
                Ok(None) => {
                    self.set_stopped_from_starting();
                    return Ok(());
                }
                Err(e) => {
                    self.set_stopped_from_starting();
                    error!("{e}");
                    self.emit(NotificationKind::SystemError, e.to_string());
                    return Err(e);
                }
            };

            let id = self.slot.id();
            if restarted {
                self.emit(NotificationKind::HardRestartCompleted, "child process restarted");
            }
            if self.closed.load(Ordering::SeqCst) {
                // Shutdown raced with the spawn.
                let _ = self.stop().await;
            }

            let status = exited.await.unwrap_or_else(|_| {
                Err(std::io::Error::other("exit waiter dropped"))
            });

            // If someone else already moved us to Stopping, the exit was asked for.
            let requested = match self
                .state
                .transition(SupervisorState::Started, SupervisorState::Stopping)
            {
                Ok(()) => self.expecting_shutdown.load(Ordering::SeqCst),
                Err(_) => true,
            };
            if let Err(state) = self
                .state
                .transition(SupervisorState::Stopping, SupervisorState::Stopped)
            {
                debug!("unexpected state {state} after child exit");
            }

            let label = id.map(|i| i.to_string()).unwrap_or_default();
            if self.closed.load(Ordering::SeqCst) {
                info!("[{label}] exited with {}, supervisor shutting down", describe(&status));
                self.emit(NotificationKind::Shutdown, format!("exited with {}", describe(&status)));
                return Ok(());
            }

            if self.restart_requested.swap(false, Ordering::SeqCst) {
                info!("[{label}] exited with {}, restarting", describe(&status));
                self.emit(NotificationKind::Shutdown, format!("exited with {}", describe(&status)));
                restarted = true;
                self.set_starting();
                continue;
            }

            if requested {
                info!("[{label}] stopped ({})", describe(&status));
                self.emit(NotificationKind::Shutdown, format!("exited with {}", describe(&status)));
                return Ok(());
            }

            let next = self.backoff().next_delay();
            let Some(delay) = next else {
                let (attempts, elapsed) = {
                    let backoff = self.backoff();
                    (backoff.attempts(), backoff.elapsed())
                };
                let err = SupervisorError::BackoffExhausted { attempts, elapsed };
                error!("[{label}] exited with {}: {err}", describe(&status));
                self.emit(NotificationKind::Shutdown, format!("exited with {}", describe(&status)));
                self.emit(NotificationKind::SystemError, err.to_string());
                return Err(err);
            };

            warn!(
                "[{label}] exited unexpectedly with {}, restarting in {delay:?}",
                describe(&status)
            );
            self.emit(
                NotificationKind::Shutdown,
                format!(
                    "exited unexpectedly with {}, restarting in {delay:?}",
                    describe(&status)
                ),
            );

            self.wait_backoff(delay).await;
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            restarted = self.restart_requested.swap(false, Ordering::SeqCst);
            self.set_starting();
        }
    }

    fn set_starting(&self) {
        if let Err(state) = self
            .state
            .transition(SupervisorState::Stopped, SupervisorState::Starting)
        {
            debug!("unexpected state {state} before respawn");
        }
    }

    fn set_stopped_from_starting(&self) {
        if let Err(state) = self
            .state
            .transition(SupervisorState::Starting, SupervisorState::Stopped)
        {
            debug!("unexpected state {state} after aborted start");
        }
    }

    /// Sleep out a backoff interval, cut short by a hard restart or shutdown.
    async fn wait_backoff(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        loop {
            if self.closed.load(Ordering::SeqCst)
                || self.restart_requested.load(Ordering::SeqCst)
            {
                return;
            }
            tokio::select! {
                _ = sleep_until(deadline) => return,
                _ = self.wake.notified() => {}
            }
        }
    }

    /// Prestart tasks, IPC endpoint, spawn. Returns the exit receiver of the
    /// new child, or `None` if shutdown arrived before the spawn.
    async fn spawn_once(
        &self,
    ) -> Result<Option<oneshot::Receiver<std::io::Result<ExitStatus>>>, SupervisorError> {
        let env = self.child_env();
        let root = &self.config.root_directory;

        for task in &self.config.prestart {
            process::run_task(task, &env, root, self.slot.id(), &self.bus)
                .await
                .map_err(|e| SupervisorError::Prestart(Box::new(e)))?;
        }

        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }

        if let Err(e) = self.ipc.listen().await {
            warn!("soft reloads unavailable: {e}");
        }

        let id = ChildProcessId::new();
        self.ipc.attach_child(id);
        let spawned: SpawnedChild = process::spawn_child(
            id,
            &self.config.command,
            &self.config.args,
            &env,
            root,
            &self.bus,
        )?;
        let handle = spawned.handle.clone();
        self.slot.install(handle.clone()).await;

        let (exit_tx, exit_rx) = oneshot::channel();
        let slot = Arc::clone(&self.slot);
        tokio::spawn(async move {
            let status = spawned.wait().await;
            slot.clear(id).await;
            let _ = exit_tx.send(status);
        });

        if let Err(state) = self
            .state
            .transition(SupervisorState::Starting, SupervisorState::Started)
        {
            debug!("unexpected state {state} after spawn");
        }
        self.emit(
            NotificationKind::Startup,
            format!("started {} (pid {})", handle.command_line(), handle.pid),
        );
        Ok(Some(exit_rx))
    }

    /// Stop the child: graceful terminate to its process group, then a
    /// forced kill once the kill timeout elapses. Only valid while Started.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.state
            .transition(SupervisorState::Started, SupervisorState::Stopping)
            .map_err(|state| SupervisorError::InvalidState {
                operation: "stop",
                state,
            })?;
        self.terminate().await
    }

    async fn terminate(&self) -> Result<(), SupervisorError> {
        self.expecting_shutdown.store(true, Ordering::SeqCst);

        let (id, pgid) = {
            let slot = self.slot.handle.lock().await;
            match slot.as_ref() {
                Some(h) => (h.id, h.pgid),
                None => return Ok(()),
            }
        };
        let mut running = self.slot.running.subscribe();

        if self.ipc.is_connected()
            && let Err(e) = self.ipc.send(&IpcMessage::Shutdown).await
        {
            debug!("[{id}] shutdown message not delivered: {e}");
        }

        info!("[{id}] sending SIGTERM to process group {pgid}");
        if let Err(e) = process::signal_group(pgid, Signal::SIGTERM) {
            warn!("[{id}] failed to send SIGTERM: {e}");
        }

        let kill_timeout = self.config.kill_timeout();
        if timeout(kill_timeout, running.wait_for(|v| *v != Some(id)))
            .await
            .is_ok()
        {
            return Ok(());
        }

        warn!(
            "[{id}] still running after {}ms, sending SIGKILL",
            kill_timeout.as_millis()
        );
        process::signal_group(pgid, Signal::SIGKILL)
            .map_err(|source| SupervisorError::KillFailed { pgid, source })?;
        if timeout(SIGKILL_TIMEOUT, running.wait_for(|v| *v != Some(id)))
            .await
            .is_err()
        {
            warn!("[{id}] not reaped {}s after SIGKILL", SIGKILL_TIMEOUT.as_secs());
        }
        Ok(())
    }

    /// Restart the child and reset the crash backoff. Ignored while a spawn
    /// is in progress; queued (once) while a stop is in progress.
    pub async fn hard_restart(&self, reason: &str) -> Result<(), SupervisorError> {
        self.emit(NotificationKind::HardRestartRequested, reason);
        if self.closed.load(Ordering::SeqCst) {
            debug!("hard restart ignored, shutting down");
            return Ok(());
        }

        match self.state.get() {
            SupervisorState::Starting => {
                debug!("hard restart ignored while starting ({reason})");
                Ok(())
            }
            SupervisorState::Stopping => {
                self.backoff().reset();
                if self.restart_requested.swap(true, Ordering::SeqCst) {
                    debug!("hard restart coalesced with pending restart ({reason})");
                } else {
                    info!("hard restart queued until the current stop completes ({reason})");
                }
                Ok(())
            }
            SupervisorState::Stopped => {
                if !self.cycle_active.load(Ordering::SeqCst) {
                    return Err(SupervisorError::InvalidState {
                        operation: "hard restart",
                        state: SupervisorState::Stopped,
                    });
                }
                // Waiting out a crash backoff: respawn now.
                self.backoff().reset();
                self.restart_requested.store(true, Ordering::SeqCst);
                self.wake.notify_one();
                // The cycle may have ended meanwhile. Whoever clears the flag
                // owns the request.
                if !self.cycle_active.load(Ordering::SeqCst)
                    && self.restart_requested.swap(false, Ordering::SeqCst)
                {
                    return Err(SupervisorError::InvalidState {
                        operation: "hard restart",
                        state: SupervisorState::Stopped,
                    });
                }
                Ok(())
            }
            SupervisorState::Started => {
                info!("hard restart: {reason}");
                self.backoff().reset();
                self.restart_requested.store(true, Ordering::SeqCst);
                match self
                    .state
                    .transition(SupervisorState::Started, SupervisorState::Stopping)
                {
                    Ok(()) => self.terminate().await,
                    // Lost the race to another stop; the flag rides along with it.
                    Err(_) => Ok(()),
                }
            }
        }
    }

    /// Ask a cooperating child to reload after `path` changed. Never fails:
    /// without an IPC connection this only logs a warning.
    pub async fn soft_restart(&self, path: &str) {
        self.emit(NotificationKind::SoftRestartRequested, path);
        if self.state.get() == SupervisorState::Starting {
            debug!("soft restart ignored while starting ({path})");
            return;
        }
        if !self.ipc.is_connected() {
            warn!("soft restart for {path} skipped: no child connected over ipc");
            return;
        }
        match self.ipc.request_reload(path).await {
            Ok(()) => info!("soft reload: {path}"),
            Err(e) => warn!("soft restart for {path} failed: {e}"),
        }
    }

    /// Run a one-off command with the child's environment. Does not touch
    /// supervisor state.
    pub async fn run_out_of_band_task(&self, task: &str) -> Result<(), SupervisorError> {
        let env = self.child_env();
        process::run_task(
            task,
            &env,
            &self.config.root_directory,
            self.slot.id(),
            &self.bus,
        )
        .await
    }

    /// Classify a changed file and act on it.
    pub async fn handle_file_change(&self, path: &Path) -> Result<(), SupervisorError> {
        let root = &self.config.root_directory;
        let rel = relative_path(path, root).display().to_string();

        match self.config.rules.classify(path, root) {
            RestartAction::Ignore => {
                debug!("excluded file: {rel}");
                Ok(())
            }
            RestartAction::HardRestart => self.hard_restart(&rel).await,
            RestartAction::SoftRestart => {
                self.soft_restart(&rel).await;
                Ok(())
            }
            RestartAction::RunGeneratedTasks(tasks) => self.run_generated_tasks(&tasks, &rel).await,
            RestartAction::RunOnEnvFileChange => {
                info!("env file changed: {rel}");
                self.hard_restart(&rel).await
            }
            RestartAction::Unhandled if self.config.reload_on_unhandled => {
                self.hard_restart(&rel).await
            }
            RestartAction::Unhandled => {
                info!("unhandled modified file: {rel}");
                Ok(())
            }
        }
    }

    async fn run_generated_tasks(&self, tasks: &[String], rel: &str) -> Result<(), SupervisorError> {
        for task in tasks {
            match task.as_str() {
                HARD_RELOAD_TASK => self.hard_restart(rel).await?,
                SOFT_RELOAD_TASK => self.soft_restart(rel).await,
                _ => {
                    if let Err(e) = self.run_out_of_band_task(task).await {
                        error!("generated task for {rel} failed: {e}");
                        self.emit(NotificationKind::SystemError, e.to_string());
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// End supervision: interrupt any backoff wait, stop the child if it is
    /// running, and close the IPC channel. The cycle driven by
    /// [`Supervisor::start`] returns once the child is gone.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.closed.store(true, Ordering::SeqCst);
        self.wake.notify_one();

        let result = match self
            .state
            .transition(SupervisorState::Started, SupervisorState::Stopping)
        {
            Ok(()) => self.terminate().await,
            Err(SupervisorState::Stopping) => {
                // A restart's stop is in flight; wait for it to finish.
                let mut running = self.slot.running.subscribe();
                let _ = timeout(
                    self.config.kill_timeout() + SIGKILL_TIMEOUT,
                    running.wait_for(Option::is_none),
                )
                .await;
                Ok(())
            }
            Err(_) => Ok(()),
        };
        self.ipc.close().await;
        result
    }
}
