// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Coordination channel with a cooperating child.
//!
//! The supervisor listens on a Unix socket whose path is handed to every
//! child in [`IPC_CHANNEL_ENV`]. Messages are newline-delimited JSON objects
//! of the form `{"type":"reload","data":"views/index.html"}`. Only one child
//! connection is live at a time; a new connection replaces the previous one.
//! A child that never connects is fine, soft reloads just have nowhere to go.

use crate::bus::NotificationBus;
use crate::errors::IpcError;
use crate::notification::{ChildProcessId, Notification, NotificationKind};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

/// Environment variable carrying the socket path to the child.
pub const IPC_CHANNEL_ENV: &str = "DEVMON_IPC_CHANNEL";

const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Longest accepted message line. A client exceeding it is disconnected.
const MAX_MESSAGE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum IpcMessage {
    /// Child is initialised and serving.
    Startup,
    Ping,
    Pong,
    /// Supervisor to child: reload after this relative path changed.
    Reload(String),
    /// Child to supervisor: reload finished, with a free-form hint.
    Reloaded(String),
    /// Supervisor to child: exit cleanly.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

#[derive(Debug)]
struct PendingReload {
    path: String,
    sent_at: Instant,
}

pub struct IpcChannel {
    name: String,
    path: PathBuf,
    bus: NotificationBus,
    child_process_id: Mutex<Option<ChildProcessId>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    generation: AtomicU64,
    connected: AtomicBool,
    ready: AtomicBool,
    alive: AtomicBool,
    pending_reload: Mutex<Option<PendingReload>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listening: AtomicBool,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl IpcChannel {
    /// Create a channel whose socket will live in `dir`. Nothing is bound
    /// until [`IpcChannel::listen`].
    pub fn new(bus: NotificationBus, dir: &Path) -> Self {
        let name = format!("devmon-{}", Uuid::new_v4());
        let path = dir.join(format!("{name}.sock"));
        Self {
            name,
            path,
            bus,
            child_process_id: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            alive: AtomicBool::new(false),
            pending_reload: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            listening: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The connected child announced `startup`.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// The connected child has pinged since it connected.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Correlate subsequent traffic with a freshly spawned child.
    pub fn attach_child(&self, id: ChildProcessId) {
        *locked(&self.child_process_id) = Some(id);
        self.ready.store(false, Ordering::SeqCst);
    }

    fn child_process_id(&self) -> Option<ChildProcessId> {
        *locked(&self.child_process_id)
    }

    fn emit(&self, kind: NotificationKind, message: impl Into<String>) {
        self.bus
            .notify(Notification::new(kind, self.child_process_id(), message));
    }

    /// Bind the socket and start accepting. Idempotent.
    pub async fn listen(self: &Arc<Self>) -> Result<(), IpcError> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // A stale socket from a crashed run would make bind fail.
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path).map_err(|source| {
            self.listening.store(false, Ordering::SeqCst);
            IpcError::Bind {
                path: self.path.display().to_string(),
                source,
            }
        })?;
        info!("ipc listening on {}", self.path.display());

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(accept_loop(weak, listener));
        locked(&self.tasks).push(handle);
        Ok(())
    }

    async fn attach_connection(self: &Arc<Self>, stream: UnixStream) {
        let (reader, writer) = stream.into_split();
        let generation = {
            let mut slot = self.writer.lock().await;
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *slot = Some(writer);
            generation
        };
        let replaced = self.connected.swap(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        if replaced {
            debug!("ipc connection replaced by a new client");
        }
        info!("ipc client connected");
        self.emit(NotificationKind::IpcConnected, "ipc client connected");

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(read_loop(weak, generation, reader));
        let mut tasks = locked(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    async fn connection_lost(&self, generation: u64) {
        {
            let mut slot = self.writer.lock().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            *slot = None;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        if let Some(pending) = locked(&self.pending_reload).take() {
            warn!(
                "ipc client went away before acknowledging reload of {}",
                pending.path
            );
        }
        info!("ipc client disconnected");
        self.emit(NotificationKind::IpcDisconnected, "ipc client disconnected");
    }

    async fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let msg: IpcMessage = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("ignoring malformed ipc message {line:?}: {e}");
                return;
            }
        };
        match msg {
            IpcMessage::Ping => {
                self.alive.store(true, Ordering::SeqCst);
                if let Err(e) = self.send(&IpcMessage::Pong).await {
                    warn!("failed to answer ping: {e}");
                }
            }
            IpcMessage::Pong => self.alive.store(true, Ordering::SeqCst),
            IpcMessage::Startup => {
                self.ready.store(true, Ordering::SeqCst);
                info!("child process reported ready");
                self.emit(NotificationKind::Startup, "child process ready");
            }
            IpcMessage::Reloaded(hint) => {
                match locked(&self.pending_reload).take() {
                    Some(pending) => debug!(
                        "reload of {} acknowledged after {:?}",
                        pending.path,
                        pending.sent_at.elapsed()
                    ),
                    None => debug!("unsolicited reload acknowledgement"),
                }
                self.emit(NotificationKind::SoftRestartCompleted, hint);
            }
            other @ (IpcMessage::Reload(_) | IpcMessage::Shutdown) => {
                warn!("unexpected ipc message from child: {other:?}");
            }
        }
    }

    /// Write one message to the connected child. Fails fast when nobody is
    /// connected and gives up after a short timeout if the child stops
    /// reading.
    pub async fn send(&self, msg: &IpcMessage) -> Result<(), IpcError> {
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');

        let mut slot = self.writer.lock().await;
        let writer = slot.as_mut().ok_or(IpcError::Disconnected)?;
        match timeout(WRITE_TIMEOUT, writer.write_all(&line)).await {
            Ok(result) => result.map_err(IpcError::from),
            Err(_) => Err(IpcError::WriteTimeout),
        }
    }

    /// Ask the child to reload after `path` changed. Returns once the request
    /// is written; the acknowledgement arrives later as a
    /// `SoftRestartCompleted` notification.
    pub async fn request_reload(&self, path: &str) -> Result<(), IpcError> {
        if !self.is_connected() {
            return Err(IpcError::Disconnected);
        }
        *locked(&self.pending_reload) = Some(PendingReload {
            path: path.to_string(),
            sent_at: Instant::now(),
        });
        let result = self.send(&IpcMessage::Reload(path.to_string())).await;
        if result.is_err() {
            locked(&self.pending_reload).take();
        }
        result
    }

    /// Stop accepting, drop the live connection and remove the socket file.
    pub async fn close(&self) {
        for task in locked(&self.tasks).drain(..) {
            task.abort();
        }
        {
            let mut slot = self.writer.lock().await;
            self.generation.fetch_add(1, Ordering::SeqCst);
            *slot = None;
        }
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        if was_connected {
            self.emit(NotificationKind::IpcDisconnected, "ipc channel closed");
        }
        if self.listening.swap(false, Ordering::SeqCst) {
            let _ = std::fs::remove_file(&self.path);
            debug!("ipc channel {} closed", self.name);
        }
    }
}

impl Drop for IpcChannel {
    fn drop(&mut self) {
        for task in locked(&self.tasks).drain(..) {
            task.abort();
        }
        if self.listening.load(Ordering::SeqCst) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

async fn accept_loop(channel: Weak<IpcChannel>, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let Some(channel) = channel.upgrade() else {
                    return;
                };
                channel.attach_connection(stream).await;
            }
            Err(e) => {
                warn!("ipc accept failed: {e}");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn read_loop(channel: Weak<IpcChannel>, generation: u64, reader: OwnedReadHalf) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_MESSAGE_LEN as u64);
        match limited.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(n) if n >= MAX_MESSAGE_LEN && !buf.ends_with(b"\n") => {
                warn!("ipc message longer than {MAX_MESSAGE_LEN} bytes, dropping connection");
                break;
            }
            Ok(_) => {
                let Some(channel) = channel.upgrade() else {
                    return;
                };
                channel.handle_line(&String::from_utf8_lossy(&buf)).await;
            }
            Err(e) => {
                debug!("ipc read failed: {e}");
                break;
            }
        }
    }
    if let Some(channel) = channel.upgrade() {
        channel.connection_lost(generation).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::bus::NotificationSink;

    #[derive(Default)]
    struct Kinds(Mutex<Vec<(NotificationKind, String)>>);

    impl NotificationSink for Kinds {
        fn name(&self) -> &str {
            "kinds"
        }

        fn notify(&self, n: &Notification) {
            self.0.lock().unwrap().push((n.kind, n.message.clone()));
        }
    }

    impl Kinds {
        async fn wait_for(&self, kind: NotificationKind) -> String {
            for _ in 0..200 {
                if let Some((_, m)) = self.0.lock().unwrap().iter().find(|(k, _)| *k == kind) {
                    return m.clone();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("no {kind} notification");
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    async fn setup() -> (tempfile::TempDir, Arc<IpcChannel>, Arc<Kinds>) {
        let dir = tempfile::tempdir().unwrap();
        let bus = NotificationBus::new();
        let kinds = Arc::new(Kinds::default());
        bus.register(kinds.clone()).unwrap();
        let channel = Arc::new(IpcChannel::new(bus, dir.path()));
        channel.listen().await.unwrap();
        (dir, channel, kinds)
    }

    #[test]
    fn test_wire_format() {
        let reload = serde_json::to_string(&IpcMessage::Reload("index.html".into())).unwrap();
        assert_eq!(reload, r#"{"type":"reload","data":"index.html"}"#);
        let ping: IpcMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, IpcMessage::Ping);
        let done: IpcMessage =
            serde_json::from_str(r#"{"type":"reloaded","data":"templates"}"#).unwrap();
        assert_eq!(done, IpcMessage::Reloaded("templates".into()));
    }

    #[tokio::test]
    async fn test_send_without_client_is_disconnected() {
        let (_dir, channel, _) = setup().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(matches!(
            channel.request_reload("index.html").await,
            Err(IpcError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_reload_exchange() {
        let (_dir, channel, kinds) = setup().await;
        let stream = UnixStream::connect(channel.path()).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        wait_until(|| channel.is_connected()).await;
        kinds.wait_for(NotificationKind::IpcConnected).await;

        write.write_all(b"{\"type\":\"startup\"}\n").await.unwrap();
        wait_until(|| channel.is_ready()).await;

        channel.request_reload("views/index.html").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"type":"reload","data":"views/index.html"}"#);

        write
            .write_all(b"{\"type\":\"reloaded\",\"data\":\"templates\"}\n")
            .await
            .unwrap();
        let hint = kinds.wait_for(NotificationKind::SoftRestartCompleted).await;
        assert_eq!(hint, "templates");
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (_dir, channel, _) = setup().await;
        let stream = UnixStream::connect(channel.path()).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"{\"type\":\"ping\"}\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"type":"pong"}"#);
        assert!(channel.is_alive());
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_connection() {
        let (_dir, channel, _) = setup().await;
        let stream = UnixStream::connect(channel.path()).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"not json\n").await.unwrap();
        write.write_all(b"{\"type\":\"ping\"}\n").await.unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            r#"{"type":"pong"}"#
        );
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_mid_exchange() {
        let (_dir, channel, kinds) = setup().await;
        let stream = UnixStream::connect(channel.path()).await.unwrap();
        wait_until(|| channel.is_connected()).await;

        channel.request_reload("a.html").await.unwrap();
        drop(stream);

        kinds.wait_for(NotificationKind::IpcDisconnected).await;
        assert!(!channel.is_connected());
        assert!(locked(&channel.pending_reload).is_none());
    }

    #[tokio::test]
    async fn test_new_connection_replaces_old() {
        let (_dir, channel, _) = setup().await;
        let first = UnixStream::connect(channel.path()).await.unwrap();
        wait_until(|| channel.is_connected()).await;
        let second = UnixStream::connect(channel.path()).await.unwrap();
        wait_until(|| channel.generation.load(Ordering::SeqCst) == 2).await;

        // The stale connection closing must not mark the channel disconnected.
        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(channel.is_connected());

        let (read, _write) = second.into_split();
        let mut lines = BufReader::new(read).lines();
        channel.send(&IpcMessage::Shutdown).await.unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            r#"{"type":"shutdown"}"#
        );
    }

    #[tokio::test]
    async fn test_oversized_message_drops_connection() {
        let (_dir, channel, kinds) = setup().await;
        let mut stream = UnixStream::connect(channel.path()).await.unwrap();
        wait_until(|| channel.is_connected()).await;

        let flood = vec![b'a'; MAX_MESSAGE_LEN + 1024];
        // The server may hang up before the whole flood is written.
        let _ = stream.write_all(&flood).await;
        kinds.wait_for(NotificationKind::IpcDisconnected).await;
        assert!(!channel.is_connected());

        // The listener survives and serves the next client.
        let stream = UnixStream::connect(channel.path()).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        write.write_all(b"{\"type\":\"ping\"}\n").await.unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            r#"{"type":"pong"}"#
        );
    }

    #[tokio::test]
    async fn test_close_removes_socket() {
        let (_dir, channel, _) = setup().await;
        assert!(channel.path().exists());
        channel.listen().await.unwrap();
        channel.close().await;
        assert!(!channel.path().exists());
        assert!(UnixStream::connect(channel.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_channel_name_is_unique() {
        let dir = tempfile::tempdir().unwrap();
        let a = IpcChannel::new(NotificationBus::new(), dir.path());
        let b = IpcChannel::new(NotificationBus::new(), dir.path());
        assert_ne!(a.name(), b.name());
        assert!(a.name().starts_with("devmon-"));
    }
}
