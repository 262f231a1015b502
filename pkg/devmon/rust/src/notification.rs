// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identity of one spawned child. Minted per spawn and never reused, so
/// output and IPC traffic from different runs can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ChildProcessId(Uuid);

impl ChildProcessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChildProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChildProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Startup,
    Shutdown,
    HardRestartRequested,
    SoftRestartRequested,
    HardRestartCompleted,
    SoftRestartCompleted,
    #[serde(rename = "oob_task_started")]
    OOBTaskStarted,
    #[serde(rename = "oob_task_output")]
    OOBTaskOutput,
    #[serde(rename = "stdout")]
    StdOut,
    #[serde(rename = "stderr")]
    StdErr,
    SystemError,
    IpcConnected,
    IpcDisconnected,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationKind::Startup => "startup",
            NotificationKind::Shutdown => "shutdown",
            NotificationKind::HardRestartRequested => "hard-restart-requested",
            NotificationKind::SoftRestartRequested => "soft-restart-requested",
            NotificationKind::HardRestartCompleted => "hard-restart-completed",
            NotificationKind::SoftRestartCompleted => "soft-restart-completed",
            NotificationKind::OOBTaskStarted => "oob-task-started",
            NotificationKind::OOBTaskOutput => "oob-task-output",
            NotificationKind::StdOut => "stdout",
            NotificationKind::StdErr => "stderr",
            NotificationKind::SystemError => "system-error",
            NotificationKind::IpcConnected => "ipc-connected",
            NotificationKind::IpcDisconnected => "ipc-disconnected",
        };
        f.write_str(s)
    }
}

/// Which output stream a line of task output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A lifecycle or output event. Immutable once built; sinks receive it
/// behind an `Arc` and must not expect to mutate it.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub seq: u64,
    #[serde(serialize_with = "serialize_rfc3339")]
    pub at: SystemTime,
    pub child_process_id: Option<ChildProcessId>,
    pub kind: NotificationKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<OutputStream>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        child_process_id: Option<ChildProcessId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            at: SystemTime::now(),
            child_process_id,
            kind,
            message: message.into(),
            stream: None,
        }
    }

    pub fn with_stream(mut self, stream: OutputStream) -> Self {
        self.stream = Some(stream);
        self
    }
}

fn serialize_rfc3339<S: serde::Serializer>(at: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    let formatted = OffsetDateTime::from(*at)
        .format(&Rfc3339)
        .map_err(serde::ser::Error::custom)?;
    s.serialize_str(&formatted)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_child_process_ids_are_unique() {
        assert_ne!(ChildProcessId::new(), ChildProcessId::new());
    }

    #[test]
    fn test_seq_is_monotonic() {
        let a = Notification::new(NotificationKind::Startup, None, "a");
        let b = Notification::new(NotificationKind::Shutdown, None, "b");
        assert!(b.seq > a.seq);
    }

    #[test]
    fn test_serializes_for_external_consumers() {
        let id = ChildProcessId::new();
        let n = Notification::new(NotificationKind::OOBTaskOutput, Some(id), "built")
            .with_stream(OutputStream::Stderr);
        let v: serde_json::Value = serde_json::to_value(&n).unwrap();
        assert_eq!(v["kind"], "oob_task_output");
        assert_eq!(v["child_process_id"], id.to_string());
        assert_eq!(v["message"], "built");
        assert_eq!(v["stream"], "stderr");
        assert!(v["at"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_stream_omitted_when_absent() {
        let n = Notification::new(NotificationKind::StdOut, None, "line");
        let v: serde_json::Value = serde_json::to_value(&n).unwrap();
        assert!(v.get("stream").is_none());
        assert_eq!(v["kind"], "stdout");
    }
}
