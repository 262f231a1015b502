// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::bus::NotificationSink;
use crate::notification::{Notification, NotificationKind, OutputStream};
use anyhow::{Context, Result};
use log::{error, info, warn};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Echoes child output to the terminal and lifecycle events to the log.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    fn write_line(stream: OutputStream, line: &str) {
        let _ = match stream {
            OutputStream::Stdout => writeln!(std::io::stdout().lock(), "{line}"),
            OutputStream::Stderr => writeln!(std::io::stderr().lock(), "{line}"),
        };
    }
}

impl NotificationSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn notify(&self, n: &Notification) {
        match n.kind {
            NotificationKind::StdOut => Self::write_line(OutputStream::Stdout, &n.message),
            NotificationKind::StdErr => Self::write_line(OutputStream::Stderr, &n.message),
            NotificationKind::OOBTaskOutput => Self::write_line(
                n.stream.unwrap_or(OutputStream::Stdout),
                &format!("[task] {}", n.message),
            ),
            NotificationKind::SystemError => error!("{}", n.message),
            NotificationKind::HardRestartRequested => info!("hard restart requested: {}", n.message),
            NotificationKind::SoftRestartRequested => info!("soft restart requested: {}", n.message),
            NotificationKind::SoftRestartCompleted => info!("soft restart completed: {}", n.message),
            NotificationKind::Shutdown if n.message.contains("unexpectedly") => {
                warn!("{}", n.message)
            }
            _ => info!("{}: {}", n.kind, n.message),
        }
    }
}

/// Appends every notification as one JSON object per line, for log stores
/// and dashboards that tail the file.
pub struct JsonLinesSink {
    out: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening notification log {}", path.display()))?;
        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl NotificationSink for JsonLinesSink {
    fn name(&self) -> &str {
        "json-lines"
    }

    fn notify(&self, n: &Notification) {
        let mut out = self
            .out
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = write_record(&mut *out, n) {
            warn!("failed to record notification {}: {e}", n.seq);
        }
    }
}

fn write_record<W: Write>(out: &mut W, n: &Notification) -> std::io::Result<()> {
    serde_json::to_writer(&mut *out, n)?;
    out.write_all(b"\n")?;
    out.flush()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::bus::NotificationBus;
    use crate::notification::ChildProcessId;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notifications.jsonl");
        let bus = NotificationBus::new();
        bus.register(Arc::new(JsonLinesSink::create(&path).unwrap()))
            .unwrap();

        let id = ChildProcessId::new();
        bus.notify(Notification::new(NotificationKind::Startup, Some(id), "started"));
        bus.notify(Notification::new(NotificationKind::StdOut, Some(id), "listening on :8080"));
        bus.close().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let records: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["kind"], "startup");
        assert_eq!(records[1]["message"], "listening on :8080");
        assert_eq!(records[1]["child_process_id"], id.to_string());
    }

    #[test]
    fn test_json_lines_sink_bad_path() {
        assert!(JsonLinesSink::create(Path::new("/nonexistent/dir/n.jsonl")).is_err());
    }

    #[test]
    fn test_console_sink_handles_every_kind() {
        let sink = ConsoleSink;
        for kind in [
            NotificationKind::Startup,
            NotificationKind::Shutdown,
            NotificationKind::SystemError,
            NotificationKind::OOBTaskOutput,
            NotificationKind::IpcConnected,
        ] {
            sink.notify(&Notification::new(kind, None, "x"));
        }
    }
}
