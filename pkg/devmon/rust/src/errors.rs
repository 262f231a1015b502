// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::state::SupervisorState;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SupervisorState,
    },
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("prestart task failed: {0}")]
    Prestart(#[source] Box<SupervisorError>),
    #[error("task `{task}` failed: {reason}")]
    TaskFailed { task: String, reason: String },
    #[error("gave up restarting after {attempts} attempts ({elapsed:?} of backoff)")]
    BackoffExhausted { attempts: u32, elapsed: Duration },
    #[error("failed to kill process group {pgid}: {source}")]
    KillFailed {
        pgid: i32,
        #[source]
        source: nix::Error,
    },
    #[error("ipc: {0}")]
    Ipc(#[from] IpcError),
}

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("no child connected")]
    Disconnected,
    #[error("failed to bind {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),
    #[error("write timed out")]
    WriteTimeout,
    #[error("encoding message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("notification sinks need a tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}
