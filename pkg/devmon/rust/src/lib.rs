// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Development-time process supervisor.
//!
//! A [`Supervisor`] owns one child command, restarts it when project files
//! change (as decided by the [`RestartRules`] classifier), recovers from
//! crashes with exponential backoff, and coordinates partial reloads with a
//! cooperating child over a local IPC socket. Lifecycle and output events are
//! fanned out to registered sinks through the [`NotificationBus`].

// Correctness
#![deny(clippy::cast_possible_wrap)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

pub mod backoff;
pub mod bus;
pub mod config;
pub mod env;
pub mod errors;
pub mod ipc;
pub mod notification;
pub mod process;
pub mod rules;
pub mod sinks;
pub mod state;
pub mod supervisor;

pub use bus::{NotificationBus, NotificationSink, SinkId};
pub use config::SupervisorConfig;
pub use errors::SupervisorError;
pub use notification::{ChildProcessId, Notification, NotificationKind};
pub use rules::{RestartAction, RestartRules};
pub use state::SupervisorState;
pub use supervisor::{Supervisor, SupervisorStatus};
