// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No child process. Initial state and the end of every cycle.
    Stopped,
    /// Pre-start tasks and spawn in progress.
    Starting,
    /// Child process is alive.
    Started,
    /// Termination requested or exit observed, waiting for confirmation.
    Stopping,
}

impl SupervisorState {
    pub fn is_alive(self) -> bool {
        self == SupervisorState::Started
    }

    pub(crate) fn can_transition_to(self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Started)
                | (Starting, Stopped)
                | (Started, Stopping)
                | (Stopping, Stopped)
        )
    }

    fn as_u8(self) -> u8 {
        match self {
            SupervisorState::Stopped => 0,
            SupervisorState::Starting => 1,
            SupervisorState::Started => 2,
            SupervisorState::Stopping => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => SupervisorState::Starting,
            2 => SupervisorState::Started,
            3 => SupervisorState::Stopping,
            _ => SupervisorState::Stopped,
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Stopped => write!(f, "stopped"),
            SupervisorState::Starting => write!(f, "starting"),
            SupervisorState::Started => write!(f, "started"),
            SupervisorState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Lock-free holder for the supervisor state. Readers get a snapshot without
/// touching the process lock; writers go through [`AtomicState::transition`]
/// so only legal edges are taken.
#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new(initial: SupervisorState) -> Self {
        Self(AtomicU8::new(initial.as_u8()))
    }

    pub(crate) fn get(&self) -> SupervisorState {
        SupervisorState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to` if the current state is `from` and the edge is
    /// legal. Returns the state observed when the swap failed.
    pub(crate) fn transition(
        &self,
        from: SupervisorState,
        to: SupervisorState,
    ) -> Result<(), SupervisorState> {
        if !from.can_transition_to(to) {
            return Err(self.get());
        }
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(SupervisorState::from_u8)
    }
}
