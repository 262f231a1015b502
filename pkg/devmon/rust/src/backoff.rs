// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::Deserialize;
use std::time::Duration;

fn default_initial_ms() -> u64 {
    50
}

fn default_max_ms() -> u64 {
    5_000
}

fn default_max_elapsed_ms() -> u64 {
    60_000
}

/// Floor for the first interval. A zero interval would never add to the
/// elapsed total, so the ceiling could never trip.
const MIN_INITIAL: Duration = Duration::from_millis(1);

/// Crash-loop retry policy. The wait before the n-th consecutive restart is
/// `min(initial * 2^(n-1), max)`; once the waits add up past `max_elapsed`
/// the supervisor gives up.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            max_elapsed_ms: default_max_elapsed_ms(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffState {
    initial: Duration,
    max: Duration,
    max_elapsed: Duration,
    current: Duration,
    elapsed: Duration,
    attempts: u32,
}

impl BackoffState {
    pub fn new(config: &BackoffConfig) -> Self {
        let initial = Duration::from_millis(config.initial_ms).max(MIN_INITIAL);
        Self {
            initial,
            max: Duration::from_millis(config.max_ms).max(initial),
            max_elapsed: Duration::from_millis(config.max_elapsed_ms),
            current: initial,
            elapsed: Duration::ZERO,
            attempts: 0,
        }
    }

    /// Consume the next retry interval. Returns `None` once the cumulative
    /// wait would exceed the ceiling.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.current;
        let elapsed = self.elapsed.saturating_add(delay);
        if elapsed > self.max_elapsed {
            return None;
        }
        self.elapsed = elapsed;
        self.attempts = self.attempts.saturating_add(1);
        self.current = self.current.saturating_mul(2).min(self.max);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.elapsed = Duration::ZERO;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}
