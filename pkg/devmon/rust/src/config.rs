// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::backoff::BackoffConfig;
use crate::rules::RestartRules;
use anyhow::{Context, Result, bail};
use log::{info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "devmon.yaml";

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_kill_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_root")]
    pub root_directory: PathBuf,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Commands run in order before every spawn.
    #[serde(default)]
    pub prestart: Vec<String>,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Treat files no rule matched as a hard restart.
    #[serde(default)]
    pub reload_on_unhandled: bool,
    #[serde(flatten)]
    pub rules: RestartRules,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            root_directory: default_root(),
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            prestart: Vec::new(),
            kill_timeout_ms: default_kill_timeout_ms(),
            backoff: BackoffConfig::default(),
            reload_on_unhandled: false,
            rules: RestartRules::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            bail!("a command to supervise is required");
        }
        if self.kill_timeout_ms == 0 {
            bail!("kill_timeout_ms must be greater than zero");
        }
        if self.backoff.initial_ms == 0 {
            bail!("backoff.initial_ms must be greater than zero");
        }
        if self.backoff.max_elapsed_ms == 0 {
            bail!("backoff.max_elapsed_ms must be greater than zero");
        }
        Ok(())
    }
}

/// Config file named by `DD_DEVMON_CONFIG`, if set.
pub fn config_path_from_env() -> Option<PathBuf> {
    std::env::var_os("DD_DEVMON_CONFIG").map(PathBuf::from)
}

/// Load the configuration. An explicitly named file must exist; otherwise
/// `devmon.yaml` under `root` is used when present and defaults when not.
/// A relative `root_directory` in the file is resolved against `root`.
pub fn load_config(explicit: Option<&Path>, root: &Path) -> Result<SupervisorConfig> {
    let mut config = match explicit {
        Some(path) => parse_config(path)?,
        None => {
            let path = root.join(DEFAULT_CONFIG_FILE);
            if path.exists() {
                parse_config(&path)?
            } else {
                warn!("no config file at {}, using defaults", path.display());
                SupervisorConfig::default()
            }
        }
    };

    if config.root_directory.is_relative() {
        config.root_directory = root.join(&config.root_directory);
    }
    config.root_directory = config
        .root_directory
        .canonicalize()
        .with_context(|| format!("resolving root directory {}", config.root_directory.display()))?;
    Ok(config)
}

fn parse_config(path: &Path) -> Result<SupervisorConfig> {
    info!("loading config from {}", path.display());
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: SupervisorConfig =
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}
