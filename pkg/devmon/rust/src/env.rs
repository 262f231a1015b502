// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use log::warn;
use std::collections::HashMap;
use std::path::Path;

/// Parse a dotenv-style file into key-value pairs.
/// Supports `KEY=VALUE`, `KEY="VALUE"`, `KEY='VALUE'`, an optional `export `
/// prefix, comments (#), and blank lines.
pub fn parse_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading env file: {}", path.display()))?;
    let mut vars = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        if let Some((key, raw_val)) = trimmed.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let val = raw_val
                .trim()
                .trim_matches('"')
                .trim_matches('\'')
                .to_string();
            vars.push((key.to_string(), val));
        }
    }
    Ok(vars)
}

/// Build the child environment: the supervisor's own environment, then
/// `overrides`, then each env file under `root` in order. Unreadable env
/// files are logged and skipped so a half-edited `.env` doesn't stop a
/// restart.
pub fn build_child_env(
    root: &Path,
    overrides: &HashMap<String, String>,
    env_files: &[String],
) -> Vec<(String, String)> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

    for file in env_files {
        let path = root.join(file);
        match parse_env_file(&path) {
            Ok(vars) => env.extend(vars),
            Err(e) => warn!("skipping env file {}: {e:#}", path.display()),
        }
    }

    let mut vars: Vec<_> = env.into_iter().collect();
    vars.sort();
    vars
}
