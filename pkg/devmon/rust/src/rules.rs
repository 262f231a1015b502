// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use glob_match::glob_match;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};

/// Task-list entry that turns into a hard restart instead of a command.
pub const HARD_RELOAD_TASK: &str = "__hard_reload";
/// Task-list entry that turns into a soft restart instead of a command.
pub const SOFT_RELOAD_TASK: &str = "__soft_reload";

const DEFAULT_EXCLUDES: &[&str] = &[".git"];

/// A glob bound to the tasks that regenerate something when it matches.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GeneratedRule {
    pub pattern: String,
    pub tasks: Vec<String>,
}

/// What to do about one changed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartAction {
    Ignore,
    HardRestart,
    SoftRestart,
    RunGeneratedTasks(Vec<String>),
    RunOnEnvFileChange,
    Unhandled,
}

/// Restart rules, loaded once and shared read-only by every file event.
///
/// Patterns without a `/` are matched against the file name; patterns with
/// one are matched against the path relative to the project root.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RestartRules {
    #[serde(default)]
    pub hard_reload: Vec<String>,
    #[serde(default)]
    pub soft_reload: Vec<String>,
    #[serde(default)]
    pub generated: Vec<GeneratedRule>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub env_files: Vec<String>,
}

impl RestartRules {
    /// Classify a changed path. Categories are tried in a fixed order and
    /// the first match wins: excludes, hard globs, soft globs, generated
    /// globs, env files, then unhandled.
    pub fn classify(&self, path: &Path, root: &Path) -> RestartAction {
        let rel = relative_path(path, root);
        let rel_str = slash_path(&rel);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if self.is_excluded(&rel) {
            return RestartAction::Ignore;
        }

        let matches = |pattern: &str| {
            if pattern.contains('/') {
                glob_match(pattern, &rel_str)
            } else {
                glob_match(pattern, &file_name)
            }
        };

        if self.hard_reload.iter().any(|p| matches(p)) {
            return RestartAction::HardRestart;
        }
        if self.soft_reload.iter().any(|p| matches(p)) {
            return RestartAction::SoftRestart;
        }
        if let Some(rule) = self.generated.iter().find(|r| matches(&r.pattern)) {
            return RestartAction::RunGeneratedTasks(rule.tasks.clone());
        }
        if self.is_env_file(&rel, &file_name) {
            return RestartAction::RunOnEnvFileChange;
        }
        RestartAction::Unhandled
    }

    fn is_excluded(&self, rel: &Path) -> bool {
        DEFAULT_EXCLUDES
            .iter()
            .copied()
            .chain(self.exclude_paths.iter().map(String::as_str))
            .map(|e| e.trim_end_matches('/'))
            .filter(|e| !e.is_empty())
            .any(|e| rel.starts_with(e))
    }

    fn is_env_file(&self, rel: &Path, file_name: &str) -> bool {
        self.env_files.iter().any(|env| {
            let env = Path::new(env);
            if env.components().count() > 1 {
                rel == env
            } else {
                env.as_os_str() == file_name
            }
        })
    }
}

/// Path of `path` relative to `root`, or `path` itself when it lies outside.
pub fn relative_path(path: &Path, root: &Path) -> PathBuf {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn slash_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
