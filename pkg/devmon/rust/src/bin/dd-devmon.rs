// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use anyhow::{Context, Result};
use clap::Parser;
use dd_devmon::config::{self, SupervisorConfig};
use dd_devmon::sinks::{ConsoleSink, JsonLinesSink};
use dd_devmon::{NotificationBus, Supervisor};
use log::{info, warn};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

/// Run a command and restart it when project files change.
///
/// Changed paths are read from stdin, one per line, e.g.
/// `inotifywait -m -r -e close_write --format %w%f . | dd-devmon -- go run .`
#[derive(Parser, Debug)]
#[command(name = "dd-devmon", version)]
struct Args {
    /// Config file (defaults to devmon.yaml in the root directory).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Project root directory.
    #[arg(short = 'd', long, default_value = ".")]
    root: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: log::Level,

    /// Also append every notification as JSON to this file.
    #[arg(long)]
    notification_log: Option<PathBuf>,

    /// Command to supervise, overriding the config file.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn load(args: &Args) -> Result<SupervisorConfig> {
    let explicit = args.config.clone().or_else(config::config_path_from_env);
    let mut cfg = config::load_config(explicit.as_deref(), &args.root)?;
    if let Some((command, rest)) = args.command.split_first() {
        cfg.command = command.clone();
        cfg.args = rest.to_vec();
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Read changed paths from stdin on a plain thread. A read blocked on an
/// open pipe must not hold up runtime shutdown, which a blocking-pool read
/// would.
fn spawn_stdin_reader() -> std::io::Result<mpsc::UnboundedReceiver<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("devmon-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("reading file change feed: {e}");
                        return;
                    }
                }
            }
            info!("file change feed closed");
        })?;
    Ok(rx)
}

async fn feed_file_changes(supervisor: Arc<Supervisor>, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let path = absolute(Path::new(line), &supervisor.config().root_directory);
        if let Err(e) = supervisor.handle_file_change(&path).await {
            warn!("handling change to {}: {e}", path.display());
        }
    }
}

fn absolute(path: &Path, root: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    simple_logger::init_with_level(args.log_level)?;
    info!("dd-devmon starting (version {})", env!("CARGO_PKG_VERSION"));

    let cfg = load(&args)?;
    info!(
        "supervising `{}` in {}",
        cfg.command_line(),
        cfg.root_directory.display()
    );

    let bus = NotificationBus::new();
    bus.register(Arc::new(ConsoleSink))
        .context("starting console sink")?;
    if let Some(path) = &args.notification_log {
        bus.register(Arc::new(JsonLinesSink::create(path)?))
            .context("starting notification log sink")?;
    }

    let supervisor = Arc::new(Supervisor::new(cfg, bus.clone()));
    let mut cycle = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.start().await }
    });
    let changes = spawn_stdin_reader().context("starting file change reader")?;
    let feed = tokio::spawn(feed_file_changes(Arc::clone(&supervisor), changes));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    let outcome = loop {
        tokio::select! {
            result = &mut cycle => break result,
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break shutdown(&supervisor, &mut cycle).await;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                break shutdown(&supervisor, &mut cycle).await;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, soft restart");
                supervisor.soft_restart("SIGHUP").await;
            }
            _ = sigusr1.recv() => {
                info!("received SIGUSR1, hard restart");
                if let Err(e) = supervisor.hard_restart("SIGUSR1").await {
                    warn!("hard restart failed: {e}");
                }
            }
        }
    };

    feed.abort();
    if let Err(e) = supervisor.shutdown().await {
        warn!("shutdown: {e}");
    }
    bus.close().await;

    match outcome {
        Ok(Ok(())) => {
            info!("dd-devmon shutting down");
            Ok(())
        }
        Ok(Err(e)) => Err(e).context("supervisor stopped"),
        Err(e) => Err(e).context("supervisor task failed"),
    }
}

async fn shutdown(
    supervisor: &Supervisor,
    cycle: &mut tokio::task::JoinHandle<Result<(), dd_devmon::SupervisorError>>,
) -> Result<Result<(), dd_devmon::SupervisorError>, tokio::task::JoinError> {
    if let Err(e) = supervisor.shutdown().await {
        warn!("shutdown: {e}");
    }
    cycle.await
}
