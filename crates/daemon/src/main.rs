// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ductile daemon (ductiled)
//!
//! Background process that owns the work queue and dispatches plugins.
//!
//! Architecture:
//! - Scheduler task: ticks schedules into the queue
//! - Dispatcher task: serial dequeue → spawn → route loop
//! - Background tasks: WAL group-commit flush, periodic checkpoint,
//!   retention prune, bus-to-log relay

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod env;
mod lifecycle;

use crate::lifecycle::{DaemonState, LifecycleError};
use ductile_engine::{run_prune, Dispatcher, Scheduler};
use ductile_storage::Checkpointer;
use std::path::Path;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle info flags before any config/lock acquisition
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" | "-v" => {
                println!("ductiled {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                println!("ductiled {}", env!("CARGO_PKG_VERSION"));
                println!("Ductile daemon - runs scheduled polls and routes plugin events");
                println!();
                println!("USAGE:");
                println!("    ductiled");
                println!();
                println!("Configuration is read from $DUCTILE_CONFIG (default:");
                println!("$DUCTILE_STATE_DIR/ductile.yaml). Send SIGHUP to reload it.");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help       Print help information");
                println!("    -v, --version    Print version information");
                return Ok(());
            }
            _ => {
                eprintln!("error: unexpected argument '{arg}'");
                eprintln!("Usage: ductiled [--help | --version]");
                std::process::exit(1);
            }
        }
    }

    let config_path = env::config_path().ok_or(LifecycleError::NoStateDir)?;

    // Resolve paths (and surface config errors) before anything else so
    // logging is live for the recovery sequence.
    let paths = match lifecycle::load_config(&config_path) {
        Ok((config, _)) => lifecycle::Paths::for_config(&config, config_path.clone()),
        Err(e) => {
            eprintln!("error: failed to start: {e}");
            return Err(e.into());
        }
    };
    std::fs::create_dir_all(&paths.state_dir)?;
    rotate_log_if_needed(&paths.log_path);
    let _log_guard = setup_logging(&paths)?;
    info!("daemon starting (pid {})", std::process::id());

    let daemon = match lifecycle::startup(config_path) {
        Ok(daemon) => daemon,
        Err(LifecycleError::LockFailed(_)) => {
            eprintln!("ductiled is already running");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("error: failed to start: {e}");
            error!(error = %e, "failed to start daemon");
            return Err(e.into());
        }
    };

    spawn_flush_task(&daemon);
    spawn_checkpoint_task(&daemon);
    spawn_retention_task(&daemon);
    spawn_bus_logger(&daemon);

    let scheduler = Scheduler::new(daemon.ctx.clone());
    let scheduler_handle = tokio::spawn(scheduler.run());

    let dispatcher = Dispatcher::new(daemon.ctx.clone());
    let mut dispatcher_handle = tokio::spawn(dispatcher.run());

    // Kick the first tick rather than waiting a full interval.
    daemon.ctx.scheduler_wake.notify_one();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    info!("daemon ready");
    println!("READY");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading config");
                if let Err(e) = daemon.reload() {
                    error!(error = %e, "reload failed, previous config stays active");
                }
            }
            result = &mut dispatcher_handle => {
                // The dispatcher only exits early on a fatal storage error;
                // exit so the supervisor and lock can recover on restart.
                match result {
                    Ok(Err(e)) => error!(error = %e, "dispatcher failed, exiting"),
                    Err(e) => error!(error = %e, "dispatcher panicked, exiting"),
                    Ok(Ok(())) => {}
                }
                daemon.ctx.shutdown.cancel();
                daemon.shutdown();
                std::process::exit(1);
            }
        }
    }

    // Stop intake, drain the in-flight job, then persist and release.
    daemon.ctx.shutdown.cancel();
    let _ = scheduler_handle.await;
    match dispatcher_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "dispatcher error during shutdown"),
        Err(e) => error!(error = %e, "dispatcher join error during shutdown"),
    }
    daemon.shutdown();
    info!("daemon stopped");
    Ok(())
}

/// Flush interval for group commit (~10ms durability window)
const FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Spawn a task that periodically flushes buffered WAL entries.
fn spawn_flush_task(daemon: &DaemonState) {
    let store = daemon.ctx.store.clone();
    let shutdown = daemon.ctx.shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            if store.needs_flush() {
                if let Err(e) = store.flush() {
                    error!(error = %e, "failed to flush WAL");
                }
            }
        }
    });
}

/// Checkpoint interval (60 seconds)
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn a task that periodically snapshots state and truncates the WAL.
///
/// Truncation happens only after the snapshot is fully durable (tmp write,
/// fsync, rename, directory fsync), so a crash mid-checkpoint never loses
/// events.
fn spawn_checkpoint_task(daemon: &DaemonState) {
    let store = daemon.ctx.store.clone();
    let shutdown = daemon.ctx.shutdown.clone();
    let checkpointer = Checkpointer::new(daemon.paths.snapshot_path.clone());

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CHECKPOINT_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => return,
            }

            let (seq, state) = store.checkpoint_snapshot();
            if seq == 0 {
                continue;
            }

            let handle = checkpointer.start(seq, state);
            let result = tokio::task::spawn_blocking(move || handle.wait()).await;
            match result {
                Ok(Ok(checkpoint)) => {
                    tracing::debug!(
                        seq = checkpoint.seq,
                        size_bytes = checkpoint.size_bytes,
                        "checkpoint complete"
                    );
                    if let Err(e) = store.truncate_wal_through(seq) {
                        warn!(error = %e, "failed to truncate WAL after checkpoint");
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "checkpoint failed, WAL not truncated"),
                Err(e) => warn!(error = %e, "checkpoint task panicked"),
            }
        }
    });
}

/// Retention pass interval (hourly).
const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Spawn the ledger prune + workspace sweep task.
fn spawn_retention_task(daemon: &DaemonState) {
    let store = daemon.ctx.store.clone();
    let workspaces = daemon.ctx.workspaces.clone();
    let ctx = daemon.ctx.clone();
    let shutdown = daemon.ctx.shutdown.clone();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RETENTION_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            let retention = ctx.view().config.service.job_log_retention;
            let now_ms = ductile_core::Clock::epoch_ms(&ctx.clock);
            if let Err(e) = run_prune(&store, &workspaces, retention, now_ms) {
                warn!(error = %e, "retention pass failed");
            }
        }
    });
}

/// Relay bus events into the daemon log at debug level.
fn spawn_bus_logger(daemon: &DaemonState) {
    let mut subscription = daemon.ctx.bus.subscribe();
    let shutdown = daemon.ctx.shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = subscription.recv() => {
                    match event {
                        Some(event) => tracing::debug!(event = %event.log_summary(), "bus"),
                        None => return,
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    });
}

/// Maximum log file size before rotation (10 MB).
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Number of rotated log files to keep.
const MAX_ROTATED_LOGS: u32 = 3;

/// Rotate the daemon log if it exceeds [`MAX_LOG_SIZE`].
///
/// Shifts `ductile.log` → `.1` → `.2` → `.3`, deleting the oldest.
/// Best-effort: rotation failures never block startup.
fn rotate_log_if_needed(log_path: &Path) {
    let size = match std::fs::metadata(log_path) {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    if size < MAX_LOG_SIZE {
        return;
    }

    let log_str = log_path.display().to_string();
    for i in (1..MAX_ROTATED_LOGS).rev() {
        let from = format!("{log_str}.{i}");
        let to = format!("{log_str}.{}", i + 1);
        let _ = std::fs::rename(&from, &to);
    }
    let _ = std::fs::rename(log_path, format!("{log_str}.1"));
}

fn setup_logging(
    paths: &lifecycle::Paths,
) -> Result<tracing_appender::non_blocking::WorkerGuard, LifecycleError> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let log_path = &paths.log_path;
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file_appender = tracing_appender::rolling::never(
        log_path.parent().ok_or(LifecycleError::NoStateDir)?,
        log_path.file_name().ok_or(LifecycleError::NoStateDir)?,
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    Ok(guard)
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
