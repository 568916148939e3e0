// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle: startup, reload, shutdown.
//!
//! Startup order: acquire the instance lock, open storage (snapshot + WAL
//! replay), recover orphans, compile the pipeline set, build the engine.
//! SIGHUP re-validates the config and swaps the pipeline set and scheduler
//! view atomically; a config that fails validation leaves the previous set
//! active. Shutdown flushes the WAL and writes a final synchronous
//! checkpoint so the next start needs no replay.

use ductile_adapters::ProcessPluginRunner;
use ductile_core::{Event, JobStatus, SystemClock};
use ductile_engine::{ConfigView, EngineCtx, EventBus, PluginCatalog, WorkspaceManager};
use ductile_pipeline::{compile_set, Config, ConfigError, PipelineSet, Router};
use ductile_storage::{Checkpointer, Store, StorePaths};
use fs2::FileExt;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// The engine as the daemon runs it: real subprocesses, real time.
pub type DaemonCtx = EngineCtx<ProcessPluginRunner, SystemClock>;

/// Filesystem layout under the configured state directory.
#[derive(Debug, Clone)]
pub struct Paths {
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub lock_path: PathBuf,
    pub log_path: PathBuf,
    pub wal_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub workspaces_path: PathBuf,
}

impl Paths {
    /// Derive the layout from a loaded config (`state.path` is the root).
    pub fn for_config(config: &Config, config_path: PathBuf) -> Self {
        let state_dir = config.state.path.clone();
        Self {
            lock_path: state_dir.join("ductile.lock"),
            log_path: state_dir.join("ductile.log"),
            wal_path: state_dir.join("wal").join("events.wal"),
            snapshot_path: state_dir.join("snapshot.bin"),
            workspaces_path: state_dir.join("workspaces"),
            state_dir,
            config_path,
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("could not determine state directory or config path")]
    NoStateDir,
    #[error("failed to read config {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid pipelines: {0}")]
    Pipelines(#[from] ductile_pipeline::CompileError),
    #[error("failed to acquire lock: daemon already running?")]
    LockFailed(#[source] std::io::Error),
    #[error("storage error: {0}")]
    Open(#[from] ductile_storage::OpenError),
    #[error("queue error: {0}")]
    Queue(#[from] ductile_storage::QueueError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running daemon's state.
pub struct DaemonState {
    pub paths: Paths,
    pub ctx: Arc<DaemonCtx>,
    // NOTE(lifetime): held to maintain the exclusive instance lock;
    // released on drop.
    #[allow(dead_code)]
    lock_file: File,
}

/// Read and validate the config file, compiling its pipelines.
pub fn load_config(path: &PathBuf) -> Result<(Config, PipelineSet), LifecycleError> {
    let raw = std::fs::read_to_string(path).map_err(|source| LifecycleError::ReadConfig {
        path: path.clone(),
        source,
    })?;
    let config = Config::from_yaml_str(&raw)?;
    let compiled = compile_set(&config.pipelines)?;
    Ok((config, PipelineSet::new(compiled)))
}

/// Start the daemon: lock, recover, build the engine.
pub fn startup(config_path: PathBuf) -> Result<DaemonState, LifecycleError> {
    let (config, pipeline_set) = load_config(&config_path)?;
    let paths = Paths::for_config(&config, config_path);

    std::fs::create_dir_all(&paths.state_dir)?;
    std::fs::create_dir_all(&paths.workspaces_path)?;

    // Lock before touching storage; avoid truncating the file before the
    // lock is held so a running daemon's PID is never wiped.
    let mut lock_file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&paths.lock_path)?;
    lock_file
        .try_lock_exclusive()
        .map_err(LifecycleError::LockFailed)?;
    lock_file.set_len(0)?;
    writeln!(lock_file, "{}", std::process::id())?;

    // Recover storage: snapshot + WAL tail.
    let (store, report) = Store::open(&StorePaths {
        wal_path: paths.wal_path.clone(),
        snapshot_path: paths.snapshot_path.clone(),
    })?;
    info!(
        snapshot_seq = report.snapshot_seq,
        replayed = report.replayed_events,
        queued = report.queued_jobs,
        running = report.running_jobs,
        "storage recovered"
    );

    let bus = EventBus::default();

    // Every running job is an orphan: no other process holds the lock.
    let clock = SystemClock;
    let now_ms = ductile_core::Clock::epoch_ms(&clock);
    for recovered in store.recover_orphans(now_ms)? {
        info!(
            job = recovered.job_id.short(8),
            plugin = %recovered.plugin,
            requeued = recovered.requeued,
            "orphan recovered"
        );
        bus.publish(Event::JobRecovered {
            id: recovered.job_id,
            requeued: recovered.requeued,
            attempt: recovered.attempt,
        });
    }

    let (catalog, refused) = PluginCatalog::load(&config.plugin_roots, &config.plugins);
    for (plugin, error) in &refused {
        warn!(plugin = %plugin, error = %error, "plugin refused");
    }
    info!(
        plugins = catalog.len(),
        refused = refused.len(),
        pipelines = pipeline_set.len(),
        "configuration loaded"
    );

    let router = Router::new(pipeline_set);
    let ctx = EngineCtx::new(
        store,
        bus,
        router,
        WorkspaceManager::new(paths.workspaces_path.clone()),
        ProcessPluginRunner,
        clock,
        ConfigView {
            config: Arc::new(config),
            catalog: Arc::new(catalog),
        },
    );

    Ok(DaemonState {
        paths,
        ctx,
        lock_file,
    })
}

impl DaemonState {
    /// SIGHUP: validate the new config and swap atomically.
    ///
    /// On any error the previous config and pipeline set stay active.
    /// Queued jobs for plugins that disappeared become dead with reason
    /// `plugin_removed`; the in-flight job keeps its config snapshot.
    pub fn reload(&self) -> Result<(), LifecycleError> {
        let (config, pipeline_set) = load_config(&self.paths.config_path)?;

        let (catalog, refused) = PluginCatalog::load(&config.plugin_roots, &config.plugins);
        for (plugin, error) in &refused {
            warn!(plugin = %plugin, error = %error, "plugin refused on reload");
        }

        let known: Vec<String> = config.plugins.keys().cloned().collect();

        self.ctx.router.swap(pipeline_set);
        self.ctx.swap_view(ConfigView {
            config: Arc::new(config),
            catalog: Arc::new(catalog),
        });

        let now_ms = ductile_core::Clock::epoch_ms(&self.ctx.clock);
        for job in self.ctx.store.dead_removed_plugins(&known, now_ms)? {
            warn!(job = job.id.short(8), plugin = %job.plugin, "queued job dead: plugin removed");
            self.ctx.bus.publish(Event::JobDead {
                id: job.id,
                status: JobStatus::Queued,
                error: "plugin_removed".to_string(),
                completed_at_ms: now_ms,
                stderr_tail: String::new(),
                raw_stdout: None,
            });
        }

        self.ctx.scheduler_wake.notify_one();
        info!("config reloaded");
        Ok(())
    }

    /// Graceful shutdown: stop intake, flush, final checkpoint, release
    /// the lock's files. The cancellation token must already be cancelled
    /// and the loops joined before calling this.
    pub fn shutdown(&self) {
        info!("shutting down");

        if let Err(e) = self.ctx.store.flush() {
            warn!(error = %e, "failed to flush WAL on shutdown");
        }

        let (seq, state) = self.ctx.store.checkpoint_snapshot();
        if seq > 0 {
            let checkpointer = Checkpointer::new(self.paths.snapshot_path.clone());
            match checkpointer.checkpoint_sync(seq, &state) {
                Ok(result) => {
                    info!(seq = result.seq, size_bytes = result.size_bytes, "final snapshot saved");
                    if let Err(e) = self.ctx.store.truncate_wal_through(seq) {
                        warn!(error = %e, "failed to truncate WAL after final snapshot");
                    }
                }
                Err(e) => warn!(error = %e, "failed to save shutdown snapshot"),
            }
        }

        if self.paths.lock_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.paths.lock_path) {
                warn!(error = %e, "failed to remove lock file");
            }
        }

        info!("shutdown complete");
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
