// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background checkpointing with zstd compression and durable fsync.
//!
//! The key invariant: the snapshot must be fully durable (including the
//! directory fsync that makes the rename stick across power loss) before
//! the WAL is truncated. The checkpoint thread reports completion through
//! a channel; callers wait on the handle before truncating.

use crate::migration::MigrationRegistry;
use crate::{MaterializedState, Snapshot, SnapshotError, CURRENT_SNAPSHOT_VERSION};
use serde_json::Value;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use thiserror::Error;
use tracing::warn;

/// zstd level 3 balances speed and ratio for snapshot-sized payloads.
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("compression error: {0}")]
    Compress(String),
    #[error("checkpoint failed: {0}")]
    Failed(String),
}

/// Result of a completed checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointResult {
    pub seq: u64,
    pub size_bytes: u64,
}

/// Handle to a checkpoint running on a background thread.
pub struct CheckpointHandle {
    pub seq: u64,
    receiver: mpsc::Receiver<Result<CheckpointResult, CheckpointError>>,
}

impl CheckpointHandle {
    /// Block until the snapshot is fully durable. Only after this returns
    /// successfully is it safe to truncate the WAL.
    pub fn wait(self) -> Result<CheckpointResult, CheckpointError> {
        self.receiver
            .recv()
            .map_err(|_| CheckpointError::Failed("checkpoint thread panicked".into()))?
    }
}

/// Writes snapshots for the store.
pub struct Checkpointer {
    snapshot_path: PathBuf,
}

impl Checkpointer {
    pub fn new(snapshot_path: PathBuf) -> Self {
        Self { snapshot_path }
    }

    /// Start a background checkpoint of the given state at `seq`.
    pub fn start(&self, seq: u64, state: MaterializedState) -> CheckpointHandle {
        let path = self.snapshot_path.clone();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(write_snapshot(&path, seq, &state));
        });
        CheckpointHandle { seq, receiver: rx }
    }

    /// Synchronous checkpoint, used on shutdown.
    pub fn checkpoint_sync(
        &self,
        seq: u64,
        state: &MaterializedState,
    ) -> Result<CheckpointResult, CheckpointError> {
        write_snapshot(&self.snapshot_path, seq, state)
    }
}

/// Serialize, compress, and durably place the snapshot file.
fn write_snapshot(
    path: &Path,
    seq: u64,
    state: &MaterializedState,
) -> Result<CheckpointResult, CheckpointError> {
    let snapshot = Snapshot::new(seq, state.clone());
    let json_bytes = serde_json::to_vec(&snapshot)?;
    let compressed = zstd::encode_all(json_bytes.as_slice(), COMPRESSION_LEVEL)
        .map_err(|e| CheckpointError::Compress(e.to_string()))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");

    // tmp write + fsync, atomic rename, then directory fsync: the ordering
    // that keeps WAL truncation safe.
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&compressed)?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }

    Ok(CheckpointResult {
        seq,
        size_bytes: compressed.len() as u64,
    })
}

/// Load a zstd-compressed snapshot, migrating older schema versions.
///
/// Returns `Ok(None)` when the file does not exist or is unreadable; a
/// corrupt snapshot is rotated to `.bak` so recovery proceeds from the WAL.
pub fn load_snapshot(path: &Path) -> Result<Option<Snapshot>, SnapshotError> {
    if !path.exists() {
        return Ok(None);
    }

    let file = File::open(path)?;
    let parsed: Result<Value, SnapshotError> = zstd::stream::read::Decoder::new(file)
        .map_err(|e| SnapshotError::Io(std::io::Error::other(e.to_string())))
        .and_then(|decoder| Ok(serde_json::from_reader(decoder)?));

    let value = match parsed {
        Ok(value) => value,
        Err(e) => {
            let bak_path = crate::snapshot::rotate_bak_path(path);
            warn!(
                error = %e,
                path = %path.display(),
                bak = %bak_path.display(),
                "corrupt snapshot, moving to .bak and recovering from WAL",
            );
            std::fs::rename(path, &bak_path)?;
            return Ok(None);
        }
    };

    let registry = MigrationRegistry::new();
    let migrated = registry.migrate_to(value, CURRENT_SNAPSHOT_VERSION)?;
    let snapshot: Snapshot = serde_json::from_value(migrated)?;
    Ok(Some(snapshot))
}

#[cfg(test)]
#[path = "checkpoint_tests.rs"]
mod tests;
