// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-job workspace directories.
//!
//! Every job gets `<workspaces>/<job_id>/` before its plugin spawns. When a
//! hop enqueues successors, the producer's directory is cloned per
//! successor: hard links file-by-file for O(1) cost, falling back to a byte
//! copy where the filesystem refuses links. A clone that still fails fails
//! only that successor's enqueue.

use ductile_core::JobId;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, job: &JobId) -> PathBuf {
        self.root.join(job.as_str())
    }

    /// Create the job's workspace directory if needed.
    pub fn ensure(&self, job: &JobId) -> io::Result<PathBuf> {
        let path = self.path_for(job);
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Clone the producer's workspace into the successor's.
    ///
    /// The source is created first if missing, so a producer that never
    /// touched its workspace still hands an (empty) directory downstream.
    pub fn clone_for(&self, producer: &JobId, successor: &JobId) -> io::Result<PathBuf> {
        let src = self.ensure(producer)?;
        let dst = self.path_for(successor);
        clone_tree(&src, &dst)?;
        debug!(
            producer = producer.short(8),
            successor = successor.short(8),
            "workspace cloned"
        );
        Ok(dst)
    }

    pub fn remove(&self, job: &JobId) -> io::Result<()> {
        let path = self.path_for(job);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }

    /// Remove workspaces that are not live and have not been touched since
    /// the cutoff. Returns the number of directories removed.
    pub fn sweep(&self, cutoff_ms: u64, live: &HashSet<String>) -> io::Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if live.contains(&name) {
                continue;
            }
            let mtime_ms = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(u64::MAX);
            if mtime_ms < cutoff_ms {
                if let Err(e) = fs::remove_dir_all(entry.path()) {
                    warn!(workspace = %name, error = %e, "failed to sweep workspace");
                } else {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Recursively mirror `src` into `dst`: directories recreated, symlinks
/// re-pointed, files hard-linked with a byte-copy fallback.
fn clone_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            clone_tree(&src_path, &dst_path)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &dst_path)?;
        } else if fs::hard_link(&src_path, &dst_path).is_err() {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "workspace_tests.rs"]
mod tests;
