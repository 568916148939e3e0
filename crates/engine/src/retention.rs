// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic retention: prune the ledger and sweep dead workspaces.

use crate::workspace::WorkspaceManager;
use ductile_core::JobStatus;
use ductile_storage::{QueueError, Store};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};

/// One retention pass. Returns `(pruned_ledger_rows, swept_workspaces)`.
///
/// Workspaces belonging to non-terminal jobs are always live; everything
/// else is removed once untouched past the retention window.
pub fn run_prune(
    store: &Store,
    workspaces: &WorkspaceManager,
    retention: Duration,
    now_ms: u64,
) -> Result<(usize, usize), QueueError> {
    let cutoff_ms = now_ms.saturating_sub(retention.as_millis() as u64);

    let pruned = store.prune_job_log(cutoff_ms)?;

    let live: HashSet<String> = store
        .jobs_with_status(JobStatus::Queued)
        .into_iter()
        .chain(store.jobs_with_status(JobStatus::Running))
        .map(|job| job.id.to_string())
        .collect();
    let swept = match workspaces.sweep(cutoff_ms, &live) {
        Ok(swept) => swept,
        Err(e) => {
            warn!(error = %e, "workspace sweep failed");
            0
        }
    };

    if pruned > 0 || swept > 0 {
        info!(pruned, swept, "retention pass complete");
    }
    Ok((pruned, swept))
}

#[cfg(test)]
#[path = "retention_tests.rs"]
mod tests;
