// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The store facade: every mutation of queue, plugin state, contexts, and
//! breakers goes through here, serialized under one lock.
//!
//! Mutation discipline: validate against the current tables, journal the
//! resulting events to the WAL (flushed before the call returns), then fold
//! them into [`MaterializedState`]. A WAL failure aborts the operation with
//! the state untouched; the §4.3 status machine is enforced here, so an
//! invalid transition can never reach the journal.

use crate::checkpoint::load_snapshot;
use crate::state::shallow_merge;
use crate::wal::{Wal, WalError};
use crate::{MaterializedState, SnapshotError};
use ductile_core::limits::{MAX_ACCUMULATED_BYTES, MAX_STATE_BYTES};
use ductile_core::{
    serialized_size, CircuitBreaker, Command, Event, EventContext, EventId, Job, JobId, JobStatus,
    NewJob,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("plugin name must not be empty")]
    EmptyPlugin,
    #[error("no such job: {0}")]
    UnknownJob(JobId),
    #[error("job {id} cannot move {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job {0} has no attempts left")]
    AttemptsExhausted(JobId),
    #[error("plugin {plugin} state blob would be {bytes} bytes (limit {limit})")]
    StateTooLarge {
        plugin: String,
        bytes: usize,
        limit: usize,
    },
    #[error("context {event_id} accumulated value would be {bytes} bytes (limit {limit})")]
    ContextTooLarge {
        event_id: EventId,
        bytes: usize,
        limit: usize,
    },
    #[error("storage error: {0}")]
    Storage(#[from] WalError),
}

/// Errors opening the store at startup.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Filesystem locations of the store.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub wal_path: PathBuf,
    pub snapshot_path: PathBuf,
}

/// What recovery found.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub snapshot_seq: u64,
    pub replayed_events: usize,
    pub queued_jobs: usize,
    pub running_jobs: usize,
}

/// Outcome of an enqueue.
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    Created(Job),
    /// Dropped: a succeeded job with the same `(plugin, dedupe_key)` is
    /// inside the TTL window. Observable, not an error.
    Deduplicated { existing: JobId },
}

/// One orphan resolved at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredJob {
    pub job_id: JobId,
    pub plugin: String,
    pub command: Command,
    pub requeued: bool,
    pub attempt: u32,
}

/// Durable single-writer store.
#[derive(Clone)]
pub struct Store {
    state: Arc<Mutex<MaterializedState>>,
    wal: Arc<Mutex<Wal>>,
}

impl Store {
    /// Open the store: load the newest snapshot, replay the WAL tail.
    pub fn open(paths: &StorePaths) -> Result<(Self, RecoveryReport), OpenError> {
        let (mut state, snapshot_seq) = match load_snapshot(&paths.snapshot_path)? {
            Some(snapshot) => (snapshot.state, snapshot.seq),
            None => (MaterializedState::default(), 0),
        };

        let mut wal = Wal::open(&paths.wal_path)?;
        let entries = wal.entries_after(snapshot_seq)?;
        let replayed_events = entries.len();
        for entry in entries {
            state.apply_event(&entry.event);
        }

        let report = RecoveryReport {
            snapshot_seq,
            replayed_events,
            queued_jobs: state
                .job_queue
                .values()
                .filter(|j| j.status == JobStatus::Queued)
                .count(),
            running_jobs: state
                .job_queue
                .values()
                .filter(|j| j.status == JobStatus::Running)
                .count(),
        };
        info!(
            snapshot_seq,
            replayed = replayed_events,
            queued = report.queued_jobs,
            running = report.running_jobs,
            "store recovered"
        );

        Ok((
            Self {
                state: Arc::new(Mutex::new(state)),
                wal: Arc::new(Mutex::new(wal)),
            },
            report,
        ))
    }

    /// In-memory store for tests.
    pub fn in_memory(wal_path: &std::path::Path) -> Result<Self, OpenError> {
        let wal = Wal::open(wal_path)?;
        Ok(Self {
            state: Arc::new(Mutex::new(MaterializedState::default())),
            wal: Arc::new(Mutex::new(wal)),
        })
    }

    /// Journal events (flushed) and fold them into the state.
    ///
    /// The caller must already hold the state lock; this keeps validation
    /// and journaling one atomic section.
    fn commit(&self, state: &mut MaterializedState, events: &[Event]) -> Result<(), WalError> {
        {
            let mut wal = self.wal.lock();
            for event in events {
                debug_assert!(event.is_durable(), "bus-only event reached the journal");
                wal.append(event)?;
            }
            wal.flush()?;
        }
        for event in events {
            state.apply_event(event);
        }
        Ok(())
    }

    // ── Queue ────────────────────────────────────────────────────────────

    /// Admit a job, or drop it as a duplicate of succeeded work.
    pub fn enqueue(
        &self,
        req: NewJob,
        dedupe_ttl: Duration,
        now_ms: u64,
    ) -> Result<Enqueued, QueueError> {
        self.enqueue_with_id(JobId::generate(), req, dedupe_ttl, now_ms)
    }

    /// As [`Store::enqueue`], with a caller-minted job id. The dispatcher
    /// uses this to clone a workspace under the successor's id before the
    /// job becomes dispatchable.
    pub fn enqueue_with_id(
        &self,
        id: JobId,
        req: NewJob,
        dedupe_ttl: Duration,
        now_ms: u64,
    ) -> Result<Enqueued, QueueError> {
        if req.plugin.trim().is_empty() {
            return Err(QueueError::EmptyPlugin);
        }

        let mut state = self.state.lock();

        if let Some(key) = req.dedupe_key.as_deref() {
            if let Some(existing) =
                state.dedupe_hit(&req.plugin, key, now_ms, dedupe_ttl.as_millis() as u64)
            {
                return Ok(Enqueued::Deduplicated {
                    existing: existing.id.clone(),
                });
            }
        }

        let job = Job::admit(req, id, state.next_seq, now_ms);
        self.commit(&mut state, &[Event::JobEnqueued { job: job.clone() }])?;
        Ok(Enqueued::Created(job))
    }

    /// Atomically claim the oldest eligible queued job.
    pub fn dequeue(&self, now_ms: u64) -> Result<Option<Job>, QueueError> {
        let mut state = self.state.lock();
        let Some(job) = state.eligible_job(now_ms) else {
            return Ok(None);
        };
        let id = job.id.clone();
        let attempt = job.attempt;

        self.commit(
            &mut state,
            &[Event::JobStarted {
                id: id.clone(),
                attempt,
                started_at_ms: now_ms,
            }],
        )?;
        Ok(state.job_queue.get(id.as_str()).cloned())
    }

    /// Terminal success; the job moves to the ledger.
    pub fn mark_succeeded(
        &self,
        id: &JobId,
        now_ms: u64,
        stderr_tail: String,
    ) -> Result<Job, QueueError> {
        let mut state = self.state.lock();
        require_transition(&state, id, JobStatus::Succeeded)?;

        self.commit(
            &mut state,
            &[Event::JobSucceeded {
                id: id.clone(),
                completed_at_ms: now_ms,
                stderr_tail,
            }],
        )?;
        ledger_job(&state, id)
    }

    /// Retryable failure: back to queued with a backoff, attempt bumped.
    pub fn mark_retry(
        &self,
        id: &JobId,
        via: JobStatus,
        error: String,
        next_retry_at_ms: u64,
    ) -> Result<Job, QueueError> {
        let mut state = self.state.lock();
        let job = require_failure_leg(&state, id, via)?;
        if !job.has_attempts_left() {
            return Err(QueueError::AttemptsExhausted(id.clone()));
        }
        let attempt = job.attempt + 1;

        self.commit(
            &mut state,
            &[Event::JobRetryScheduled {
                id: id.clone(),
                status: via,
                error,
                next_retry_at_ms,
                attempt,
            }],
        )?;
        state
            .job_queue
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| QueueError::UnknownJob(id.clone()))
    }

    /// Permanent failure (or exhausted attempts); the job moves to the
    /// ledger as dead.
    pub fn mark_dead(
        &self,
        id: &JobId,
        via: JobStatus,
        error: String,
        now_ms: u64,
        stderr_tail: String,
        raw_stdout: Option<String>,
    ) -> Result<Job, QueueError> {
        let mut state = self.state.lock();
        require_failure_leg(&state, id, via)?;

        self.commit(
            &mut state,
            &[Event::JobDead {
                id: id.clone(),
                status: via,
                error,
                completed_at_ms: now_ms,
                stderr_tail,
                raw_stdout,
            }],
        )?;
        ledger_job(&state, id)
    }

    /// Resolve startup orphans: every running job is requeued for another
    /// attempt or marked dead once its budget is spent.
    pub fn recover_orphans(&self, now_ms: u64) -> Result<Vec<RecoveredJob>, QueueError> {
        let mut state = self.state.lock();
        let orphans: Vec<Job> = state
            .job_queue
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .cloned()
            .collect();

        let mut recovered = Vec::with_capacity(orphans.len());
        for job in orphans {
            let attempt = job.attempt + 1;
            let requeued = attempt <= job.max_attempts;
            let mut events = vec![Event::JobRecovered {
                id: job.id.clone(),
                requeued,
                attempt,
            }];
            if !requeued {
                events.push(Event::JobDead {
                    id: job.id.clone(),
                    status: JobStatus::Failed,
                    error: "orphaned by restart; attempts exhausted".to_string(),
                    completed_at_ms: now_ms,
                    stderr_tail: String::new(),
                    raw_stdout: None,
                });
            }
            self.commit(&mut state, &events)?;
            recovered.push(RecoveredJob {
                job_id: job.id,
                plugin: job.plugin,
                command: job.command,
                requeued,
                attempt,
            });
        }
        Ok(recovered)
    }

    /// After a config reload, kill queued jobs whose plugin disappeared.
    pub fn dead_removed_plugins(
        &self,
        known_plugins: &[String],
        now_ms: u64,
    ) -> Result<Vec<Job>, QueueError> {
        let mut state = self.state.lock();
        let doomed: Vec<JobId> = state
            .job_queue
            .values()
            .filter(|job| {
                job.status == JobStatus::Queued && !known_plugins.contains(&job.plugin)
            })
            .map(|job| job.id.clone())
            .collect();

        let mut dead = Vec::with_capacity(doomed.len());
        for id in doomed {
            self.commit(
                &mut state,
                &[Event::JobDead {
                    id: id.clone(),
                    status: JobStatus::Queued,
                    error: "plugin_removed".to_string(),
                    completed_at_ms: now_ms,
                    stderr_tail: String::new(),
                    raw_stdout: None,
                }],
            )?;
            dead.push(ledger_job(&state, &id)?);
        }
        Ok(dead)
    }

    /// Drop ledger rows completed before the cutoff. Returns the count.
    pub fn prune_job_log(&self, before_ms: u64) -> Result<usize, QueueError> {
        let mut state = self.state.lock();
        let count = state
            .job_log
            .values()
            .filter(|record| record.job.completed_at_ms.map_or(false, |at| at < before_ms))
            .count();
        if count > 0 {
            self.commit(&mut state, &[Event::LedgerPruned { before_ms }])?;
        }
        Ok(count)
    }

    // ── Plugin state ─────────────────────────────────────────────────────

    /// Current state blob for a plugin (`{}` when absent).
    pub fn plugin_state(&self, plugin: &str) -> Value {
        let state = self.state.lock();
        state
            .plugin_state
            .get(plugin)
            .map(|row| row.value.clone())
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    /// Shallow-merge updates into a plugin's blob, enforcing the size cap.
    pub fn merge_plugin_state(
        &self,
        plugin: &str,
        updates: &Map<String, Value>,
        now_ms: u64,
    ) -> Result<Value, QueueError> {
        if updates.is_empty() {
            return Ok(self.plugin_state(plugin));
        }

        let mut state = self.state.lock();
        let base = state
            .plugin_state
            .get(plugin)
            .map(|row| row.value.clone())
            .unwrap_or_else(|| Value::Object(Map::new()));
        let updates_value = Value::Object(updates.clone());
        let merged = shallow_merge(&base, &updates_value);

        let bytes = serialized_size(&merged);
        if bytes > MAX_STATE_BYTES {
            return Err(QueueError::StateTooLarge {
                plugin: plugin.to_string(),
                bytes,
                limit: MAX_STATE_BYTES,
            });
        }

        self.commit(
            &mut state,
            &[Event::StateMerged {
                plugin: plugin.to_string(),
                updates: updates_value,
                updated_at_ms: now_ms,
            }],
        )?;
        Ok(merged)
    }

    // ── Contexts ─────────────────────────────────────────────────────────

    /// Persist an immutable hop record, enforcing the accumulated cap.
    pub fn insert_context(&self, context: &EventContext) -> Result<(), QueueError> {
        let bytes = serialized_size(&context.accumulated);
        if bytes > MAX_ACCUMULATED_BYTES {
            return Err(QueueError::ContextTooLarge {
                event_id: context.event_id.clone(),
                bytes,
                limit: MAX_ACCUMULATED_BYTES,
            });
        }
        let mut state = self.state.lock();
        self.commit(
            &mut state,
            &[Event::ContextCreated {
                context: context.clone(),
            }],
        )?;
        Ok(())
    }

    pub fn context(&self, id: &EventId) -> Option<EventContext> {
        let state = self.state.lock();
        state.event_contexts.get(id.as_str()).cloned()
    }

    // ── Breakers ─────────────────────────────────────────────────────────

    pub fn breaker(&self, plugin: &str, command: Command) -> CircuitBreaker {
        let state = self.state.lock();
        state.breaker(plugin, command)
    }

    /// Persist a breaker row (whole-row replace).
    pub fn record_breaker(
        &self,
        plugin: &str,
        command: Command,
        breaker: CircuitBreaker,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        self.commit(
            &mut state,
            &[Event::BreakerChanged {
                plugin: plugin.to_string(),
                command,
                breaker,
            }],
        )?;
        Ok(())
    }

    /// Operator-initiated breaker reset.
    pub fn reset_breaker(&self, plugin: &str, command: Command) -> Result<(), QueueError> {
        self.record_breaker(plugin, command, CircuitBreaker::default())
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn find_job(&self, id: &JobId) -> Option<Job> {
        let state = self.state.lock();
        state.find_job(id.as_str()).cloned()
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<Job> {
        let state = self.state.lock();
        let mut jobs: Vec<Job> = state
            .job_queue
            .values()
            .chain(state.job_log.values().map(|record| &record.job))
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (a.created_at_ms, a.seq).cmp(&(b.created_at_ms, b.seq)));
        jobs
    }

    pub fn ledger_record(&self, id: &JobId) -> Option<crate::JobRecord> {
        let state = self.state.lock();
        state.job_log.get(id.as_str()).cloned()
    }

    /// Non-terminal jobs for `(plugin, command)` — the poll-guard input.
    pub fn outstanding(&self, plugin: &str, command: Command) -> usize {
        let state = self.state.lock();
        state.outstanding(plugin, command)
    }

    pub fn last_success_ms(&self, plugin: &str, command: Command) -> Option<u64> {
        let state = self.state.lock();
        state.last_success_ms(plugin, command)
    }

    /// A succeeded ledger row holding this dedupe key inside the TTL
    /// window. The dispatcher consults this before running a claimed job,
    /// closing the window where a duplicate was admitted while the
    /// original was still in flight.
    pub fn dedupe_hit(
        &self,
        plugin: &str,
        key: &str,
        dedupe_ttl: Duration,
        now_ms: u64,
    ) -> Option<JobId> {
        let state = self.state.lock();
        state
            .dedupe_hit(plugin, key, now_ms, dedupe_ttl.as_millis() as u64)
            .map(|job| job.id.clone())
    }

    // ── Durability plumbing ──────────────────────────────────────────────

    pub fn flush(&self) -> Result<(), WalError> {
        self.wal.lock().flush()
    }

    pub fn needs_flush(&self) -> bool {
        self.wal.lock().needs_flush()
    }

    /// State clone + covered WAL sequence, for the checkpointer.
    pub fn checkpoint_snapshot(&self) -> (u64, MaterializedState) {
        let state = self.state.lock();
        let seq = self.wal.lock().write_seq();
        (seq, state.clone())
    }

    /// Compact the WAL once a snapshot at `seq` is durable.
    ///
    /// The entry at `seq` is kept as a sequence anchor: reopening resumes
    /// numbering from it even when the snapshot covers everything, so
    /// events appended after a restart can never sort "before" the
    /// snapshot and be skipped by replay.
    pub fn truncate_wal_through(&self, seq: u64) -> Result<(), WalError> {
        self.wal.lock().truncate_before(seq)
    }

    /// Breaker table keys currently persisted (diagnostics).
    pub fn breaker_keys(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut keys: Vec<String> = state.circuit_breakers.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Look up a job and check the §4.3 machine for `current → to`.
fn require_transition<'a>(
    state: &'a MaterializedState,
    id: &JobId,
    to: JobStatus,
) -> Result<&'a Job, QueueError> {
    let job = state
        .job_queue
        .get(id.as_str())
        .ok_or_else(|| QueueError::UnknownJob(id.clone()))?;
    if !job.status.can_transition_to(to) {
        return Err(QueueError::InvalidTransition {
            id: id.clone(),
            from: job.status,
            to,
        });
    }
    Ok(job)
}

/// As `require_transition`, but `to` must be a failure leg (failed or
/// timed_out) of the machine.
fn require_failure_leg<'a>(
    state: &'a MaterializedState,
    id: &JobId,
    via: JobStatus,
) -> Result<&'a Job, QueueError> {
    let job = require_transition(state, id, via)?;
    if !matches!(via, JobStatus::Failed | JobStatus::TimedOut) {
        return Err(QueueError::InvalidTransition {
            id: id.clone(),
            from: job.status,
            to: via,
        });
    }
    Ok(job)
}

fn ledger_job(state: &MaterializedState, id: &JobId) -> Result<Job, QueueError> {
    state
        .job_log
        .get(id.as_str())
        .map(|record| record.job.clone())
        .ok_or_else(|| QueueError::UnknownJob(id.clone()))
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
