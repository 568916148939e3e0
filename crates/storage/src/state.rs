// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Materialized state: the store's tables, derived from journaled events.
//!
//! # Idempotency Requirement
//!
//! **All event handlers MUST be idempotent.** Recovery may re-apply an
//! event that was already folded into the snapshot's WAL tail, so applying
//! the same event twice must produce the same state as applying it once.
//! Guidelines:
//! - use assignment instead of mutation (`=`, not `+=`)
//! - guard inserts with existence checks
//! - make removals tolerate the row being gone already

use ductile_core::{
    CircuitBreaker, Command, Event, EventContext, Job, JobStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// One row of the plugin-state table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginStateRow {
    /// The plugin's JSON object blob.
    pub value: Value,
    pub updated_at_ms: u64,
}

/// A terminal job in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: Job,
    /// Captured stderr tail (bounded).
    #[serde(default)]
    pub stderr_tail: String,
    /// Full raw stdout, preserved only on protocol errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_stdout: Option<String>,
    /// Wall-clock execution time of the final attempt.
    #[serde(default)]
    pub duration_ms: u64,
}

/// The store's tables.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializedState {
    /// Non-terminal jobs, keyed by job id.
    #[serde(default)]
    pub job_queue: HashMap<String, Job>,
    /// Terminal jobs, retention-pruned.
    #[serde(default)]
    pub job_log: HashMap<String, JobRecord>,
    /// One row per plugin.
    #[serde(default)]
    pub plugin_state: HashMap<String, PluginStateRow>,
    /// Immutable hop records, keyed by event id.
    #[serde(default)]
    pub event_contexts: HashMap<String, EventContext>,
    /// Per `(plugin, command)` breaker rows, keyed by `plugin/command`.
    #[serde(default)]
    pub circuit_breakers: HashMap<String, CircuitBreaker>,
    /// Next admission sequence number.
    #[serde(default)]
    pub next_seq: u64,
}

/// Breaker table key.
pub(crate) fn breaker_key(plugin: &str, command: Command) -> String {
    format!("{plugin}/{command}")
}

impl MaterializedState {
    /// Fold one journaled event into the tables.
    pub fn apply_event(&mut self, event: &Event) {
        match event {
            Event::JobEnqueued { job } => {
                let id = job.id.to_string();
                if !self.job_queue.contains_key(&id) && !self.job_log.contains_key(&id) {
                    self.job_queue.insert(id, job.clone());
                }
                self.next_seq = self.next_seq.max(job.seq + 1);
            }

            Event::JobStarted {
                id,
                attempt,
                started_at_ms,
            } => {
                if let Some(job) = self.job_queue.get_mut(id.as_str()) {
                    if job.status == JobStatus::Queued {
                        job.status = JobStatus::Running;
                        job.attempt = *attempt;
                        job.started_at_ms = Some(*started_at_ms);
                        job.next_retry_at_ms = None;
                    }
                }
            }

            Event::JobSucceeded {
                id,
                completed_at_ms,
                stderr_tail,
            } => {
                if let Some(mut job) = self.job_queue.remove(id.as_str()) {
                    job.status = JobStatus::Succeeded;
                    job.completed_at_ms = Some(*completed_at_ms);
                    let duration_ms = job
                        .started_at_ms
                        .map_or(0, |started| completed_at_ms.saturating_sub(started));
                    self.job_log.entry(id.to_string()).or_insert(JobRecord {
                        job,
                        stderr_tail: stderr_tail.clone(),
                        raw_stdout: None,
                        duration_ms,
                    });
                }
            }

            Event::JobRetryScheduled {
                id,
                error,
                next_retry_at_ms,
                attempt,
                ..
            } => {
                if let Some(job) = self.job_queue.get_mut(id.as_str()) {
                    if !job.is_terminal() {
                        job.status = JobStatus::Queued;
                        job.attempt = *attempt;
                        job.next_retry_at_ms = Some(*next_retry_at_ms);
                        job.last_error = Some(error.clone());
                    }
                }
            }

            Event::JobDead {
                id,
                error,
                completed_at_ms,
                stderr_tail,
                raw_stdout,
                ..
            } => {
                if let Some(mut job) = self.job_queue.remove(id.as_str()) {
                    job.status = JobStatus::Dead;
                    job.completed_at_ms = Some(*completed_at_ms);
                    job.last_error = Some(error.clone());
                    let duration_ms = job
                        .started_at_ms
                        .map_or(0, |started| completed_at_ms.saturating_sub(started));
                    self.job_log.entry(id.to_string()).or_insert(JobRecord {
                        job,
                        stderr_tail: stderr_tail.clone(),
                        raw_stdout: raw_stdout.clone(),
                        duration_ms,
                    });
                }
            }

            Event::JobRecovered {
                id,
                requeued,
                attempt,
            } => {
                // The dead leg is journaled separately as JobDead.
                if *requeued {
                    if let Some(job) = self.job_queue.get_mut(id.as_str()) {
                        if job.status == JobStatus::Running {
                            job.status = JobStatus::Queued;
                            job.attempt = *attempt;
                            job.next_retry_at_ms = None;
                            job.last_error = Some("orphaned by restart".to_string());
                        }
                    }
                }
            }

            Event::StateMerged {
                plugin,
                updates,
                updated_at_ms,
            } => {
                let row = self.plugin_state.entry(plugin.clone()).or_default();
                row.value = shallow_merge(&row.value, updates);
                row.updated_at_ms = *updated_at_ms;
            }

            Event::ContextCreated { context } => {
                self.event_contexts
                    .entry(context.event_id.to_string())
                    .or_insert_with(|| context.clone());
            }

            Event::BreakerChanged {
                plugin,
                command,
                breaker,
            } => {
                self.circuit_breakers
                    .insert(breaker_key(plugin, *command), breaker.clone());
            }

            Event::LedgerPruned { before_ms } => {
                self.job_log.retain(|_, record| {
                    record.job.completed_at_ms.map_or(true, |at| at >= *before_ms)
                });
            }

            // Observability-only events carry no state.
            _ => {}
        }
    }

    // ── Read helpers ─────────────────────────────────────────────────────

    /// The oldest dispatchable queued job: FIFO by `created_at_ms`, ties
    /// broken by admission sequence.
    pub fn eligible_job(&self, now_ms: u64) -> Option<&Job> {
        self.job_queue
            .values()
            .filter(|job| job.is_eligible(now_ms))
            .min_by_key(|job| (job.created_at_ms, job.seq))
    }

    /// A job by id, from the queue or the ledger.
    pub fn find_job(&self, id: &str) -> Option<&Job> {
        self.job_queue
            .get(id)
            .or_else(|| self.job_log.get(id).map(|record| &record.job))
    }

    /// Non-terminal jobs for `(plugin, command)`.
    pub fn outstanding(&self, plugin: &str, command: Command) -> usize {
        self.job_queue
            .values()
            .filter(|job| job.plugin == plugin && job.command == command)
            .count()
    }

    /// Completion time of the most recent succeeded `(plugin, command)` job.
    pub fn last_success_ms(&self, plugin: &str, command: Command) -> Option<u64> {
        self.job_log
            .values()
            .filter(|record| {
                record.job.plugin == plugin
                    && record.job.command == command
                    && record.job.status == JobStatus::Succeeded
            })
            .filter_map(|record| record.job.completed_at_ms)
            .max()
    }

    /// A succeeded ledger row with this dedupe key inside the TTL window.
    pub fn dedupe_hit(&self, plugin: &str, key: &str, now_ms: u64, ttl_ms: u64) -> Option<&Job> {
        self.job_log
            .values()
            .map(|record| &record.job)
            .find(|job| {
                job.plugin == plugin
                    && job.status == JobStatus::Succeeded
                    && job.dedupe_key.as_deref() == Some(key)
                    && job
                        .completed_at_ms
                        .map_or(false, |at| now_ms.saturating_sub(at) < ttl_ms)
            })
    }

    /// Current breaker row for `(plugin, command)`, default when absent.
    pub fn breaker(&self, plugin: &str, command: Command) -> CircuitBreaker {
        self.circuit_breakers
            .get(&breaker_key(plugin, command))
            .cloned()
            .unwrap_or_default()
    }
}

/// Top-level key replacement; the §4.5 merge discipline.
pub(crate) fn shallow_merge(base: &Value, updates: &Value) -> Value {
    let mut merged = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Value::Object(update_map) = updates {
        for (key, value) in update_map {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
#[path = "state_tests/mod.rs"]
mod tests;
