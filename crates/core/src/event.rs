// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lifecycle events.
//!
//! One enum serves two audiences. Durable variants are facts the store
//! journals to the WAL and replays into `MaterializedState` on recovery.
//! The remaining variants are observability signals published on the
//! in-process bus only; they must never be journaled (a replayed
//! `scheduler:skipped` is meaningless and a replayed `daemon:shutdown`
//! would be harmful).
//!
//! Serializes with `{"type": "domain:verb", ...fields}` format.

use crate::breaker::CircuitBreaker;
use crate::context::EventContext;
use crate::id::JobId;
use crate::job::{Command, Job, JobStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Why the scheduler skipped a due poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    OutstandingPoll,
    CircuitOpen,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::OutstandingPoll => f.write_str("outstanding_poll"),
            SkipReason::CircuitOpen => f.write_str("circuit_open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    // -- job (durable) --
    #[serde(rename = "job:enqueued")]
    JobEnqueued { job: Job },

    #[serde(rename = "job:started")]
    JobStarted {
        id: JobId,
        attempt: u32,
        started_at_ms: u64,
    },

    #[serde(rename = "job:succeeded")]
    JobSucceeded {
        id: JobId,
        completed_at_ms: u64,
        #[serde(default)]
        stderr_tail: String,
    },

    /// Retryable failure: the job returns to the queue with a backoff.
    /// `status` records which failure leg was taken (failed or timed_out);
    /// `attempt` is the upcoming attempt number.
    #[serde(rename = "job:retry-scheduled")]
    JobRetryScheduled {
        id: JobId,
        status: JobStatus,
        error: String,
        next_retry_at_ms: u64,
        attempt: u32,
    },

    /// Permanent failure or exhausted attempts; the job moves to the ledger.
    #[serde(rename = "job:dead")]
    JobDead {
        id: JobId,
        status: JobStatus,
        error: String,
        completed_at_ms: u64,
        #[serde(default)]
        stderr_tail: String,
        /// Raw stdout is preserved only for protocol errors.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_stdout: Option<String>,
    },

    /// Startup found a job still marked running; it was either requeued
    /// for another attempt or marked dead.
    #[serde(rename = "job:recovered")]
    JobRecovered {
        id: JobId,
        requeued: bool,
        attempt: u32,
    },

    // -- plugin state (durable) --
    #[serde(rename = "state:merged")]
    StateMerged {
        plugin: String,
        updates: Value,
        updated_at_ms: u64,
    },

    // -- context (durable) --
    #[serde(rename = "context:created")]
    ContextCreated { context: EventContext },

    // -- breaker (durable) --
    #[serde(rename = "breaker:changed")]
    BreakerChanged {
        plugin: String,
        command: Command,
        breaker: CircuitBreaker,
    },

    // -- ledger (durable) --
    #[serde(rename = "ledger:pruned")]
    LedgerPruned { before_ms: u64 },

    // -- queue observability --
    #[serde(rename = "job:deduplicated")]
    JobDeduplicated {
        plugin: String,
        dedupe_key: String,
        existing: JobId,
    },

    // -- scheduler observability --
    #[serde(rename = "scheduler:scheduled")]
    SchedulerScheduled {
        plugin: String,
        command: Command,
        job: JobId,
    },

    #[serde(rename = "scheduler:skipped")]
    SchedulerSkipped {
        plugin: String,
        command: Command,
        reason: SkipReason,
    },

    // -- router observability --
    #[serde(rename = "router:matched")]
    RouterMatched {
        job: JobId,
        event_type: String,
        successors: Vec<String>,
    },

    #[serde(rename = "router:no-match")]
    RouterNoMatch { job: JobId, event_type: String },

    #[serde(rename = "router:hop-limit")]
    HopLimitExceeded {
        job: JobId,
        event_type: String,
        hop_count: u32,
    },

    // -- circuit observability --
    #[serde(rename = "circuit:opened")]
    CircuitOpened {
        plugin: String,
        command: Command,
        cooldown_until_ms: u64,
    },

    #[serde(rename = "circuit:half-open")]
    CircuitHalfOpen { plugin: String, command: Command },

    #[serde(rename = "circuit:closed")]
    CircuitClosed {
        plugin: String,
        command: Command,
        #[serde(default)]
        manual: bool,
    },

    // -- dispatcher observability --
    #[serde(rename = "plugin:spawned")]
    PluginSpawned {
        job: JobId,
        plugin: String,
        command: Command,
    },

    #[serde(rename = "plugin:timeout")]
    PluginTimeout {
        job: JobId,
        plugin: String,
        command: Command,
        timeout_ms: u64,
    },

    // -- bus observability --
    /// A slow subscriber lost `missed` events (drop-oldest backpressure).
    #[serde(rename = "bus:lagged")]
    BusLagged { missed: u64 },

    // -- system control --
    #[serde(rename = "daemon:shutdown")]
    Shutdown,
}

impl Event {
    /// Whether this event is journaled to the WAL and replayed on recovery.
    pub fn is_durable(&self) -> bool {
        matches!(
            self,
            Event::JobEnqueued { .. }
                | Event::JobStarted { .. }
                | Event::JobSucceeded { .. }
                | Event::JobRetryScheduled { .. }
                | Event::JobDead { .. }
                | Event::JobRecovered { .. }
                | Event::StateMerged { .. }
                | Event::ContextCreated { .. }
                | Event::BreakerChanged { .. }
                | Event::LedgerPruned { .. }
        )
    }

    /// The job this event concerns, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Event::JobEnqueued { job } => Some(&job.id),
            Event::JobStarted { id, .. }
            | Event::JobSucceeded { id, .. }
            | Event::JobRetryScheduled { id, .. }
            | Event::JobDead { id, .. }
            | Event::JobRecovered { id, .. } => Some(id),
            Event::ContextCreated { context } => Some(&context.job_id),
            Event::SchedulerScheduled { job, .. }
            | Event::RouterMatched { job, .. }
            | Event::RouterNoMatch { job, .. }
            | Event::HopLimitExceeded { job, .. }
            | Event::PluginSpawned { job, .. }
            | Event::PluginTimeout { job, .. } => Some(job),
            _ => None,
        }
    }

    /// Compact one-line rendering for log spans.
    pub fn log_summary(&self) -> String {
        match self {
            Event::JobEnqueued { job } => {
                format!("job:enqueued {} {}.{}", job.id.short(8), job.plugin, job.command)
            }
            Event::JobStarted { id, attempt, .. } => {
                format!("job:started {} attempt={attempt}", id.short(8))
            }
            Event::JobSucceeded { id, .. } => format!("job:succeeded {}", id.short(8)),
            Event::JobRetryScheduled {
                id,
                status,
                attempt,
                ..
            } => format!("job:retry-scheduled {} {status} attempt={attempt}", id.short(8)),
            Event::JobDead { id, status, .. } => format!("job:dead {} via {status}", id.short(8)),
            Event::JobRecovered { id, requeued, .. } => {
                format!("job:recovered {} requeued={requeued}", id.short(8))
            }
            Event::StateMerged { plugin, .. } => format!("state:merged {plugin}"),
            Event::ContextCreated { context } => format!(
                "context:created {} hop={}",
                context.event_id.short(8),
                context.hop_count
            ),
            Event::BreakerChanged {
                plugin, command, breaker,
            } => format!("breaker:changed {plugin}.{command} {}", breaker.state),
            Event::LedgerPruned { before_ms } => format!("ledger:pruned before={before_ms}"),
            Event::JobDeduplicated {
                plugin, dedupe_key, ..
            } => format!("job:deduplicated {plugin} key={dedupe_key}"),
            Event::SchedulerScheduled { plugin, command, .. } => {
                format!("scheduler:scheduled {plugin}.{command}")
            }
            Event::SchedulerSkipped {
                plugin,
                command,
                reason,
            } => format!("scheduler:skipped {plugin}.{command} reason={reason}"),
            Event::RouterMatched {
                event_type,
                successors,
                ..
            } => format!("router:matched {event_type} -> {}", successors.join(",")),
            Event::RouterNoMatch { event_type, .. } => format!("router:no-match {event_type}"),
            Event::HopLimitExceeded {
                event_type,
                hop_count,
                ..
            } => format!("router:hop-limit {event_type} hops={hop_count}"),
            Event::CircuitOpened { plugin, command, .. } => {
                format!("circuit:opened {plugin}.{command}")
            }
            Event::CircuitHalfOpen { plugin, command } => {
                format!("circuit:half-open {plugin}.{command}")
            }
            Event::CircuitClosed {
                plugin,
                command,
                manual,
            } => format!("circuit:closed {plugin}.{command} manual={manual}"),
            Event::PluginSpawned {
                plugin, command, job,
            } => format!("plugin:spawned {plugin}.{command} job={}", job.short(8)),
            Event::PluginTimeout {
                plugin,
                command,
                timeout_ms,
                ..
            } => format!("plugin:timeout {plugin}.{command} after={timeout_ms}ms"),
            Event::BusLagged { missed } => format!("bus:lagged missed={missed}"),
            Event::Shutdown => "daemon:shutdown".to_string(),
        }
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
