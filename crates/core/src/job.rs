// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job record and status machine.

use crate::id::{EventId, JobId};
use crate::limits::DEFAULT_MAX_ATTEMPTS;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Protocol command a plugin can be invoked with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    /// Scheduled read-style command (no event input)
    Poll,
    /// Event-driven command (event input from predecessor or trigger)
    Handle,
    /// Liveness probe
    Health,
    /// One-time plugin setup
    Init,
}

impl Command {
    pub const ALL: [Command; 4] = [Command::Poll, Command::Handle, Command::Health, Command::Init];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Poll => "poll",
            Command::Handle => "handle",
            Command::Health => "health",
            Command::Init => "init",
        }
    }

    /// Per-command execution deadline when the config does not override it.
    pub fn default_timeout(&self) -> Duration {
        match self {
            Command::Poll => Duration::from_secs(60),
            Command::Handle => Duration::from_secs(120),
            Command::Health => Duration::from_secs(10),
            Command::Init => Duration::from_secs(30),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown command name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown command: {0}")]
pub struct ParseCommandError(pub String);

impl FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poll" => Ok(Command::Poll),
            "handle" => Ok(Command::Handle),
            "health" => Ok(Command::Health),
            "init" => Ok(Command::Init),
            other => Err(ParseCommandError(other.to_string())),
        }
    }
}

/// Where a job came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmittedBy {
    Scheduler,
    Webhook,
    Api,
    Router,
    Cli,
    Retry,
}

impl fmt::Display for SubmittedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubmittedBy::Scheduler => "scheduler",
            SubmittedBy::Webhook => "webhook",
            SubmittedBy::Api => "api",
            SubmittedBy::Router => "router",
            SubmittedBy::Cli => "cli",
            SubmittedBy::Retry => "retry",
        };
        f.write_str(s)
    }
}

/// Job lifecycle status.
///
/// ```text
/// queued → running → succeeded
///                  → failed    → queued (retry) | dead
///                  → timed_out → queued (retry) | dead
/// ```
///
/// `Failed` and `TimedOut` are transition statuses: the dispatcher resolves
/// them to a retry (back to `Queued` with `next_retry_at`) or to `Dead` in
/// the same store operation, so jobs at rest are only ever `Queued`,
/// `Running`, `Succeeded`, or `Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Dead,
}

impl JobStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Dead)
    }

    /// Whether the status machine permits `self → next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                // Queued → Dead covers plugin removal on config reload.
                | (Queued, Dead)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Failed, Queued)
                | (Failed, Dead)
                | (TimedOut, Queued)
                | (TimedOut, Dead)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Request to enqueue a job (everything the caller decides).
///
/// The queue assigns identity, sequence, and timestamps on admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub plugin: String,
    pub command: Command,
    #[serde(default)]
    pub payload: Value,
    pub submitted_by: SubmittedBy,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_context_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl NewJob {
    pub fn new(plugin: impl Into<String>, command: Command, submitted_by: SubmittedBy) -> Self {
        Self {
            plugin: plugin.into(),
            command,
            payload: Value::Null,
            submitted_by,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            parent_job_id: None,
            source_event_id: None,
            event_context_id: None,
            pipeline_name: None,
            pipeline_step_id: None,
            pipeline_fingerprint: None,
            dedupe_key: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Pin the job to a pipeline step under a compiled fingerprint.
    pub fn with_pipeline(
        mut self,
        name: impl Into<String>,
        step_id: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> Self {
        self.pipeline_name = Some(name.into());
        self.pipeline_step_id = Some(step_id.into());
        self.pipeline_fingerprint = Some(fingerprint.into());
        self
    }

    /// Record the producing job and emitted event for provenance.
    pub fn with_provenance(
        mut self,
        parent: JobId,
        source_event: EventId,
        context: EventId,
    ) -> Self {
        self.parent_job_id = Some(parent);
        self.source_event_id = Some(source_event);
        self.event_context_id = Some(context);
        self
    }
}

/// A unit of plugin invocation, owned by the queue until terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub plugin: String,
    pub command: Command,
    #[serde(default)]
    pub payload: Value,
    pub status: JobStatus,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
    pub submitted_by: SubmittedBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_context_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    /// Monotonic admission sequence; the FIFO tie-break after `created_at_ms`.
    #[serde(default)]
    pub seq: u64,
}

impl Job {
    /// Admit a request into the queue.
    pub fn admit(req: NewJob, id: JobId, seq: u64, now_ms: u64) -> Self {
        Self {
            id,
            plugin: req.plugin,
            command: req.command,
            payload: req.payload,
            status: JobStatus::Queued,
            attempt: 1,
            max_attempts: req.max_attempts.max(1),
            next_retry_at_ms: None,
            last_error: None,
            created_at_ms: now_ms,
            started_at_ms: None,
            completed_at_ms: None,
            submitted_by: req.submitted_by,
            parent_job_id: req.parent_job_id,
            source_event_id: req.source_event_id,
            event_context_id: req.event_context_id,
            pipeline_name: req.pipeline_name,
            pipeline_step_id: req.pipeline_step_id,
            pipeline_fingerprint: req.pipeline_fingerprint,
            dedupe_key: req.dedupe_key,
            seq,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a queued job may be dispatched at `now_ms`.
    pub fn is_eligible(&self, now_ms: u64) -> bool {
        self.status == JobStatus::Queued
            && self.next_retry_at_ms.map_or(true, |at| at <= now_ms)
    }

    /// Whether further retries remain after the current attempt.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
