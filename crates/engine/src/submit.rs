// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! External trigger entry (webhook / API / CLI).
//!
//! Two entry shapes:
//! - [`submit_event`]: an event type plus payload. Every pipeline whose
//!   trigger matches fans out; each match opens a fresh context chain
//!   (accumulated seeded from the payload, baggage lifted) pinned to the
//!   pipeline's current fingerprint.
//! - [`submit_job`]: a direct `(plugin, command)` invocation with no
//!   pipeline involvement — a standalone execution.

use crate::ctx::EngineCtx;
use ductile_adapters::PluginRunner;
use ductile_core::{
    Clock, Command, Event, EventContext, EventId, Job, JobId, NewJob, SubmittedBy,
};
use ductile_storage::{Enqueued, QueueError};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("plugin {0:?} is not loaded")]
    PluginUnknown(String),
    #[error("plugin {plugin:?} does not declare command {command}")]
    InvalidCommand { plugin: String, command: Command },
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Outcome of a direct submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Submitted {
    Accepted(Job),
    /// Suppressed by the dedupe rule — an explicit result, not an error.
    Deduplicated { existing: JobId },
}

/// Enqueue a standalone `(plugin, command)` job.
pub fn submit_job<R: PluginRunner, C: Clock>(
    ctx: &Arc<EngineCtx<R, C>>,
    plugin: &str,
    command: Command,
    payload: Value,
    dedupe_key: Option<String>,
    submitted_by: SubmittedBy,
) -> Result<Submitted, SubmitError> {
    let view = ctx.view();
    let Some(resolved) = view.catalog.get(plugin) else {
        return Err(SubmitError::PluginUnknown(plugin.to_string()));
    };
    if !resolved.supports(command) {
        return Err(SubmitError::InvalidCommand {
            plugin: plugin.to_string(),
            command,
        });
    }

    let max_attempts = view
        .config
        .plugin(plugin)
        .map(|p| p.retry.max_attempts)
        .unwrap_or(ductile_core::limits::DEFAULT_MAX_ATTEMPTS);

    let mut req = NewJob::new(plugin, command, submitted_by)
        .with_payload(payload)
        .with_max_attempts(max_attempts);
    if let Some(key) = dedupe_key {
        req = req.with_dedupe_key(key);
    }

    let now_ms = ctx.clock.epoch_ms();
    match ctx.enqueue(req, now_ms)? {
        Enqueued::Created(job) => Ok(Submitted::Accepted(job)),
        Enqueued::Deduplicated { existing } => Ok(Submitted::Deduplicated { existing }),
    }
}

/// Open pipeline chains for an externally delivered event.
///
/// Returns the entry jobs created, one per matching trigger; an empty vec
/// means no pipeline listens for this event type.
pub fn submit_event<R: PluginRunner, C: Clock>(
    ctx: &Arc<EngineCtx<R, C>>,
    event_type: &str,
    payload: Value,
    submitted_by: SubmittedBy,
) -> Result<Vec<Job>, SubmitError> {
    let view = ctx.view();
    let now_ms = ctx.clock.epoch_ms();
    let targets = ctx.router.entry_matches(event_type);

    let mut jobs = Vec::with_capacity(targets.len());
    for target in targets {
        let entry_job_id = JobId::generate();
        let context = EventContext::entry(
            EventId::generate(),
            entry_job_id.clone(),
            target.pipeline.clone(),
            target.step_id.clone(),
            event_type,
            event_source(event_type),
            payload.clone(),
            now_ms,
        );
        ctx.store.insert_context(&context)?;
        ctx.bus.publish(Event::ContextCreated {
            context: context.clone(),
        });

        let max_attempts = view
            .config
            .plugin(&target.plugin)
            .map(|p| p.retry.max_attempts)
            .unwrap_or(ductile_core::limits::DEFAULT_MAX_ATTEMPTS);

        let mut req = NewJob::new(target.plugin.clone(), target.command, submitted_by)
            .with_payload(payload.clone())
            .with_max_attempts(max_attempts)
            .with_pipeline(
                target.pipeline.clone(),
                target.step_id.clone(),
                target.fingerprint.clone(),
            );
        req.event_context_id = Some(context.event_id.clone());

        match ctx.enqueue_with_id(entry_job_id, req, now_ms)? {
            Enqueued::Created(job) => jobs.push(job),
            Enqueued::Deduplicated { .. } => {}
        }
    }
    Ok(jobs)
}

/// Producer namespace for an externally delivered event: the leading
/// segment of its type (`discord` for `discord.link_posted`).
fn event_source(event_type: &str) -> &str {
    event_type.split('.').next().unwrap_or(event_type)
}

#[cfg(test)]
#[path = "submit_tests.rs"]
mod tests;
