// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The dispatch loop: dequeue, spawn, interpret, route.
//!
//! Dispatch is strictly serial — at most one plugin subprocess exists at
//! any moment, which removes cross-plugin state races without coarse
//! locking. Each dispatched job resolves its plugin through the current
//! catalog snapshot, runs under the command deadline, and is driven to a
//! terminal transition; on success the emitted events are routed, each
//! matched successor getting its own child context and a cloned workspace
//! before it is enqueued.

use crate::ctx::EngineCtx;
use ductile_adapters::{PluginInvocation, PluginRunner};
use ductile_core::limits::{DEFAULT_MAX_HOPS, STDERR_TAIL_BYTES, TERM_GRACE};
use ductile_core::{
    iso8601, parse_response, Clock, Command, EmittedEvent, Event, EventContext, EventId, Job,
    JobId, JobStatus, NewJob, PluginRequest, PluginResponse, RequestContext, ResponseStatus,
    SubmittedBy, EXIT_CONFIG_ERROR, EXIT_TRANSIENT, PROTOCOL_VERSION,
};
use ductile_pipeline::RouteTarget;
use ductile_storage::{Enqueued, QueueError};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Idle poll interval when the queue is empty (retry backoffs become
/// eligible without an explicit wake).
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Grace given to an in-flight plugin on shutdown before it is abandoned
/// to orphan recovery.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// How a run ended, before the retry policy is applied.
enum Outcome {
    Success(PluginResponse),
    Failure {
        via: JobStatus,
        error: String,
        retryable: bool,
        raw_stdout: Option<String>,
    },
}

pub struct Dispatcher<R: PluginRunner, C: Clock> {
    ctx: Arc<EngineCtx<R, C>>,
}

impl<R: PluginRunner, C: Clock> Dispatcher<R, C> {
    pub fn new(ctx: Arc<EngineCtx<R, C>>) -> Self {
        Self { ctx }
    }

    /// Serial dispatch loop. Returns on shutdown; a storage error is fatal
    /// and propagates so the process can exit and recover via the lock.
    pub async fn run(self) -> Result<(), QueueError> {
        info!("dispatcher started");
        loop {
            if self.ctx.shutdown.is_cancelled() {
                break;
            }
            if !self.dispatch_next().await? {
                tokio::select! {
                    _ = self.ctx.work_available.notified() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                    _ = self.ctx.shutdown.cancelled() => break,
                }
            }
        }
        info!("dispatcher stopped");
        Ok(())
    }

    /// Dequeue and run one job if any is eligible. Returns whether a job
    /// was dispatched.
    pub async fn dispatch_next(&self) -> Result<bool, QueueError> {
        let now_ms = self.ctx.clock.epoch_ms();
        let Some(job) = self.ctx.store.dequeue(now_ms)? else {
            return Ok(false);
        };
        self.ctx.bus.publish(Event::JobStarted {
            id: job.id.clone(),
            attempt: job.attempt,
            started_at_ms: job.started_at_ms.unwrap_or(now_ms),
        });
        self.dispatch(job).await?;
        Ok(true)
    }

    async fn dispatch(&self, job: Job) -> Result<(), QueueError> {
        let view = self.ctx.view();
        let plugin_config = view
            .config
            .plugin(&job.plugin)
            .cloned()
            .unwrap_or_default();

        // A duplicate admitted while the original was still in flight is
        // dropped here, so at most one holder of a dedupe key ever reaches
        // succeeded inside the TTL window.
        if let Some(key) = &job.dedupe_key {
            let dedupe_ttl = view.config.service.dedupe_ttl;
            if let Some(existing) =
                self.ctx
                    .store
                    .dedupe_hit(&job.plugin, key, dedupe_ttl, self.ctx.clock.epoch_ms())
            {
                self.ctx.bus.publish(Event::JobDeduplicated {
                    plugin: job.plugin.clone(),
                    dedupe_key: key.clone(),
                    existing: existing.clone(),
                });
                // A drop, not a plugin failure: the breaker is untouched.
                let now_ms = self.ctx.clock.epoch_ms();
                let error = format!("duplicate of {existing} inside the dedupe window");
                self.ctx.store.mark_dead(
                    &job.id,
                    JobStatus::Failed,
                    error.clone(),
                    now_ms,
                    String::new(),
                    None,
                )?;
                self.ctx.bus.publish(Event::JobDead {
                    id: job.id.clone(),
                    status: JobStatus::Failed,
                    error,
                    completed_at_ms: now_ms,
                    stderr_tail: String::new(),
                    raw_stdout: None,
                });
                return Ok(());
            }
        }

        // Resolution failures are trust/config violations: never retried.
        let Some(resolved) = view.catalog.get(&job.plugin).cloned() else {
            return self
                .finish_failure(
                    &job,
                    JobStatus::Failed,
                    format!("plugin {:?} is not loaded (unknown or refused)", job.plugin),
                    false,
                    String::new(),
                    None,
                )
                .await;
        };
        if !resolved.supports(job.command) {
            return self
                .finish_failure(
                    &job,
                    JobStatus::Failed,
                    format!("plugin {:?} does not declare command {}", job.plugin, job.command),
                    false,
                    String::new(),
                    None,
                )
                .await;
        }

        let workspace_dir = match self.ctx.workspaces.ensure(&job.id) {
            Ok(dir) => dir,
            Err(e) => {
                return self
                    .finish_failure(
                        &job,
                        JobStatus::Failed,
                        format!("workspace setup failed: {e}"),
                        true,
                        String::new(),
                        None,
                    )
                    .await;
            }
        };

        let parent_context = job
            .event_context_id
            .as_ref()
            .and_then(|id| self.ctx.store.context(id));

        let now_ms = self.ctx.clock.epoch_ms();
        let timeout = plugin_config.timeouts.resolve(job.command);
        let request = PluginRequest {
            protocol: PROTOCOL_VERSION,
            job_id: job.id.clone(),
            command: job.command,
            config: plugin_config.config.clone(),
            state: self.ctx.store.plugin_state(&job.plugin),
            event: (job.command == Command::Handle).then(|| job.payload.clone()),
            event_context: parent_context.as_ref().map(|c| RequestContext {
                accumulated: c.accumulated.clone(),
            }),
            workspace_dir,
            deadline_at: iso8601(now_ms + timeout.as_millis() as u64),
        };
        let request_bytes = match serde_json::to_vec(&request) {
            Ok(bytes) => bytes,
            Err(e) => {
                return self
                    .finish_failure(
                        &job,
                        JobStatus::Failed,
                        format!("failed to encode request envelope: {e}"),
                        true,
                        String::new(),
                        None,
                    )
                    .await;
            }
        };

        self.ctx.bus.publish(Event::PluginSpawned {
            job: job.id.clone(),
            plugin: job.plugin.clone(),
            command: job.command,
        });

        let invocation = PluginInvocation {
            binary: resolved.binary.clone(),
            request: request_bytes,
            timeout,
            term_grace: TERM_GRACE,
        };

        // Shutdown drains the in-flight run for a grace window, then
        // abandons it; the job stays running and orphan recovery requeues
        // it on the next start.
        let run = self.ctx.runner.run(invocation);
        tokio::pin!(run);
        let output = tokio::select! {
            output = &mut run => output,
            _ = self.ctx.shutdown.cancelled() => {
                match tokio::time::timeout(DRAIN_GRACE, &mut run).await {
                    Ok(output) => output,
                    Err(_) => {
                        warn!(job = %job.id.short(8), "in-flight job abandoned at shutdown");
                        return Ok(());
                    }
                }
            }
        };

        let (outcome, stderr_tail) = self.interpret(&job, timeout, output);
        match outcome {
            Outcome::Success(response) => {
                self.finish_success(&job, parent_context, response, stderr_tail)
                    .await
            }
            Outcome::Failure {
                via,
                error,
                retryable,
                raw_stdout,
            } => {
                self.finish_failure(&job, via, error, retryable, stderr_tail, raw_stdout)
                    .await
            }
        }
    }

    /// Map the raw run output onto the outcome taxonomy.
    fn interpret(
        &self,
        job: &Job,
        timeout: Duration,
        output: Result<ductile_adapters::PluginRunOutput, ductile_adapters::RunnerError>,
    ) -> (Outcome, String) {
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return (
                    Outcome::Failure {
                        via: JobStatus::Failed,
                        error: e.to_string(),
                        retryable: true,
                        raw_stdout: None,
                    },
                    String::new(),
                )
            }
        };

        let stderr_tail = tail_lossy(&output.stderr, STDERR_TAIL_BYTES);

        if output.timed_out {
            self.ctx.bus.publish(Event::PluginTimeout {
                job: job.id.clone(),
                plugin: job.plugin.clone(),
                command: job.command,
                timeout_ms: timeout.as_millis() as u64,
            });
            return (
                Outcome::Failure {
                    via: JobStatus::TimedOut,
                    error: format!("deadline exceeded after {}s", timeout.as_secs()),
                    retryable: true,
                    raw_stdout: None,
                },
                stderr_tail,
            );
        }

        if output.exit_code == Some(EXIT_CONFIG_ERROR) {
            return (
                Outcome::Failure {
                    via: JobStatus::Failed,
                    error: "plugin signalled a configuration error (exit 78)".to_string(),
                    retryable: false,
                    raw_stdout: None,
                },
                stderr_tail,
            );
        }

        match parse_response(&output.stdout) {
            Ok(response) => {
                relay_plugin_logs(&job.plugin, &response);
                if response.status == ResponseStatus::Ok {
                    (Outcome::Success(response), stderr_tail)
                } else {
                    (
                        Outcome::Failure {
                            via: JobStatus::Failed,
                            error: response.error.clone().unwrap_or_default(),
                            retryable: response.retry,
                            raw_stdout: None,
                        },
                        stderr_tail,
                    )
                }
            }
            Err(_) if output.exit_code == Some(EXIT_TRANSIENT) => (
                Outcome::Failure {
                    via: JobStatus::Failed,
                    error: "plugin signalled a transient failure (exit 75)".to_string(),
                    retryable: true,
                    raw_stdout: None,
                },
                stderr_tail,
            ),
            Err(protocol_error) => (
                // Stdout-is-protocol rule: permanent, raw output preserved.
                Outcome::Failure {
                    via: JobStatus::Failed,
                    error: format!("protocol error: {protocol_error}"),
                    retryable: false,
                    raw_stdout: Some(String::from_utf8_lossy(&output.stdout).into_owned()),
                },
                stderr_tail,
            ),
        }
    }

    async fn finish_success(
        &self,
        job: &Job,
        parent_context: Option<EventContext>,
        response: PluginResponse,
        stderr_tail: String,
    ) -> Result<(), QueueError> {
        // State updates first: an oversized blob fails the job before it
        // can succeed or route anything.
        if !response.state_updates.is_empty() {
            match self
                .ctx
                .store
                .merge_plugin_state(&job.plugin, &response.state_updates, self.ctx.clock.epoch_ms())
            {
                Ok(_) => {}
                Err(QueueError::StateTooLarge { bytes, limit, .. }) => {
                    return self
                        .finish_failure(
                            job,
                            JobStatus::Failed,
                            format!("state update of {bytes} bytes exceeds the {limit} byte limit"),
                            false,
                            stderr_tail,
                            None,
                        )
                        .await;
                }
                Err(e) => return Err(e),
            }
        }

        let completed_at_ms = self.ctx.clock.epoch_ms();
        self.ctx
            .store
            .mark_succeeded(&job.id, completed_at_ms, stderr_tail.clone())?;
        self.ctx.bus.publish(Event::JobSucceeded {
            id: job.id.clone(),
            completed_at_ms,
            stderr_tail,
        });
        self.update_breaker(job, true)?;

        // Downstream hops are enqueued only after the producer is
        // succeeded, so context order along a lineage is total.
        for emitted in &response.events {
            self.route_emitted(job, parent_context.as_ref(), emitted)?;
        }
        Ok(())
    }

    async fn finish_failure(
        &self,
        job: &Job,
        via: JobStatus,
        error: String,
        retryable: bool,
        stderr_tail: String,
        raw_stdout: Option<String>,
    ) -> Result<(), QueueError> {
        let now_ms = self.ctx.clock.epoch_ms();

        if retryable && job.has_attempts_left() {
            let backoff_ms = retry_backoff_ms(plugin_backoff_base_ms(self, job), job.attempt);
            let next_retry_at_ms = now_ms + backoff_ms;
            let retried = self
                .ctx
                .store
                .mark_retry(&job.id, via, error.clone(), next_retry_at_ms)?;
            debug!(
                job = %job.id.short(8),
                attempt = retried.attempt,
                backoff_ms,
                "retry scheduled"
            );
            self.ctx.bus.publish(Event::JobRetryScheduled {
                id: job.id.clone(),
                status: via,
                error,
                next_retry_at_ms,
                attempt: retried.attempt,
            });
        } else {
            self.ctx.store.mark_dead(
                &job.id,
                via,
                error.clone(),
                now_ms,
                stderr_tail.clone(),
                raw_stdout.clone(),
            )?;
            self.ctx.bus.publish(Event::JobDead {
                id: job.id.clone(),
                status: via,
                error,
                completed_at_ms: now_ms,
                stderr_tail,
                raw_stdout,
            });
        }

        self.update_breaker(job, false)?;
        Ok(())
    }

    /// Apply a terminal poll outcome to the plugin's breaker.
    fn update_breaker(&self, job: &Job, success: bool) -> Result<(), QueueError> {
        if job.command != Command::Poll {
            return Ok(());
        }
        let view = self.ctx.view();
        let policy = view
            .config
            .plugin(&job.plugin)
            .map(|p| p.circuit_breaker.clone())
            .unwrap_or_default();

        let now_ms = self.ctx.clock.epoch_ms();
        let before = self.ctx.store.breaker(&job.plugin, job.command);
        let mut breaker = before.clone();

        if success {
            if breaker.record_success() {
                self.ctx.bus.publish(Event::CircuitClosed {
                    plugin: job.plugin.clone(),
                    command: job.command,
                    manual: false,
                });
            }
        } else if breaker.record_failure(
            now_ms,
            policy.threshold,
            policy.reset_after.as_millis() as u64,
        ) {
            self.ctx.bus.publish(Event::CircuitOpened {
                plugin: job.plugin.clone(),
                command: job.command,
                cooldown_until_ms: breaker.cooldown_until_ms.unwrap_or(now_ms),
            });
        }

        if breaker != before {
            self.ctx.store.record_breaker(&job.plugin, job.command, breaker)?;
        }
        Ok(())
    }

    /// Route one emitted event to its successors: augment, guard hops,
    /// create child contexts, clone workspaces, enqueue.
    fn route_emitted(
        &self,
        job: &Job,
        parent_context: Option<&EventContext>,
        emitted: &EmittedEvent,
    ) -> Result<(), QueueError> {
        let now_ms = self.ctx.clock.epoch_ms();
        // The augmented emitted-event id, shared by all fan-out siblings
        // as their source_event_id.
        let source_event_id = EventId::generate();

        let targets = match (&job.pipeline_name, &job.pipeline_step_id) {
            (Some(pipeline), Some(step)) => {
                match self.ctx.router.next(
                    pipeline,
                    job.pipeline_fingerprint.as_deref(),
                    step,
                    &emitted.event_type,
                ) {
                    Ok(targets) => targets,
                    Err(e) => {
                        warn!(
                            job = %job.id.short(8),
                            event_type = %emitted.event_type,
                            error = %e,
                            "routing failed, dropping emitted event"
                        );
                        return Ok(());
                    }
                }
            }
            _ => self.ctx.router.entry_matches(&emitted.event_type),
        };

        if targets.is_empty() {
            self.ctx.bus.publish(Event::RouterNoMatch {
                job: job.id.clone(),
                event_type: emitted.event_type.clone(),
            });
            return Ok(());
        }

        if let Some(parent) = parent_context {
            if parent.hop_count + 1 > DEFAULT_MAX_HOPS {
                self.ctx.bus.publish(Event::HopLimitExceeded {
                    job: job.id.clone(),
                    event_type: emitted.event_type.clone(),
                    hop_count: parent.hop_count + 1,
                });
                return Ok(());
            }
        }

        self.ctx.bus.publish(Event::RouterMatched {
            job: job.id.clone(),
            event_type: emitted.event_type.clone(),
            successors: targets.iter().map(|t| t.step_id.clone()).collect(),
        });

        for target in &targets {
            self.enqueue_successor(job, parent_context, emitted, &source_event_id, target, now_ms);
        }
        Ok(())
    }

    /// One fan-out branch: independent context, isolated workspace clone,
    /// then admission. A branch that fails leaves its siblings untouched.
    fn enqueue_successor(
        &self,
        job: &Job,
        parent_context: Option<&EventContext>,
        emitted: &EmittedEvent,
        source_event_id: &EventId,
        target: &RouteTarget,
        now_ms: u64,
    ) {
        let context = match parent_context {
            Some(parent) => parent.child(
                EventId::generate(),
                job.id.clone(),
                job.pipeline_step_id.clone().unwrap_or_default(),
                emitted.event_type.clone(),
                &job.plugin,
                emitted.payload.clone(),
                now_ms,
            ),
            None => EventContext::entry(
                EventId::generate(),
                job.id.clone(),
                target.pipeline.clone(),
                target.step_id.clone(),
                emitted.event_type.clone(),
                &job.plugin,
                emitted.payload.clone(),
                now_ms,
            ),
        };

        if let Err(e) = self.ctx.store.insert_context(&context) {
            warn!(
                job = %job.id.short(8),
                step = %target.step_id,
                error = %e,
                "successor rejected"
            );
            return;
        }
        self.ctx.bus.publish(Event::ContextCreated {
            context: context.clone(),
        });

        let successor_id = JobId::generate();
        if let Err(e) = self.ctx.workspaces.clone_for(&job.id, &successor_id) {
            warn!(
                job = %job.id.short(8),
                step = %target.step_id,
                error = %e,
                "workspace clone failed, successor enqueue rejected"
            );
            return;
        }

        let view = self.ctx.view();
        let max_attempts = view
            .config
            .plugin(&target.plugin)
            .map(|p| p.retry.max_attempts)
            .unwrap_or(ductile_core::limits::DEFAULT_MAX_ATTEMPTS);

        let mut req = NewJob::new(target.plugin.clone(), target.command, SubmittedBy::Router)
            .with_payload(emitted.payload.clone())
            .with_max_attempts(max_attempts)
            .with_pipeline(
                target.pipeline.clone(),
                target.step_id.clone(),
                target.fingerprint.clone(),
            )
            .with_provenance(
                job.id.clone(),
                source_event_id.clone(),
                context.event_id.clone(),
            );
        if let Some(key) = &emitted.dedupe_key {
            req = req.with_dedupe_key(key.clone());
        }

        match self.ctx.enqueue_with_id(successor_id.clone(), req, now_ms) {
            Ok(Enqueued::Created(_)) => {}
            Ok(Enqueued::Deduplicated { .. }) | Err(_) => {
                // The admission did not happen; drop the staged clone.
                let _ = self.ctx.workspaces.remove(&successor_id);
            }
        }
    }
}

fn plugin_backoff_base_ms<R: PluginRunner, C: Clock>(
    dispatcher: &Dispatcher<R, C>,
    job: &Job,
) -> u64 {
    dispatcher
        .ctx
        .view()
        .config
        .plugin(&job.plugin)
        .map(|p| p.retry.backoff_base)
        .unwrap_or(ductile_core::limits::DEFAULT_BACKOFF_BASE)
        .as_millis() as u64
}

/// `base * 2^(attempt-1) + random(0, base)` — monotonic in expectation.
fn retry_backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    let scaled = base_ms.saturating_mul(1u64 << exponent);
    scaled.saturating_add(rand::thread_rng().gen_range(0..base_ms.max(1)))
}

/// Last `cap` bytes of a capture, lossily decoded.
fn tail_lossy(bytes: &[u8], cap: usize) -> String {
    let start = bytes.len().saturating_sub(cap);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

fn relay_plugin_logs(plugin: &str, response: &PluginResponse) {
    use ductile_core::protocol::LogLevel;
    for log in &response.logs {
        match log.level {
            LogLevel::Trace => tracing::trace!(plugin, "{}", log.message),
            LogLevel::Debug => debug!(plugin, "{}", log.message),
            LogLevel::Info => info!(plugin, "{}", log.message),
            LogLevel::Warn => warn!(plugin, "{}", log.message),
            LogLevel::Error => error!(plugin, "{}", log.message),
        }
    }
}

#[cfg(test)]
#[path = "dispatcher_tests/mod.rs"]
mod tests;
