// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Poll scheduler.
//!
//! Each tick walks the configured schedules and enqueues whatever is due.
//! A run's due time is `last_successful_run + interval + jitter`, with the
//! jitter drawn once per run (keyed by the success basis, so a re-tick
//! never rerolls it) and the result snapped into the preferred window when
//! one is set. The poll-guard and circuit breaker gate admission; skips
//! are observable, never silent.

use crate::ctx::EngineCtx;
use ductile_adapters::PluginRunner;
use ductile_core::{Clock, Event, NewJob, SkipReason, SubmittedBy};
use ductile_pipeline::ScheduleDef;
use ductile_storage::QueueError;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Jitter drawn for one scheduled run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JitterDraw {
    /// The `last_successful_run` this draw belongs to. A new success means
    /// a new run and a fresh draw.
    basis_ms: Option<u64>,
    offset_ms: i64,
}

pub struct Scheduler<R: PluginRunner, C: Clock> {
    ctx: Arc<EngineCtx<R, C>>,
    draws: Mutex<HashMap<(String, usize), JitterDraw>>,
}

impl<R: PluginRunner, C: Clock> Scheduler<R, C> {
    pub fn new(ctx: Arc<EngineCtx<R, C>>) -> Self {
        Self {
            ctx,
            draws: Mutex::new(HashMap::new()),
        }
    }

    /// Tick loop: fires on the configured interval and on manual wake.
    /// Scheduling errors are logged and retried next tick; the loop never
    /// takes the process down.
    pub async fn run(self) {
        info!("scheduler started");
        loop {
            let tick_interval = self.ctx.view().config.service.tick_interval;
            tokio::select! {
                _ = tokio::time::sleep(tick_interval) => {}
                _ = self.ctx.scheduler_wake.notified() => {}
                _ = self.ctx.shutdown.cancelled() => break,
            }
            if self.ctx.shutdown.is_cancelled() {
                break;
            }
            if let Err(e) = self.tick() {
                error!(error = %e, "scheduler tick failed, retrying next tick");
            }
        }
        info!("scheduler stopped");
    }

    /// One pass over every enabled plugin's schedules.
    pub fn tick(&self) -> Result<(), QueueError> {
        let view = self.ctx.view();
        let now_ms = self.ctx.clock.epoch_ms();

        for (plugin, plugin_config) in view.config.scheduled_plugins() {
            for (index, schedule) in plugin_config.schedules.iter().enumerate() {
                let due_ms = self.due_at(plugin, index, schedule);
                if now_ms < due_ms {
                    continue;
                }

                let command = schedule.command;

                // Poll-guard: skip while outstanding jobs sit at the cap.
                let outstanding = self.ctx.store.outstanding(plugin, command);
                if outstanding >= plugin_config.max_outstanding_polls as usize {
                    self.ctx.bus.publish(Event::SchedulerSkipped {
                        plugin: plugin.clone(),
                        command,
                        reason: SkipReason::OutstandingPoll,
                    });
                    continue;
                }

                // Breaker gate; an elapsed cooldown admits one probe.
                let mut breaker = self.ctx.store.breaker(plugin, command);
                if breaker.blocks_poll(now_ms) {
                    self.ctx.bus.publish(Event::SchedulerSkipped {
                        plugin: plugin.clone(),
                        command,
                        reason: SkipReason::CircuitOpen,
                    });
                    continue;
                }
                if breaker.cooldown_elapsed(now_ms) {
                    breaker.begin_probe();
                    // Persist before enqueueing so a crash between the two
                    // cannot leak extra probes.
                    self.ctx.store.record_breaker(plugin, command, breaker)?;
                    self.ctx.bus.publish(Event::CircuitHalfOpen {
                        plugin: plugin.clone(),
                        command,
                    });
                }

                let req = NewJob::new(plugin.clone(), command, SubmittedBy::Scheduler)
                    .with_max_attempts(plugin_config.retry.max_attempts);
                match self.ctx.enqueue(req, now_ms)? {
                    ductile_storage::Enqueued::Created(job) => {
                        self.ctx.bus.publish(Event::SchedulerScheduled {
                            plugin: plugin.clone(),
                            command,
                            job: job.id,
                        });
                    }
                    ductile_storage::Enqueued::Deduplicated { .. } => {
                        // Scheduled polls carry no dedupe key; unreachable
                        // in practice but harmless.
                        warn!(plugin = %plugin, "scheduled poll deduplicated");
                    }
                }
            }
        }
        Ok(())
    }

    /// Forget jitter draws for plugins that left the config (reload).
    pub fn retain_plugins(&self, known: &[String]) {
        self.draws
            .lock()
            .retain(|(plugin, _), _| known.contains(plugin));
    }

    /// When this schedule entry is next due, drawing jitter once per run.
    pub(crate) fn due_at(&self, plugin: &str, index: usize, schedule: &ScheduleDef) -> u64 {
        let basis_ms = self.ctx.store.last_success_ms(plugin, schedule.command);

        let jitter_range_ms = schedule.jitter.map(|j| j.as_millis() as i64).unwrap_or(0);
        let offset_ms = {
            let mut draws = self.draws.lock();
            let key = (plugin.to_string(), index);
            let draw = draws.get(&key).copied();
            match draw {
                Some(existing) if existing.basis_ms == basis_ms => existing.offset_ms,
                _ => {
                    let offset_ms = if jitter_range_ms > 0 {
                        rand::thread_rng().gen_range(-jitter_range_ms / 2..=jitter_range_ms / 2)
                    } else {
                        0
                    };
                    draws.insert(
                        key,
                        JitterDraw {
                            basis_ms,
                            offset_ms,
                        },
                    );
                    offset_ms
                }
            }
        };

        // Never polled successfully: due immediately.
        let Some(basis_ms) = basis_ms else {
            return 0;
        };

        let due = basis_ms
            .saturating_add(schedule.every.as_millis() as u64)
            .saturating_add_signed(offset_ms);
        match &schedule.preferred_window {
            Some(window) => window.snap_forward(due),
            None => due,
        }
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
