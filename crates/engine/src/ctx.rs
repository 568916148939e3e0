// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared engine wiring: store, bus, router, runner, and the swappable
//! config view.

use crate::bus::EventBus;
use crate::resolve::PluginCatalog;
use crate::workspace::WorkspaceManager;
use ductile_adapters::PluginRunner;
use ductile_core::{Clock, Event, NewJob};
use ductile_pipeline::{Config, Router};
use ductile_storage::{Enqueued, QueueError, Store};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// The configuration snapshot the engine runs against.
///
/// Reload builds a fresh view and swaps it atomically; a dispatch that
/// already cloned the previous `Arc`s keeps its snapshot.
#[derive(Clone)]
pub struct ConfigView {
    pub config: Arc<Config>,
    pub catalog: Arc<PluginCatalog>,
}

/// Everything the scheduler and dispatcher share.
pub struct EngineCtx<R: PluginRunner, C: Clock> {
    pub store: Store,
    pub bus: EventBus,
    pub router: Router,
    pub workspaces: WorkspaceManager,
    pub runner: R,
    pub clock: C,
    view: RwLock<ConfigView>,
    /// Wakes the dispatcher when new work lands.
    pub work_available: Notify,
    /// Wakes the scheduler off its tick timer (manual wake).
    pub scheduler_wake: Notify,
    /// Single cancellation handle threaded through every loop; shutdown
    /// and timeout escalation share the mechanism.
    pub shutdown: CancellationToken,
}

impl<R: PluginRunner, C: Clock> EngineCtx<R, C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        bus: EventBus,
        router: Router,
        workspaces: WorkspaceManager,
        runner: R,
        clock: C,
        view: ConfigView,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            router,
            workspaces,
            runner,
            clock,
            view: RwLock::new(view),
            work_available: Notify::new(),
            scheduler_wake: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn view(&self) -> ConfigView {
        self.view.read().clone()
    }

    /// Swap in a new config view (reload); in-flight work keeps the old one.
    pub fn swap_view(&self, view: ConfigView) {
        *self.view.write() = view;
    }

    /// Enqueue through the store, publishing the observable outcome and
    /// waking the dispatcher on admission.
    pub fn enqueue(&self, req: NewJob, now_ms: u64) -> Result<Enqueued, QueueError> {
        self.enqueue_with_id(ductile_core::JobId::generate(), req, now_ms)
    }

    /// As [`EngineCtx::enqueue`], with a caller-minted job id.
    pub fn enqueue_with_id(
        &self,
        id: ductile_core::JobId,
        req: NewJob,
        now_ms: u64,
    ) -> Result<Enqueued, QueueError> {
        let dedupe_ttl = self.view().config.service.dedupe_ttl;
        let dedupe_key = req.dedupe_key.clone();
        let plugin = req.plugin.clone();

        let outcome = self.store.enqueue_with_id(id, req, dedupe_ttl, now_ms)?;
        match &outcome {
            Enqueued::Created(job) => {
                self.bus.publish(Event::JobEnqueued { job: job.clone() });
                self.work_available.notify_one();
            }
            Enqueued::Deduplicated { existing } => {
                self.bus.publish(Event::JobDeduplicated {
                    plugin,
                    dedupe_key: dedupe_key.unwrap_or_default(),
                    existing: existing.clone(),
                });
            }
        }
        Ok(outcome)
    }
}
