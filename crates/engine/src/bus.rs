// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process observability bus.
//!
//! Fan-out is `tokio::sync::broadcast`: publishers never block, and a slow
//! subscriber drops its oldest pending events. A bounded replay ring keeps
//! the most recent events so late subscribers (a TUI attaching mid-run) can
//! catch up. Dropped counts are surfaced to the lagging subscriber as a
//! `bus:lagged` event rather than lost silently.

use ductile_core::limits::DEFAULT_RING_CAPACITY;
use ductile_core::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    ring: Arc<Mutex<VecDeque<Event>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Publish an event. Never blocks; having no subscribers is fine.
    pub fn publish(&self, event: Event) {
        trace!(event = %event.log_summary(), "bus publish");
        {
            let mut ring = self.ring.lock();
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }
        let _ = self.tx.send(event);
    }

    /// Subscribe, replaying the ring of recent events first.
    pub fn subscribe(&self) -> BusSubscription {
        // Lock the ring before subscribing so no event is both missed by
        // the replay and published before the receiver existed.
        let ring = self.ring.lock();
        let rx = self.tx.subscribe();
        BusSubscription {
            replay: ring.iter().cloned().collect(),
            rx,
        }
    }

    /// Snapshot of the replay ring (diagnostics).
    pub fn recent(&self) -> Vec<Event> {
        self.ring.lock().iter().cloned().collect()
    }
}

/// One subscriber's view of the bus.
pub struct BusSubscription {
    replay: VecDeque<Event>,
    rx: broadcast::Receiver<Event>,
}

impl BusSubscription {
    /// Next event: ring replay first, then live delivery. `None` when the
    /// bus is gone. Lag shows up in-band as `bus:lagged`.
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Some(Event::BusLagged { missed })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking variant for polling consumers.
    pub fn try_recv(&mut self) -> Option<Event> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                Some(Event::BusLagged { missed })
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
