// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::test_helpers::{engine, TestEngine, T0};
use ductile_core::protocol::{LogLevel, PluginLog};
use ductile_core::EventContext;
use serde_json::json;

mod breaker;
mod core;
mod pipeline;

/// Run at most one job through a fresh dispatcher.
async fn dispatch_one(e: &TestEngine) -> bool {
    Dispatcher::new(e.ctx.clone())
        .dispatch_next()
        .await
        .expect("dispatch")
}

/// Drive the queue until empty (bounded; successors may enqueue more work).
async fn dispatch_all(e: &TestEngine) {
    for _ in 0..32 {
        if !dispatch_one(e).await {
            return;
        }
    }
    panic!("queue did not drain");
}

fn enqueue_poll(e: &TestEngine, plugin: &str) -> Job {
    match e
        .ctx
        .enqueue(
            NewJob::new(plugin, Command::Poll, SubmittedBy::Scheduler),
            e.clock.epoch_ms(),
        )
        .expect("enqueue")
    {
        Enqueued::Created(job) => job,
        Enqueued::Deduplicated { .. } => panic!("unexpected dedupe"),
    }
}

fn ok_with_state(state: serde_json::Value) -> PluginResponse {
    let mut response = PluginResponse::ok();
    response.state_updates = state.as_object().cloned().unwrap_or_default();
    response
}

fn ok_with_events(events: Vec<EmittedEvent>) -> PluginResponse {
    let mut response = PluginResponse::ok();
    response.events = events;
    response
}

fn emitted(event_type: &str, payload: serde_json::Value) -> EmittedEvent {
    EmittedEvent {
        event_type: event_type.to_string(),
        payload,
        dedupe_key: None,
    }
}

fn request_of(invocation: &ductile_adapters::PluginInvocation) -> PluginRequest {
    serde_json::from_slice(&invocation.request).expect("request envelope")
}
