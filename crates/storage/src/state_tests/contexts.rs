// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use ductile_core::EventContext;

fn context(event_id: &str) -> EventContext {
    EventContext::entry(
        EventId::new(event_id),
        JobId::new("job-1"),
        "wisdom",
        "transcribe",
        "discord.link_posted",
        "discord",
        json!({"url": "https://example/v"}),
        1_000,
    )
}

#[test]
fn created_inserts_context() {
    let mut state = MaterializedState::default();
    state.apply_event(&Event::ContextCreated {
        context: context("evt-1"),
    });
    assert!(state.event_contexts.contains_key("evt-1"));
}

#[test]
fn contexts_are_immutable_under_replay() {
    let mut state = MaterializedState::default();
    state.apply_event(&Event::ContextCreated {
        context: context("evt-1"),
    });

    // A conflicting replay with the same id must not overwrite.
    let mut altered = context("evt-1");
    altered.emitted_event_type = "tampered".into();
    state.apply_event(&Event::ContextCreated { context: altered });

    assert_eq!(
        state.event_contexts["evt-1"].emitted_event_type,
        "discord.link_posted"
    );
}

#[test]
fn breaker_changed_replaces_whole_row() {
    use ductile_core::{BreakerState, CircuitBreaker};

    let mut state = MaterializedState::default();
    let mut breaker = CircuitBreaker::default();
    breaker.record_failure(1_000, 1, 60_000);
    state.apply_event(&Event::BreakerChanged {
        plugin: "echo".into(),
        command: Command::Poll,
        breaker: breaker.clone(),
    });
    assert_eq!(state.breaker("echo", Command::Poll).state, BreakerState::Open);

    state.apply_event(&Event::BreakerChanged {
        plugin: "echo".into(),
        command: Command::Poll,
        breaker: CircuitBreaker::default(),
    });
    assert_eq!(
        state.breaker("echo", Command::Poll).state,
        BreakerState::Closed
    );
}

#[test]
fn breaker_rows_are_keyed_per_command() {
    use ductile_core::CircuitBreaker;

    let mut state = MaterializedState::default();
    let mut tripped = CircuitBreaker::default();
    tripped.record_failure(0, 1, 1_000);
    state.apply_event(&Event::BreakerChanged {
        plugin: "echo".into(),
        command: Command::Poll,
        breaker: tripped,
    });

    assert!(state.breaker("echo", Command::Poll).blocks_poll(500));
    assert!(!state.breaker("echo", Command::Health).blocks_poll(500));
}
