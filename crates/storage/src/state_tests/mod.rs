// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use ductile_core::{EventId, JobId, NewJob, SubmittedBy};
use serde_json::json;

mod contexts;
mod plugin_state;
mod queue;

pub(super) fn enqueued_event(id: &str, seq: u64, created_at_ms: u64) -> Event {
    let job = Job::admit(
        NewJob::new("echo", Command::Poll, SubmittedBy::Scheduler),
        JobId::new(id),
        seq,
        created_at_ms,
    );
    Event::JobEnqueued { job }
}

pub(super) fn started_event(id: &str, attempt: u32, at_ms: u64) -> Event {
    Event::JobStarted {
        id: JobId::new(id),
        attempt,
        started_at_ms: at_ms,
    }
}

#[test]
fn state_serde_round_trip() {
    let mut state = MaterializedState::default();
    state.apply_event(&enqueued_event("job-1", 1, 100));
    state.apply_event(&started_event("job-1", 1, 200));
    state.apply_event(&Event::StateMerged {
        plugin: "echo".into(),
        updates: json!({"cursor": 5}),
        updated_at_ms: 300,
    });

    let encoded = serde_json::to_string(&state).unwrap();
    let decoded: MaterializedState = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, state);
}

#[test]
fn observability_events_leave_state_untouched() {
    let mut state = MaterializedState::default();
    state.apply_event(&enqueued_event("job-1", 1, 100));
    let before = state.clone();

    state.apply_event(&Event::SchedulerSkipped {
        plugin: "echo".into(),
        command: Command::Poll,
        reason: ductile_core::SkipReason::CircuitOpen,
    });
    state.apply_event(&Event::BusLagged { missed: 10 });
    state.apply_event(&Event::Shutdown);

    assert_eq!(state, before);
}

#[yare::parameterized(
    base_empty = { json!(null), json!({"a": 1}), json!({"a": 1}) },
    replaces_top_level = { json!({"a": {"deep": 1}, "b": 2}), json!({"a": 3}), json!({"a": 3, "b": 2}) },
    empty_updates_is_identity = { json!({"a": 1}), json!({}), json!({"a": 1}) },
    adds_new_keys = { json!({"a": 1}), json!({"b": 2}), json!({"a": 1, "b": 2}) },
)]
fn shallow_merge_semantics(base: Value, updates: Value, expected: Value) {
    assert_eq!(shallow_merge(&base, &updates), expected);
}
