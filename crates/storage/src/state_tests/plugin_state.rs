// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn merge_creates_row_when_absent() {
    let mut state = MaterializedState::default();
    state.apply_event(&Event::StateMerged {
        plugin: "echo".into(),
        updates: json!({"last_run": "T1"}),
        updated_at_ms: 100,
    });

    let row = &state.plugin_state["echo"];
    assert_eq!(row.value, json!({"last_run": "T1"}));
    assert_eq!(row.updated_at_ms, 100);
}

#[test]
fn merge_replaces_top_level_keys_only() {
    let mut state = MaterializedState::default();
    state.apply_event(&Event::StateMerged {
        plugin: "echo".into(),
        updates: json!({"cursor": {"page": 1}, "etag": "a"}),
        updated_at_ms: 100,
    });
    state.apply_event(&Event::StateMerged {
        plugin: "echo".into(),
        updates: json!({"cursor": {"page": 2}}),
        updated_at_ms: 200,
    });

    let row = &state.plugin_state["echo"];
    // Shallow: the whole `cursor` object is replaced, `etag` survives.
    assert_eq!(row.value, json!({"cursor": {"page": 2}, "etag": "a"}));
    assert_eq!(row.updated_at_ms, 200);
}

#[test]
fn merge_is_idempotent_on_replay() {
    let mut state = MaterializedState::default();
    let event = Event::StateMerged {
        plugin: "echo".into(),
        updates: json!({"n": 1}),
        updated_at_ms: 100,
    };
    state.apply_event(&event);
    let once = state.clone();
    state.apply_event(&event);
    assert_eq!(state, once);
}

#[test]
fn plugins_have_independent_rows() {
    let mut state = MaterializedState::default();
    state.apply_event(&Event::StateMerged {
        plugin: "a".into(),
        updates: json!({"v": 1}),
        updated_at_ms: 100,
    });
    state.apply_event(&Event::StateMerged {
        plugin: "b".into(),
        updates: json!({"v": 2}),
        updated_at_ms: 100,
    });

    assert_eq!(state.plugin_state["a"].value, json!({"v": 1}));
    assert_eq!(state.plugin_state["b"].value, json!({"v": 2}));
}
