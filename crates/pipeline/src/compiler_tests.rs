// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::ast::StepDoc;
use indexmap::indexmap;

fn docs_from_yaml(yaml: &str) -> IndexMap<String, PipelineDoc> {
    serde_yaml::from_str(yaml).expect("parse pipeline yaml")
}

fn wisdom_docs() -> IndexMap<String, PipelineDoc> {
    docs_from_yaml(
        r#"
wisdom:
  on: discord.link_posted
  steps:
    - id: transcribe
      plugin: transcriber
      on:
        transcript.ready: summarize
    - id: summarize
      plugin: summarizer
"#,
    )
}

// ── Linking ──────────────────────────────────────────────────────────────────

#[test]
fn compiles_two_step_pipeline() {
    let set = compile_set(&wisdom_docs()).unwrap();
    let pipeline = &set["wisdom"];
    assert_eq!(pipeline.trigger, "discord.link_posted");
    assert_eq!(pipeline.entry, "transcribe");

    let transcribe = pipeline.step("transcribe").unwrap();
    assert_eq!(transcribe.plugin, "transcriber");
    assert_eq!(transcribe.command, Command::Handle);
    assert_eq!(
        transcribe.transitions["transcript.ready"],
        vec![StepRef {
            pipeline: "wisdom".into(),
            step_id: "summarize".into()
        }]
    );
}

#[test]
fn links_call_to_target_entry_step() {
    let docs = docs_from_yaml(
        r#"
main:
  on: item.found
  steps:
    - plugin: fetch
      on:
        item.fetched: { call: publish }
publish:
  on: publish.requested
  steps:
    - id: render
      plugin: renderer
"#,
    );
    let set = compile_set(&docs).unwrap();
    assert_eq!(
        set["main"].step("fetch").unwrap().transitions["item.fetched"],
        vec![StepRef {
            pipeline: "publish".into(),
            step_id: "render".into()
        }]
    );
}

#[test]
fn split_yields_multiple_successors_in_declared_order() {
    let docs = docs_from_yaml(
        r#"
fan:
  on: item.found
  steps:
    - plugin: source
      on:
        item.ready: [archive, notify]
    - plugin: archive
    - plugin: notify
"#,
    );
    let set = compile_set(&docs).unwrap();
    let successors = &set["fan"].step("source").unwrap().transitions["item.ready"];
    assert_eq!(successors.len(), 2);
    assert_eq!(successors[0].step_id, "archive");
    assert_eq!(successors[1].step_id, "notify");
}

// ── Rejection ────────────────────────────────────────────────────────────────

#[test]
fn unknown_step_target_is_rejected() {
    let docs = docs_from_yaml(
        r#"
broken:
  on: x.y
  steps:
    - plugin: a
      on:
        a.done: missing
"#,
    );
    assert!(matches!(
        compile_set(&docs),
        Err(CompileError::UnknownStep { target, .. }) if target == "missing"
    ));
}

#[test]
fn unknown_call_target_is_rejected() {
    let docs = docs_from_yaml(
        r#"
broken:
  on: x.y
  steps:
    - plugin: a
      on:
        a.done: { call: nowhere }
"#,
    );
    assert!(matches!(
        compile_set(&docs),
        Err(CompileError::UnknownCall { target, .. }) if target == "nowhere"
    ));
}

#[test]
fn duplicate_step_ids_are_rejected() {
    let docs = docs_from_yaml(
        r#"
broken:
  on: x.y
  steps:
    - plugin: a
    - plugin: a
"#,
    );
    assert!(matches!(
        compile_set(&docs),
        Err(CompileError::DuplicateStep { step, .. }) if step == "a"
    ));
}

#[test]
fn empty_pipeline_is_rejected() {
    let docs = docs_from_yaml("empty:\n  on: x.y\n  steps: []\n");
    assert!(matches!(compile_set(&docs), Err(CompileError::NoSteps { .. })));
}

#[test]
fn call_cycle_is_rejected_and_names_the_cycle() {
    let docs = docs_from_yaml(
        r#"
a:
  on: a.start
  steps:
    - plugin: one
      on:
        one.done: { call: b }
b:
  on: b.start
  steps:
    - plugin: two
      on:
        two.done: { call: a }
"#,
    );
    match compile_set(&docs) {
        Err(CompileError::CallCycle { path }) => {
            assert!(path.contains(&"a".to_string()));
            assert!(path.contains(&"b".to_string()));
        }
        other => panic!("expected call cycle, got {other:?}"),
    }
}

#[test]
fn step_cycle_is_rejected() {
    let docs = docs_from_yaml(
        r#"
loopy:
  on: x.y
  steps:
    - plugin: a
      on:
        a.done: b
    - plugin: b
      on:
        b.done: a
"#,
    );
    assert!(matches!(
        compile_set(&docs),
        Err(CompileError::StepCycle { pipeline, .. }) if pipeline == "loopy"
    ));
}

#[test]
fn self_loop_is_rejected() {
    let docs = docs_from_yaml(
        r#"
loopy:
  on: x.y
  steps:
    - plugin: a
      on:
        a.retry: a
"#,
    );
    assert!(matches!(compile_set(&docs), Err(CompileError::StepCycle { .. })));
}

// ── Fingerprint ──────────────────────────────────────────────────────────────

#[test]
fn fingerprint_is_deterministic_across_compiles() {
    let first = compile_set(&wisdom_docs()).unwrap();
    let second = compile_set(&wisdom_docs()).unwrap();
    assert_eq!(first["wisdom"].fingerprint, second["wisdom"].fingerprint);
    assert_eq!(first["wisdom"].fingerprint.len(), 64);
}

#[test]
fn fingerprint_changes_when_routing_changes() {
    let base = compile_set(&wisdom_docs()).unwrap();

    let changed_docs = docs_from_yaml(
        r#"
wisdom:
  on: discord.link_posted
  steps:
    - id: transcribe
      plugin: transcriber
      on:
        transcript.ready: summarize
        transcript.failed: summarize
    - id: summarize
      plugin: summarizer
"#,
    );
    let changed = compile_set(&changed_docs).unwrap();
    assert_ne!(base["wisdom"].fingerprint, changed["wisdom"].fingerprint);
}

#[test]
fn fingerprints_differ_between_pipelines() {
    let docs = indexmap! {
        "one".to_string() => PipelineDoc {
            on: "x.y".into(),
            steps: vec![StepDoc { id: None, plugin: "a".into(), command: Command::Handle, on: Default::default() }],
        },
        "two".to_string() => PipelineDoc {
            on: "x.y".into(),
            steps: vec![StepDoc { id: None, plugin: "a".into(), command: Command::Handle, on: Default::default() }],
        },
    };
    let set = compile_set(&docs).unwrap();
    assert_ne!(set["one"].fingerprint, set["two"].fingerprint);
}
