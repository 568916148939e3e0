// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Routing, context propagation, and workspace cloning across hops.

use super::*;
use crate::submit::{submit_event, SubmitError};

const WISDOM: &str = r#"
wisdom:
  on: discord.link_posted
  steps:
    - id: transcribe
      plugin: transcriber
      on:
        transcript.ready: summarize
    - id: summarize
      plugin: summarizer
"#;

const FAN: &str = r#"
fan:
  on: item.found
  steps:
    - id: source
      plugin: source
      on:
        item.ready: [archive, notify]
    - id: archive
      plugin: archive
    - id: notify
      plugin: notify
"#;

fn entry_job(e: &crate::test_helpers::TestEngine, event_type: &str, payload: serde_json::Value) -> Job {
    let jobs = submit_event(&e.ctx, event_type, payload, SubmittedBy::Webhook).expect("submit");
    assert_eq!(jobs.len(), 1);
    jobs.into_iter().next().expect("entry job")
}

// ── Two-hop chain (baggage + workspace propagation) ──────────────────────────

#[tokio::test]
async fn two_hop_chain_propagates_context_and_workspace() {
    let e = engine("", WISDOM);
    let entry = entry_job(
        &e,
        "discord.link_posted",
        json!({"url": "https://example/v", "channel_id": "C1"}),
    );
    assert_eq!(entry.pipeline_step_id.as_deref(), Some("transcribe"));
    assert!(entry.pipeline_fingerprint.is_some());

    // The transcriber leaves an artifact in its workspace before emitting.
    let entry_ws = e.ctx.workspaces.ensure(&entry.id).unwrap();
    std::fs::write(entry_ws.join("transcript.txt"), b"hello").unwrap();

    e.runner.push_response(ok_with_events(vec![emitted(
        "transcript.ready",
        json!({"text": "hello"}),
    )]));
    assert!(dispatch_one(&e).await);

    // Hop two exists, correctly pinned and attributed.
    let queued = e.ctx.store.jobs_with_status(JobStatus::Queued);
    assert_eq!(queued.len(), 1);
    let successor = &queued[0];
    assert_eq!(successor.plugin, "summarizer");
    assert_eq!(successor.command, Command::Handle);
    assert_eq!(successor.pipeline_step_id.as_deref(), Some("summarize"));
    assert_eq!(successor.pipeline_fingerprint, entry.pipeline_fingerprint);
    assert_eq!(successor.parent_job_id.as_ref(), Some(&entry.id));
    assert!(successor.source_event_id.is_some());

    // Context: baggage survives alongside the namespaced contribution.
    let context = e
        .ctx
        .store
        .context(successor.event_context_id.as_ref().unwrap())
        .unwrap();
    assert_eq!(context.hop_count, 1);
    assert_eq!(context.accumulated["channel_id"], "C1");
    assert_eq!(context.accumulated["transcriber"]["text"], "hello");
    assert_eq!(context.emitted_event_type, "transcript.ready");

    // Workspace: a hard-linked clone of the producer's.
    use std::os::unix::fs::MetadataExt;
    let successor_ws = e.ctx.workspaces.path_for(&successor.id);
    let src_meta = std::fs::metadata(entry_ws.join("transcript.txt")).unwrap();
    let dst_meta = std::fs::metadata(successor_ws.join("transcript.txt")).unwrap();
    assert_eq!(src_meta.ino(), dst_meta.ino());

    // Hop two sees the accumulated context and the hop payload as event.
    e.runner.push_response(PluginResponse::ok());
    assert!(dispatch_one(&e).await);
    let request = request_of(&e.runner.invocations()[1]);
    assert_eq!(request.event, Some(json!({"text": "hello"})));
    let accumulated = &request.event_context.as_ref().unwrap().accumulated;
    assert_eq!(accumulated["channel_id"], "C1");
    assert_eq!(accumulated["transcriber"]["text"], "hello");
}

#[tokio::test]
async fn downstream_is_enqueued_only_after_producer_succeeds() {
    let e = engine("", WISDOM);
    entry_job(&e, "discord.link_posted", json!({"url": "u"}));

    // Producer fails: no successor may appear.
    e.runner.push_response(PluginResponse::error("no audio", false));
    dispatch_one(&e).await;

    assert!(e.ctx.store.jobs_with_status(JobStatus::Queued).is_empty());
    assert!(!dispatch_one(&e).await, "queue is empty");
}

// ── Fan-out ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn split_fans_out_independent_branches() {
    let e = engine("", FAN);
    let entry = entry_job(&e, "item.found", json!({"id": 7}));

    e.runner.push_response(ok_with_events(vec![emitted(
        "item.ready",
        json!({"id": 7, "trace_id": "t-1"}),
    )]));
    dispatch_one(&e).await;

    let mut queued = e.ctx.store.jobs_with_status(JobStatus::Queued);
    queued.sort_by(|a, b| a.plugin.cmp(&b.plugin));
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0].plugin, "archive");
    assert_eq!(queued[1].plugin, "notify");

    // Same augmented source event, distinct sibling contexts.
    assert_eq!(queued[0].source_event_id, queued[1].source_event_id);
    assert_ne!(queued[0].event_context_id, queued[1].event_context_id);

    let left = e.ctx.store.context(queued[0].event_context_id.as_ref().unwrap()).unwrap();
    let right = e.ctx.store.context(queued[1].event_context_id.as_ref().unwrap()).unwrap();
    assert_eq!(left.parent_event_id, right.parent_event_id);
    assert_ne!(left.event_id, right.event_id);
    assert_eq!(left.accumulated["trace_id"], "t-1");

    // Sibling workspaces are isolated from each other.
    let left_ws = e.ctx.workspaces.path_for(&queued[0].id);
    let right_ws = e.ctx.workspaces.path_for(&queued[1].id);
    std::fs::write(left_ws.join("mine.txt"), b"archive").unwrap();
    assert!(!right_ws.join("mine.txt").exists());

    assert!(queued.iter().all(|j| j.parent_job_id.as_ref() == Some(&entry.id)));
}

// ── No-match / hop guard / dedupe ────────────────────────────────────────────

#[tokio::test]
async fn unmatched_event_type_is_observable_noop() {
    let e = engine("", WISDOM);
    entry_job(&e, "discord.link_posted", json!({}));
    let mut tap = e.tap();

    e.runner.push_response(ok_with_events(vec![emitted(
        "transcript.failed",
        json!({}),
    )]));
    dispatch_one(&e).await;

    assert!(e.ctx.store.jobs_with_status(JobStatus::Queued).is_empty());
    assert!(tap.drain().iter().any(|ev| matches!(
        ev,
        Event::RouterNoMatch { event_type, .. } if event_type == "transcript.failed"
    )));
}

#[tokio::test]
async fn hop_limit_rejects_further_successors() {
    let e = engine("", WISDOM);
    let entry = entry_job(&e, "discord.link_posted", json!({}));
    let mut tap = e.tap();

    // Rewrite the entry job's context to sit at the hop ceiling.
    let deep = EventContext {
        hop_count: ductile_core::limits::DEFAULT_MAX_HOPS,
        ..e.ctx
            .store
            .context(entry.event_context_id.as_ref().unwrap())
            .unwrap()
    };
    let deep = EventContext {
        event_id: ductile_core::EventId::new("deep-ctx"),
        ..deep
    };
    e.ctx.store.insert_context(&deep).unwrap();
    // Point a fresh entry-step job at the deep context.
    let mut req = NewJob::new("transcriber", Command::Handle, SubmittedBy::Api)
        .with_pipeline("wisdom", "transcribe", entry.pipeline_fingerprint.clone().unwrap());
    req.event_context_id = Some(deep.event_id.clone());
    e.ctx.enqueue(req, e.clock.epoch_ms()).unwrap();

    // Drain the original entry job first (no events), then the deep one.
    e.runner.push_response(PluginResponse::ok());
    e.runner.push_response(ok_with_events(vec![emitted(
        "transcript.ready",
        json!({}),
    )]));
    dispatch_all(&e).await;

    assert!(e.ctx.store.jobs_with_status(JobStatus::Queued).is_empty());
    assert!(tap
        .drain()
        .iter()
        .any(|ev| matches!(ev, Event::HopLimitExceeded { .. })));
}

#[tokio::test]
async fn deduplicated_successor_is_dropped_observably() {
    let e = engine("", WISDOM);

    // A succeeded summarizer job already owns the dedupe key.
    let prior = match e
        .ctx
        .enqueue(
            NewJob::new("summarizer", Command::Handle, SubmittedBy::Api)
                .with_dedupe_key("video-1"),
            e.clock.epoch_ms(),
        )
        .unwrap()
    {
        Enqueued::Created(job) => job,
        Enqueued::Deduplicated { .. } => unreachable!(),
    };
    e.runner.push_response(PluginResponse::ok());
    dispatch_one(&e).await;
    assert_eq!(e.ctx.store.find_job(&prior.id).unwrap().status, JobStatus::Succeeded);

    // A chain emits the same key for the same plugin.
    entry_job(&e, "discord.link_posted", json!({}));
    let mut tap = e.tap();
    e.runner.push_response(ok_with_events(vec![EmittedEvent {
        event_type: "transcript.ready".into(),
        payload: json!({}),
        dedupe_key: Some("video-1".into()),
    }]));
    dispatch_one(&e).await;

    // No successor job; the drop is an event, not an error.
    assert!(e.ctx.store.jobs_with_status(JobStatus::Queued).is_empty());
    let events = tap.drain();
    assert!(events.iter().any(|ev| matches!(
        ev,
        Event::JobDeduplicated { existing, .. } if *existing == prior.id
    )));
}

#[tokio::test]
async fn standalone_job_can_open_a_pipeline_chain() {
    let e = engine("watcher: {}\n", WISDOM);

    // A standalone poll emits the trigger event type; the pipeline opens.
    e.ctx
        .enqueue(NewJob::new("watcher", Command::Poll, SubmittedBy::Scheduler), T0)
        .unwrap();
    e.runner.push_response(ok_with_events(vec![emitted(
        "discord.link_posted",
        json!({"url": "u", "channel_id": "C9"}),
    )]));
    dispatch_one(&e).await;

    let queued = e.ctx.store.jobs_with_status(JobStatus::Queued);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].plugin, "transcriber");
    assert_eq!(queued[0].pipeline_name.as_deref(), Some("wisdom"));

    let context = e
        .ctx
        .store
        .context(queued[0].event_context_id.as_ref().unwrap())
        .unwrap();
    assert_eq!(context.hop_count, 0);
    assert_eq!(context.accumulated["channel_id"], "C9");
    // Namespaced under the emitting plugin.
    assert_eq!(context.accumulated["watcher"]["url"], "u");
}

#[tokio::test]
async fn submit_event_without_listeners_creates_nothing() {
    let e = engine("", WISDOM);
    let jobs = submit_event(&e.ctx, "unknown.event", json!({}), SubmittedBy::Api).unwrap();
    assert!(jobs.is_empty());
    assert!(e.ctx.store.jobs_with_status(JobStatus::Queued).is_empty());
}

#[tokio::test]
async fn submit_error_type_is_exported() {
    // Compile-time use of the error enum from the public surface.
    fn assert_send<T: Send>() {}
    assert_send::<SubmitError>();
}
