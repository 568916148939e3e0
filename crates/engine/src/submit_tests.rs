// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::dispatcher::Dispatcher;
use crate::test_helpers::engine;
use ductile_core::{JobStatus, PluginResponse};
use serde_json::json;

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

#[tokio::test]
async fn unknown_plugin_is_rejected() {
    let e = engine("echo: {}\n", "");
    let result = submit_job(&e.ctx, "ghost", Command::Poll, json!({}), None, SubmittedBy::Api);
    assert!(matches!(result, Err(SubmitError::PluginUnknown(name)) if name == "ghost"));
}

#[tokio::test]
async fn accepted_job_carries_submitter_and_payload() {
    let e = engine("echo: {}\n", "");
    let submitted = submit_job(
        &e.ctx,
        "echo",
        Command::Handle,
        json!({"n": 1}),
        None,
        SubmittedBy::Webhook,
    )
    .unwrap();

    let Submitted::Accepted(job) = submitted else {
        panic!("expected acceptance");
    };
    assert_eq!(job.submitted_by, SubmittedBy::Webhook);
    assert_eq!(job.payload["n"], 1);
    assert!(job.pipeline_name.is_none(), "standalone execution");
}

#[tokio::test]
async fn dedupe_is_an_explicit_result_not_an_error() {
    let e = engine("notify: {}\n", "");

    let first = submit_job(
        &e.ctx,
        "notify",
        Command::Handle,
        json!({}),
        Some("alert-2026-02-15".into()),
        SubmittedBy::Api,
    )
    .unwrap();
    let Submitted::Accepted(first_job) = first else {
        panic!("expected acceptance");
    };

    // Run it to success, then resubmit inside the TTL window.
    e.runner.push_response(PluginResponse::ok());
    Dispatcher::new(e.ctx.clone()).dispatch_next().await.unwrap();

    let second = submit_job(
        &e.ctx,
        "notify",
        Command::Handle,
        json!({}),
        Some("alert-2026-02-15".into()),
        SubmittedBy::Api,
    )
    .unwrap();
    assert_eq!(
        second,
        Submitted::Deduplicated {
            existing: first_job.id
        }
    );
    // No second job was created.
    assert!(e.ctx.store.jobs_with_status(JobStatus::Queued).is_empty());
}

#[tokio::test]
async fn matched_trigger_opens_a_pinned_chain() {
    let e = engine("", WISDOM);
    let jobs = submit_event(
        &e.ctx,
        "discord.link_posted",
        json!({"url": "https://example/v", "channel_id": "C1"}),
        SubmittedBy::Webhook,
    )
    .unwrap();

    assert_eq!(jobs.len(), 1);
    let entry = &jobs[0];
    assert_eq!(entry.plugin, "transcriber");
    assert_eq!(entry.pipeline_name.as_deref(), Some("wisdom"));
    assert_eq!(entry.pipeline_step_id.as_deref(), Some("transcribe"));
    assert!(entry.pipeline_fingerprint.is_some());

    // The entry context is seeded with payload and baggage.
    let context = e
        .ctx
        .store
        .context(entry.event_context_id.as_ref().unwrap())
        .unwrap();
    assert_eq!(context.hop_count, 0);
    assert!(context.parent_event_id.is_none());
    assert_eq!(context.accumulated["channel_id"], "C1");
    assert_eq!(context.accumulated["discord"]["url"], "https://example/v");
}

#[tokio::test]
async fn multiple_matching_triggers_all_fan_out() {
    let e = engine(
        "",
        r#"
alpha:
  on: item.found
  steps:
    - plugin: a
beta:
  on: item.found
  steps:
    - plugin: b
"#,
    );
    let jobs = submit_event(&e.ctx, "item.found", json!({}), SubmittedBy::Api).unwrap();
    let mut pipelines: Vec<&str> = jobs.iter().filter_map(|j| j.pipeline_name.as_deref()).collect();
    pipelines.sort();
    assert_eq!(pipelines, vec!["alpha", "beta"]);
}
