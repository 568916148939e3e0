// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dispatch outcomes: protocol interpretation, retries, limits.

use super::*;

const ECHO: &str = r#"
echo:
  retry:
    max_attempts: 4
    backoff_base: 30s
"#;

// ── Success path ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn poll_success_persists_state_and_emits() {
    let e = engine(ECHO, "");
    let mut tap = e.tap();
    let job = enqueue_poll(&e, "echo");

    let mut response = ok_with_state(json!({"last_run": "T1"}));
    response.logs = vec![PluginLog {
        level: LogLevel::Info,
        message: "ok".into(),
    }];
    e.runner.push_response(response);

    assert!(dispatch_one(&e).await);

    let done = e.ctx.store.find_job(&job.id).unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert!(done.completed_at_ms.is_some());
    assert_eq!(e.ctx.store.plugin_state("echo"), json!({"last_run": "T1"}));

    let events = tap.drain();
    assert!(events
        .iter()
        .any(|ev| matches!(ev, Event::JobStarted { id, .. } if *id == job.id)));
    assert!(events
        .iter()
        .any(|ev| matches!(ev, Event::PluginSpawned { .. })));
    assert!(events
        .iter()
        .any(|ev| matches!(ev, Event::JobSucceeded { id, .. } if *id == job.id)));
}

#[tokio::test]
async fn request_envelope_carries_config_state_and_deadline() {
    let e = engine(
        r#"
echo:
  config:
    token: sekrit
  timeouts:
    poll: 2s
"#,
        "",
    );
    // Pre-existing state is handed to the plugin in full.
    e.ctx
        .store
        .merge_plugin_state("echo", json!({"cursor": 9}).as_object().unwrap(), T0)
        .unwrap();

    enqueue_poll(&e, "echo");
    e.runner.push_response(PluginResponse::ok());
    dispatch_one(&e).await;

    let request = request_of(&e.runner.invocations()[0]);
    assert_eq!(request.protocol, 2);
    assert_eq!(request.command, Command::Poll);
    assert_eq!(request.config["token"], "sekrit");
    assert_eq!(request.state["cursor"], 9);
    assert!(request.event.is_none(), "poll carries no event");
    assert!(request.event_context.is_none());
    assert!(request.workspace_dir.is_absolute());
    assert!(request.workspace_dir.is_dir(), "workspace exists before spawn");
    // deadline = now + 2s override.
    assert_eq!(request.deadline_at, ductile_core::iso8601(T0 + 2_000));
}

#[tokio::test]
async fn handle_job_receives_its_payload_as_event() {
    let e = engine(ECHO, "");
    e.ctx
        .enqueue(
            NewJob::new("echo", Command::Handle, SubmittedBy::Api)
                .with_payload(json!({"url": "https://example/v"})),
            T0,
        )
        .unwrap();
    e.runner.push_response(PluginResponse::ok());
    dispatch_one(&e).await;

    let request = request_of(&e.runner.invocations()[0]);
    assert_eq!(request.event, Some(json!({"url": "https://example/v"})));
}

// ── Retry path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn error_with_retry_schedules_backoff() {
    let e = engine(ECHO, "");
    let mut tap = e.tap();
    let job = enqueue_poll(&e, "echo");
    e.runner.push_response(PluginResponse::error("upstream 503", true));

    dispatch_one(&e).await;

    let retried = e.ctx.store.find_job(&job.id).unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    assert_eq!(retried.attempt, 2);
    assert_eq!(retried.last_error.as_deref(), Some("upstream 503"));

    // backoff = 30s * 2^0 + random(0, 30s)
    let delay = retried.next_retry_at_ms.unwrap() - T0;
    assert!((30_000..60_000).contains(&delay), "delay was {delay}ms");

    assert!(tap.drain().iter().any(|ev| matches!(
        ev,
        Event::JobRetryScheduled { status: JobStatus::Failed, attempt: 2, .. }
    )));
}

#[yare::parameterized(
    first = { 1, 30_000, 60_000 },
    second = { 2, 60_000, 90_000 },
    third = { 3, 120_000, 150_000 },
    fourth = { 4, 240_000, 270_000 },
)]
fn backoff_window_doubles_per_attempt(attempt: u32, lower: u64, upper: u64) {
    // base * 2^(attempt-1) + random(0, base), base = 30s.
    for _ in 0..16 {
        let backoff = retry_backoff_ms(30_000, attempt);
        assert!((lower..upper).contains(&backoff), "attempt {attempt}: {backoff}ms");
    }
}

#[test]
fn backoff_exponent_saturates_instead_of_overflowing() {
    // Far past the cap the window stops growing but stays finite.
    let cap = 30_000u64 << 16;
    let deep = retry_backoff_ms(30_000, 1_000);
    assert!((cap..cap + 30_000).contains(&deep), "deep backoff was {deep}ms");
}

#[tokio::test]
async fn backoff_grows_with_attempts() {
    let e = engine(ECHO, "");
    let job = enqueue_poll(&e, "echo");

    // First failure: base window. Second: doubled window.
    e.runner.push_response(PluginResponse::error("e1", true));
    dispatch_one(&e).await;
    let first = e.ctx.store.find_job(&job.id).unwrap();
    let first_delay = first.next_retry_at_ms.unwrap() - e.clock.epoch_ms();

    e.clock.set_ms(first.next_retry_at_ms.unwrap());
    e.runner.push_response(PluginResponse::error("e2", true));
    dispatch_one(&e).await;
    let second = e.ctx.store.find_job(&job.id).unwrap();
    let second_delay = second.next_retry_at_ms.unwrap() - e.clock.epoch_ms();

    assert!((30_000..60_000).contains(&first_delay));
    assert!((60_000..90_000).contains(&second_delay));
    assert_eq!(second.attempt, 3);
}

#[tokio::test]
async fn exhausted_attempts_go_dead() {
    let e = engine("echo:\n  retry:\n    max_attempts: 1\n", "");
    let mut tap = e.tap();
    let job = enqueue_poll(&e, "echo");
    e.runner.push_response(PluginResponse::error("boom", true));

    dispatch_one(&e).await;

    assert_eq!(e.ctx.store.find_job(&job.id).unwrap().status, JobStatus::Dead);
    assert!(tap
        .drain()
        .iter()
        .any(|ev| matches!(ev, Event::JobDead { .. })));
}

#[tokio::test]
async fn retry_false_is_permanent() {
    let e = engine(ECHO, "");
    let job = enqueue_poll(&e, "echo");
    e.runner.push_response(PluginResponse::error("bad credentials", false));

    dispatch_one(&e).await;

    let dead = e.ctx.store.find_job(&job.id).unwrap();
    assert_eq!(dead.status, JobStatus::Dead);
    assert_eq!(dead.last_error.as_deref(), Some("bad credentials"));
}

// ── Exit codes & protocol violations ─────────────────────────────────────────

#[tokio::test]
async fn exit_78_is_permanent_even_with_ok_body() {
    let e = engine(ECHO, "");
    let job = enqueue_poll(&e, "echo");
    e.runner.push_response_with_exit(PluginResponse::ok(), 78);

    dispatch_one(&e).await;
    assert_eq!(e.ctx.store.find_job(&job.id).unwrap().status, JobStatus::Dead);
}

#[tokio::test]
async fn exit_75_with_garbage_stdout_is_transient() {
    let e = engine(ECHO, "");
    let job = enqueue_poll(&e, "echo");
    e.runner.push_raw_stdout(b"panic: lost connection\n", 75);

    dispatch_one(&e).await;
    let retried = e.ctx.store.find_job(&job.id).unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    assert_eq!(retried.attempt, 2);
}

#[tokio::test]
async fn protocol_garbage_is_permanent_and_preserved() {
    let e = engine(ECHO, "");
    let job = enqueue_poll(&e, "echo");
    e.runner.push_raw_stdout(b"Starting up...\n{\"status\":\"ok\"}", 0);

    dispatch_one(&e).await;

    let dead = e.ctx.store.find_job(&job.id).unwrap();
    assert_eq!(dead.status, JobStatus::Dead);
    assert!(dead.last_error.as_deref().unwrap().starts_with("protocol error"));

    let record = e.ctx.store.ledger_record(&job.id).unwrap();
    assert_eq!(
        record.raw_stdout.as_deref(),
        Some("Starting up...\n{\"status\":\"ok\"}")
    );
}

#[tokio::test]
async fn timeout_escalates_and_schedules_retry() {
    let e = engine("echo:\n  timeouts:\n    poll: 2s\n", "");
    let mut tap = e.tap();
    let job = enqueue_poll(&e, "echo");
    e.runner.push_timeout();

    dispatch_one(&e).await;

    let retried = e.ctx.store.find_job(&job.id).unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    assert_eq!(retried.attempt, 2);
    let delay = retried.next_retry_at_ms.unwrap() - e.clock.epoch_ms();
    assert!((30_000..60_000).contains(&delay));

    let events = tap.drain();
    assert!(events
        .iter()
        .any(|ev| matches!(ev, Event::PluginTimeout { timeout_ms: 2_000, .. })));
    assert!(events.iter().any(|ev| matches!(
        ev,
        Event::JobRetryScheduled { status: JobStatus::TimedOut, .. }
    )));

    // The runner saw the per-command override.
    assert_eq!(
        e.runner.invocations()[0].timeout,
        std::time::Duration::from_secs(2)
    );
}

// ── Resource & trust failures ────────────────────────────────────────────────

#[tokio::test]
async fn oversized_state_update_fails_the_job_permanently() {
    let e = engine(ECHO, "");
    let job = enqueue_poll(&e, "echo");
    let blob = "x".repeat(ductile_core::limits::MAX_STATE_BYTES);
    e.runner.push_response(ok_with_state(json!({ "blob": blob })));

    dispatch_one(&e).await;

    let dead = e.ctx.store.find_job(&job.id).unwrap();
    assert_eq!(dead.status, JobStatus::Dead);
    assert!(dead.last_error.as_deref().unwrap().contains("exceeds"));
    // The oversized merge never landed.
    assert_eq!(e.ctx.store.plugin_state("echo"), json!({}));
}

#[tokio::test]
async fn job_for_unloaded_plugin_dies_without_spawning() {
    let e = engine(ECHO, "");
    let job = match e
        .ctx
        .enqueue(NewJob::new("ghost", Command::Poll, SubmittedBy::Api), T0)
        .unwrap()
    {
        Enqueued::Created(job) => job,
        Enqueued::Deduplicated { .. } => unreachable!(),
    };

    dispatch_one(&e).await;

    let dead = e.ctx.store.find_job(&job.id).unwrap();
    assert_eq!(dead.status, JobStatus::Dead);
    assert!(dead.last_error.as_deref().unwrap().contains("not loaded"));
    assert!(e.runner.invocations().is_empty(), "nothing was spawned");
}

#[tokio::test]
async fn in_flight_duplicate_never_reaches_succeeded() {
    let e = engine("notify: {}\n", "");

    // Two jobs with the same key are admitted while neither has succeeded.
    let req = NewJob::new("notify", Command::Handle, SubmittedBy::Api)
        .with_dedupe_key("alert-2026-02-15");
    e.ctx.enqueue(req.clone(), T0).unwrap();
    e.ctx.enqueue(req, T0 + 1).unwrap();

    let mut tap = e.tap();
    e.runner.push_response(PluginResponse::ok());
    dispatch_all(&e).await;

    // Only the first ran; the duplicate was dropped at dispatch.
    assert_eq!(e.runner.invocations().len(), 1);
    assert_eq!(e.ctx.store.jobs_with_status(JobStatus::Succeeded).len(), 1);
    assert_eq!(e.ctx.store.jobs_with_status(JobStatus::Dead).len(), 1);
    assert!(tap
        .drain()
        .iter()
        .any(|ev| matches!(ev, Event::JobDeduplicated { .. })));
}

#[tokio::test]
async fn queue_is_strictly_serial_and_fifo() {
    let e = engine(ECHO, "");
    let first = enqueue_poll(&e, "echo");
    e.clock.advance_ms(10);
    let second = enqueue_poll(&e, "echo");

    e.runner.push_response(PluginResponse::ok());
    e.runner.push_response(PluginResponse::ok());
    dispatch_all(&e).await;

    let invocations = e.runner.invocations();
    assert_eq!(invocations.len(), 2);
    assert_eq!(request_of(&invocations[0]).job_id, first.id);
    assert_eq!(request_of(&invocations[1]).job_id, second.id);
}
