// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::dispatcher::Dispatcher;
use crate::test_helpers::{engine, T0};
use ductile_core::{Command, JobStatus, PluginResponse};

const ECHO: &str = r#"
echo:
  schedules:
    - every: 5m
      jitter: 10s
"#;

fn schedule_of(e: &crate::test_helpers::TestEngine, plugin: &str) -> ScheduleDef {
    e.ctx.view().config.plugin(plugin).unwrap().schedules[0].clone()
}

#[tokio::test]
async fn never_polled_plugin_is_due_immediately() {
    let e = engine(ECHO, "");
    let scheduler = Scheduler::new(e.ctx.clone());

    scheduler.tick().unwrap();

    let queued = e.ctx.store.jobs_with_status(JobStatus::Queued);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].plugin, "echo");
    assert_eq!(queued[0].command, Command::Poll);
    assert_eq!(queued[0].submitted_by, SubmittedBy::Scheduler);
}

#[tokio::test]
async fn outstanding_poll_guard_skips_observably() {
    let e = engine(ECHO, "");
    let scheduler = Scheduler::new(e.ctx.clone());
    scheduler.tick().unwrap();

    let mut tap = e.tap();
    scheduler.tick().unwrap();

    assert_eq!(e.ctx.store.jobs_with_status(JobStatus::Queued).len(), 1);
    assert!(tap.drain().iter().any(|ev| matches!(
        ev,
        Event::SchedulerSkipped { reason: SkipReason::OutstandingPoll, .. }
    )));
}

#[tokio::test]
async fn disabled_plugins_are_never_scheduled() {
    let e = engine("echo:\n  enabled: false\n  schedules:\n    - every: 5m\n", "");
    let scheduler = Scheduler::new(e.ctx.clone());
    scheduler.tick().unwrap();
    assert!(e.ctx.store.jobs_with_status(JobStatus::Queued).is_empty());
}

#[tokio::test]
async fn next_run_is_interval_after_last_success_with_stable_jitter() {
    let e = engine(ECHO, "");
    let scheduler = Scheduler::new(e.ctx.clone());

    // First poll runs and succeeds at T0.
    scheduler.tick().unwrap();
    e.runner.push_response(PluginResponse::ok());
    Dispatcher::new(e.ctx.clone()).dispatch_next().await.unwrap();
    assert_eq!(e.ctx.store.last_success_ms("echo", Command::Poll), Some(T0));

    let schedule = schedule_of(&e, "echo");
    let due = scheduler.due_at("echo", 0, &schedule);

    // due = T0 + 5m ± 5s, fixed once chosen for this run.
    let lower = T0 + 300_000 - 5_000;
    let upper = T0 + 300_000 + 5_000;
    assert!((lower..=upper).contains(&due), "due was {due}");
    for _ in 0..10 {
        assert_eq!(scheduler.due_at("echo", 0, &schedule), due, "re-tick rerolled jitter");
    }

    // Before the due time nothing is scheduled; after it, one poll is.
    e.clock.set_ms(lower - 1);
    scheduler.tick().unwrap();
    assert!(e.ctx.store.jobs_with_status(JobStatus::Queued).is_empty());

    e.clock.set_ms(upper);
    scheduler.tick().unwrap();
    assert_eq!(e.ctx.store.jobs_with_status(JobStatus::Queued).len(), 1);
}

#[tokio::test]
async fn new_success_rerolls_jitter_basis() {
    let e = engine(ECHO, "");
    let scheduler = Scheduler::new(e.ctx.clone());
    let schedule = schedule_of(&e, "echo");

    scheduler.tick().unwrap();
    e.runner.push_response(PluginResponse::ok());
    Dispatcher::new(e.ctx.clone()).dispatch_next().await.unwrap();
    let first_due = scheduler.due_at("echo", 0, &schedule);

    // A later success moves the basis; the due time follows it.
    e.clock.set_ms(first_due + 10_000);
    scheduler.tick().unwrap();
    e.runner.push_response(PluginResponse::ok());
    Dispatcher::new(e.ctx.clone()).dispatch_next().await.unwrap();

    let second_basis = e.ctx.store.last_success_ms("echo", Command::Poll).unwrap();
    let second_due = scheduler.due_at("echo", 0, &schedule);
    assert!(second_basis > T0);
    assert!(second_due >= second_basis + 300_000 - 5_000);
    assert!(second_due > first_due);
}

#[tokio::test]
async fn preferred_window_snaps_forward() {
    // Poll daily inside a two-hour UTC window.
    let e = engine(
        "echo:\n  schedules:\n    - every: 1d\n      preferred_window: 09:00-11:00\n",
        "",
    );
    let scheduler = Scheduler::new(e.ctx.clone());
    let schedule = schedule_of(&e, "echo");

    // Succeed once at T0 so the next run has a basis.
    scheduler.tick().unwrap();
    e.runner.push_response(PluginResponse::ok());
    Dispatcher::new(e.ctx.clone()).dispatch_next().await.unwrap();

    let due = scheduler.due_at("echo", 0, &schedule);
    const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;
    let minute_of_day = (due % MS_PER_DAY) / 60_000;
    assert!(
        (9 * 60..11 * 60).contains(&(minute_of_day as u32)),
        "due landed at minute {minute_of_day}"
    );
}

#[tokio::test]
async fn health_schedules_enqueue_health_commands() {
    let e = engine("probe:\n  schedules:\n    - every: 1m\n      command: health\n", "");
    let scheduler = Scheduler::new(e.ctx.clone());
    scheduler.tick().unwrap();

    let queued = e.ctx.store.jobs_with_status(JobStatus::Queued);
    assert_eq!(queued[0].command, Command::Health);
}

#[tokio::test]
async fn reload_drops_jitter_state_for_removed_plugins() {
    let e = engine(ECHO, "");
    let scheduler = Scheduler::new(e.ctx.clone());
    scheduler.tick().unwrap();

    // Keep only an unrelated plugin; the draw map forgets "echo".
    scheduler.retain_plugins(&["other".to_string()]);
    // A subsequent tick rebuilds state without panicking.
    scheduler.tick().unwrap();
}
