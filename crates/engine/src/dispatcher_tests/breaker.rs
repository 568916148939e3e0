// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Circuit breaker behavior across dispatch and scheduling.

use super::*;
use crate::scheduler::Scheduler;
use crate::submit::{submit_job, Submitted};
use ductile_core::{BreakerState, SkipReason};

const FLAKY: &str = r#"
flaky:
  schedules:
    - every: 5m
  retry:
    max_attempts: 1
  circuit_breaker:
    threshold: 3
    reset_after: 30m
"#;

/// Tick the scheduler, then drain the queue.
async fn tick_and_drain(e: &crate::test_helpers::TestEngine, scheduler: &Scheduler<ductile_adapters::FakePluginRunner, ductile_core::FakeClock>) {
    scheduler.tick().expect("tick");
    dispatch_all(e).await;
}

#[tokio::test]
async fn three_consecutive_poll_failures_open_the_circuit() {
    let e = engine(FLAKY, "");
    let scheduler = Scheduler::new(e.ctx.clone());
    let mut tap = e.tap();

    for n in 0..3 {
        e.runner.push_response(PluginResponse::error("upstream down", true));
        tick_and_drain(&e, &scheduler).await;
        e.clock.advance_ms(1_000 * (n + 1));
    }

    let breaker = e.ctx.store.breaker("flaky", Command::Poll);
    assert_eq!(breaker.state, BreakerState::Open);
    assert_eq!(
        breaker.cooldown_until_ms.unwrap() - breaker.opened_at_ms.unwrap(),
        30 * 60 * 1000
    );
    assert!(tap
        .drain()
        .iter()
        .any(|ev| matches!(ev, Event::CircuitOpened { .. })));

    // Next tick: skipped, observable, nothing enqueued.
    let mut tap = e.tap();
    scheduler.tick().unwrap();
    assert!(e.ctx.store.jobs_with_status(JobStatus::Queued).is_empty());
    assert!(tap.drain().iter().any(|ev| matches!(
        ev,
        Event::SchedulerSkipped { reason: SkipReason::CircuitOpen, .. }
    )));

    // An external handle call is never blocked by the breaker.
    e.runner.push_response(PluginResponse::ok());
    let submitted = submit_job(
        &e.ctx,
        "flaky",
        Command::Handle,
        json!({}),
        None,
        SubmittedBy::Api,
    )
    .unwrap();
    assert!(matches!(submitted, Submitted::Accepted(_)));
    assert!(dispatch_one(&e).await, "handle job dispatched despite open breaker");
}

#[tokio::test]
async fn elapsed_cooldown_admits_one_half_open_probe() {
    let e = engine(FLAKY, "");
    let scheduler = Scheduler::new(e.ctx.clone());

    for _ in 0..3 {
        e.runner.push_response(PluginResponse::error("down", true));
        tick_and_drain(&e, &scheduler).await;
    }
    assert_eq!(e.ctx.store.breaker("flaky", Command::Poll).state, BreakerState::Open);

    // Cooldown passes; the next tick transitions to half-open and enqueues
    // exactly one probe.
    e.clock.advance_ms(30 * 60 * 1000 + 1);
    let mut tap = e.tap();
    scheduler.tick().unwrap();

    assert_eq!(e.ctx.store.breaker("flaky", Command::Poll).state, BreakerState::HalfOpen);
    assert_eq!(e.ctx.store.jobs_with_status(JobStatus::Queued).len(), 1);
    assert!(tap
        .drain()
        .iter()
        .any(|ev| matches!(ev, Event::CircuitHalfOpen { .. })));
}

#[tokio::test]
async fn successful_probe_closes_the_circuit() {
    let e = engine(FLAKY, "");
    let scheduler = Scheduler::new(e.ctx.clone());

    for _ in 0..3 {
        e.runner.push_response(PluginResponse::error("down", true));
        tick_and_drain(&e, &scheduler).await;
    }
    e.clock.advance_ms(30 * 60 * 1000 + 1);
    scheduler.tick().unwrap();

    let mut tap = e.tap();
    e.runner.push_response(PluginResponse::ok());
    dispatch_all(&e).await;

    let breaker = e.ctx.store.breaker("flaky", Command::Poll);
    assert_eq!(breaker.state, BreakerState::Closed);
    assert_eq!(breaker.consecutive_failures, 0);
    assert!(tap.drain().iter().any(|ev| matches!(
        ev,
        Event::CircuitClosed { manual: false, .. }
    )));
}

#[tokio::test]
async fn failed_probe_reopens_with_fresh_cooldown() {
    let e = engine(FLAKY, "");
    let scheduler = Scheduler::new(e.ctx.clone());

    for _ in 0..3 {
        e.runner.push_response(PluginResponse::error("down", true));
        tick_and_drain(&e, &scheduler).await;
    }
    e.clock.advance_ms(30 * 60 * 1000 + 1);
    let probe_time = e.clock.epoch_ms();
    scheduler.tick().unwrap();

    e.runner.push_response(PluginResponse::error("still down", true));
    dispatch_all(&e).await;

    let breaker = e.ctx.store.breaker("flaky", Command::Poll);
    assert_eq!(breaker.state, BreakerState::Open);
    assert!(breaker.cooldown_until_ms.unwrap() >= probe_time + 30 * 60 * 1000);
}

#[tokio::test]
async fn manual_reset_closes_and_is_observable() {
    let e = engine(FLAKY, "");
    let scheduler = Scheduler::new(e.ctx.clone());

    for _ in 0..3 {
        e.runner.push_response(PluginResponse::error("down", true));
        tick_and_drain(&e, &scheduler).await;
    }
    assert_eq!(e.ctx.store.breaker("flaky", Command::Poll).state, BreakerState::Open);

    // Operator surface resets the row and announces it.
    e.ctx.store.reset_breaker("flaky", Command::Poll).unwrap();
    e.ctx.bus.publish(Event::CircuitClosed {
        plugin: "flaky".into(),
        command: Command::Poll,
        manual: true,
    });

    assert_eq!(e.ctx.store.breaker("flaky", Command::Poll).state, BreakerState::Closed);
    // Polls flow again on the next tick.
    e.runner.push_response(PluginResponse::ok());
    tick_and_drain(&e, &scheduler).await;
    assert_eq!(e.ctx.store.jobs_with_status(JobStatus::Succeeded).len(), 1);
}
