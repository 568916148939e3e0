// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use ductile_core::{JobId, SkipReason};

fn spawn_event(n: u64) -> Event {
    Event::PluginSpawned {
        job: JobId::new(format!("job-{n}")),
        plugin: "echo".into(),
        command: ductile_core::Command::Poll,
    }
}

#[tokio::test]
async fn live_subscriber_receives_published_events() {
    let bus = EventBus::new(10);
    let mut sub = bus.subscribe();
    bus.publish(spawn_event(1));

    let event = sub.recv().await.unwrap();
    assert_eq!(event.job_id().unwrap(), "job-1");
}

#[tokio::test]
async fn late_subscriber_replays_ring() {
    let bus = EventBus::new(10);
    bus.publish(spawn_event(1));
    bus.publish(spawn_event(2));

    let mut sub = bus.subscribe();
    assert_eq!(sub.recv().await.unwrap().job_id().unwrap(), "job-1");
    assert_eq!(sub.recv().await.unwrap().job_id().unwrap(), "job-2");
}

#[tokio::test]
async fn ring_drops_oldest_beyond_capacity() {
    let bus = EventBus::new(3);
    for n in 1..=5 {
        bus.publish(spawn_event(n));
    }

    let recent = bus.recent();
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].job_id().unwrap(), "job-3");
    assert_eq!(recent[2].job_id().unwrap(), "job-5");
}

#[test]
fn publish_without_subscribers_does_not_block_or_fail() {
    let bus = EventBus::new(2);
    for n in 0..100 {
        bus.publish(spawn_event(n));
    }
    assert_eq!(bus.recent().len(), 2);
}

#[tokio::test]
async fn lagged_subscriber_sees_inband_drop_count() {
    let bus = EventBus::new(4);
    let mut sub = bus.subscribe();

    // Overflow the subscriber's channel (capacity 4) while it is not
    // draining; broadcast drops its oldest pending events.
    for n in 0..20 {
        bus.publish(spawn_event(n));
    }

    let first = sub.recv().await.unwrap();
    assert!(
        matches!(first, Event::BusLagged { missed } if missed > 0),
        "expected bus:lagged, got {}",
        first.log_summary()
    );
}

#[tokio::test]
async fn try_recv_drains_then_returns_none() {
    let bus = EventBus::new(10);
    bus.publish(spawn_event(1));
    let mut sub = bus.subscribe();

    assert!(sub.try_recv().is_some());
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn scheduler_skip_events_flow_through() {
    let bus = EventBus::new(10);
    let mut sub = bus.subscribe();
    bus.publish(Event::SchedulerSkipped {
        plugin: "echo".into(),
        command: ductile_core::Command::Poll,
        reason: SkipReason::CircuitOpen,
    });

    match sub.recv().await.unwrap() {
        Event::SchedulerSkipped { reason, .. } => assert_eq!(reason, SkipReason::CircuitOpen),
        other => panic!("unexpected event: {}", other.log_summary()),
    }
}
