// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

const THRESHOLD: u32 = 3;
const RESET_MS: u64 = 30 * 60 * 1000;

#[test]
fn fresh_breaker_is_closed_and_permissive() {
    let breaker = CircuitBreaker::default();
    assert_eq!(breaker.state, BreakerState::Closed);
    assert!(!breaker.blocks_poll(0));
}

#[test]
fn opens_at_threshold() {
    let mut breaker = CircuitBreaker::default();
    assert!(!breaker.record_failure(1_000, THRESHOLD, RESET_MS));
    assert!(!breaker.record_failure(2_000, THRESHOLD, RESET_MS));
    assert!(breaker.record_failure(3_000, THRESHOLD, RESET_MS));

    assert_eq!(breaker.state, BreakerState::Open);
    assert_eq!(breaker.opened_at_ms, Some(3_000));
    assert_eq!(breaker.cooldown_until_ms, Some(3_000 + RESET_MS));
    assert!(breaker.blocks_poll(3_001));
}

#[test]
fn cooldown_expiry_unblocks() {
    let mut breaker = CircuitBreaker::default();
    for t in 0..THRESHOLD as u64 {
        breaker.record_failure(t, THRESHOLD, RESET_MS);
    }
    let until = breaker.cooldown_until_ms.unwrap();
    assert!(breaker.blocks_poll(until - 1));
    assert!(!breaker.blocks_poll(until));
    assert!(breaker.cooldown_elapsed(until));
}

#[test]
fn probe_transitions_to_half_open() {
    let mut breaker = CircuitBreaker::default();
    for t in 0..THRESHOLD as u64 {
        breaker.record_failure(t, THRESHOLD, RESET_MS);
    }
    breaker.begin_probe();
    assert_eq!(breaker.state, BreakerState::HalfOpen);
    assert!(!breaker.blocks_poll(u64::MAX));
}

#[test]
fn successful_probe_closes() {
    let mut breaker = CircuitBreaker {
        state: BreakerState::HalfOpen,
        consecutive_failures: 3,
        opened_at_ms: Some(1),
        cooldown_until_ms: Some(2),
    };
    assert!(breaker.record_success());
    assert_eq!(breaker.state, BreakerState::Closed);
    assert_eq!(breaker.consecutive_failures, 0);
    assert!(breaker.opened_at_ms.is_none());
    assert!(breaker.cooldown_until_ms.is_none());
}

#[test]
fn failed_probe_reopens_with_fresh_cooldown() {
    let mut breaker = CircuitBreaker {
        state: BreakerState::HalfOpen,
        consecutive_failures: 3,
        opened_at_ms: Some(1),
        cooldown_until_ms: Some(2),
    };
    assert!(breaker.record_failure(10_000, THRESHOLD, RESET_MS));
    assert_eq!(breaker.state, BreakerState::Open);
    assert_eq!(breaker.cooldown_until_ms, Some(10_000 + RESET_MS));
}

#[test]
fn success_on_closed_is_quiet() {
    let mut breaker = CircuitBreaker::default();
    assert!(!breaker.record_success());
}

#[test]
fn failure_while_open_does_not_extend_cooldown() {
    let mut breaker = CircuitBreaker::default();
    for t in 0..THRESHOLD as u64 {
        breaker.record_failure(t, THRESHOLD, RESET_MS);
    }
    let until = breaker.cooldown_until_ms;
    assert!(!breaker.record_failure(5_000, THRESHOLD, RESET_MS));
    assert_eq!(breaker.cooldown_until_ms, until);
}

#[test]
fn manual_reset_clears_everything() {
    let mut breaker = CircuitBreaker::default();
    for t in 0..THRESHOLD as u64 {
        breaker.record_failure(t, THRESHOLD, RESET_MS);
    }
    breaker.reset();
    assert_eq!(breaker, CircuitBreaker::default());
}

#[test]
fn breaker_serde_round_trip() {
    let mut breaker = CircuitBreaker::default();
    breaker.record_failure(7, 1, 100);
    let json = serde_json::to_string(&breaker).unwrap();
    let back: CircuitBreaker = serde_json::from_str(&json).unwrap();
    assert_eq!(back, breaker);
}
