// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn fake_clock_starts_at_given_time() {
    let clock = FakeClock::new(1_000);
    assert_eq!(clock.epoch_ms(), 1_000);
}

#[test]
fn fake_clock_advances() {
    let clock = FakeClock::new(1_000);
    clock.advance_ms(500);
    assert_eq!(clock.epoch_ms(), 1_500);
}

#[test]
fn fake_clock_clones_share_time() {
    let clock = FakeClock::new(0);
    let other = clock.clone();
    clock.advance_ms(42);
    assert_eq!(other.epoch_ms(), 42);
}

#[test]
fn system_clock_is_nonzero() {
    assert!(SystemClock.epoch_ms() > 0);
}

#[test]
fn iso8601_renders_utc() {
    assert_eq!(iso8601(0), "1970-01-01T00:00:00.000Z");
    assert_eq!(iso8601(1_700_000_000_000), "2023-11-14T22:13:20.000Z");
}
