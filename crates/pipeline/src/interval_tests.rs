// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

// ── Grammar ──────────────────────────────────────────────────────────────────

#[yare::parameterized(
    seconds = { "30s", 30 },
    minutes = { "5m", 5 * 60 },
    hours = { "6h", 6 * 60 * 60 },
    days = { "2d", 2 * 24 * 60 * 60 },
    weeks = { "1w", 7 * 24 * 60 * 60 },
    hourly = { "hourly", 60 * 60 },
    daily = { "daily", 24 * 60 * 60 },
    weekly = { "weekly", 7 * 24 * 60 * 60 },
    monthly = { "monthly", 30 * 24 * 60 * 60 },
)]
fn parses(raw: &str, expected_secs: u64) {
    assert_eq!(parse_interval(raw), Ok(Duration::from_secs(expected_secs)));
}

#[test]
fn whitespace_is_trimmed() {
    assert_eq!(parse_interval(" 5m "), Ok(Duration::from_secs(300)));
}

#[yare::parameterized(
    empty = { "" },
    bare_number = { "30" },
    unknown_unit = { "5y" },
    unknown_alias = { "fortnightly" },
    negative = { "-5m" },
    fraction = { "1.5h" },
)]
fn rejects_invalid(raw: &str) {
    assert!(parse_interval(raw).is_err());
}

#[test]
fn zero_is_not_positive() {
    assert_eq!(
        parse_interval("0m"),
        Err(IntervalError::NotPositive("0m".to_string()))
    );
}

// ── Preferred window ─────────────────────────────────────────────────────────

const MS_PER_MIN: u64 = 60 * 1000;
const MS_PER_HOUR: u64 = 60 * MS_PER_MIN;
const MS_PER_DAY: u64 = 24 * MS_PER_HOUR;

#[test]
fn window_parses_hhmm() {
    assert!(PreferredWindow::parse("09:00-17:30").is_ok());
    assert!(PreferredWindow::parse("9-17").is_err());
    assert!(PreferredWindow::parse("25:00-26:00").is_err());
    assert!(PreferredWindow::parse("09:61-10:00").is_err());
}

#[test]
fn due_inside_window_is_kept() {
    let window = PreferredWindow::parse("09:00-17:00").unwrap();
    let due = 10 * MS_PER_HOUR; // 10:00 on day zero
    assert_eq!(window.snap_forward(due), due);
}

#[test]
fn due_before_window_snaps_to_start_today() {
    let window = PreferredWindow::parse("09:00-17:00").unwrap();
    let due = 7 * MS_PER_HOUR;
    assert_eq!(window.snap_forward(due), 9 * MS_PER_HOUR);
}

#[test]
fn due_after_window_snaps_to_start_tomorrow() {
    let window = PreferredWindow::parse("09:00-17:00").unwrap();
    let due = 18 * MS_PER_HOUR;
    assert_eq!(window.snap_forward(due), MS_PER_DAY + 9 * MS_PER_HOUR);
}

#[test]
fn wrapping_window_spans_midnight() {
    let window = PreferredWindow::parse("23:00-01:00").unwrap();
    // 23:30 is inside, 00:30 is inside, 12:00 snaps to 23:00.
    assert_eq!(window.snap_forward(23 * MS_PER_HOUR + 30 * MS_PER_MIN), 23 * MS_PER_HOUR + 30 * MS_PER_MIN);
    assert_eq!(window.snap_forward(30 * MS_PER_MIN), 30 * MS_PER_MIN);
    assert_eq!(window.snap_forward(12 * MS_PER_HOUR), 23 * MS_PER_HOUR);
}

#[test]
fn window_serde_round_trip() {
    let window = PreferredWindow::parse("09:00-17:30").unwrap();
    let json = serde_json::to_string(&window).unwrap();
    assert_eq!(json, "\"09:00-17:30\"");
    let back: PreferredWindow = serde_json::from_str(&json).unwrap();
    assert_eq!(back, window);
}
