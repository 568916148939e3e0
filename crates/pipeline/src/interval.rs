// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Interval grammar for schedules and retention windows.
//!
//! Accepts `30s`, `5m`, `6h`, `2d`, `1w` plus the named aliases `hourly`,
//! `daily`, `weekly`, and `monthly` (monthly = 30 days). Intervals must be
//! positive.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;
use thiserror::Error;

const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntervalError {
    #[error("empty interval")]
    Empty,
    #[error("invalid interval {0:?} (expected e.g. \"30s\", \"5m\", \"6h\", \"1d\", \"1w\", or a named alias)")]
    Invalid(String),
    #[error("interval must be positive: {0:?}")]
    NotPositive(String),
}

/// Parse a duration string from the interval grammar.
pub fn parse_interval(raw: &str) -> Result<Duration, IntervalError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(IntervalError::Empty);
    }

    let seconds_per = |unit: char| -> Option<u64> {
        match unit {
            's' => Some(1),
            'm' => Some(60),
            'h' => Some(60 * 60),
            'd' => Some(24 * 60 * 60),
            'w' => Some(7 * 24 * 60 * 60),
            _ => None,
        }
    };

    let duration = match s {
        "hourly" => Duration::from_secs(60 * 60),
        "daily" => Duration::from_secs(24 * 60 * 60),
        "weekly" => Duration::from_secs(7 * 24 * 60 * 60),
        "monthly" => Duration::from_secs(30 * 24 * 60 * 60),
        _ => {
            let (unit_idx, unit) = s
                .char_indices()
                .last()
                .ok_or_else(|| IntervalError::Empty)?;
            let digits = &s[..unit_idx];
            let scale = seconds_per(unit).ok_or_else(|| IntervalError::Invalid(raw.to_string()))?;
            let count: u64 = digits
                .parse()
                .map_err(|_| IntervalError::Invalid(raw.to_string()))?;
            Duration::from_secs(count * scale)
        }
    };

    if duration.is_zero() {
        return Err(IntervalError::NotPositive(raw.to_string()));
    }
    Ok(duration)
}

/// Serde adapter for `Duration` fields written in the interval grammar.
pub mod serde_interval {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}s", duration.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        parse_interval(&raw).map_err(serde::de::Error::custom)
    }
}

/// Same adapter for `Option<Duration>` fields.
pub mod serde_interval_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => s.serialize_some(&format!("{}s", d.as_secs())),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|r| parse_interval(&r).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Daily time window ("HH:MM-HH:MM", UTC) a schedule snaps into.
///
/// A due time already inside the window is kept; otherwise it moves forward
/// to the next window start. Windows that wrap midnight (`23:00-01:00`) are
/// supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreferredWindow {
    start_minute: u32,
    end_minute: u32,
}

impl PreferredWindow {
    pub fn parse(raw: &str) -> Result<Self, IntervalError> {
        let (start, end) = raw
            .split_once('-')
            .ok_or_else(|| IntervalError::Invalid(raw.to_string()))?;
        Ok(Self {
            start_minute: parse_hhmm(start).ok_or_else(|| IntervalError::Invalid(raw.to_string()))?,
            end_minute: parse_hhmm(end).ok_or_else(|| IntervalError::Invalid(raw.to_string()))?,
        })
    }

    fn contains(&self, minute_of_day: u32) -> bool {
        if self.start_minute <= self.end_minute {
            (self.start_minute..self.end_minute).contains(&minute_of_day)
        } else {
            // Wrapping window, e.g. 23:00-01:00
            minute_of_day >= self.start_minute || minute_of_day < self.end_minute
        }
    }

    /// Snap a due time (epoch ms) forward to the window.
    pub fn snap_forward(&self, due_ms: u64) -> u64 {
        const MS_PER_MINUTE: u64 = 60 * 1000;
        const MS_PER_DAY: u64 = (MINUTES_PER_DAY as u64) * MS_PER_MINUTE;

        let minute_of_day = ((due_ms % MS_PER_DAY) / MS_PER_MINUTE) as u32;
        if self.contains(minute_of_day) {
            return due_ms;
        }

        let day_start = due_ms - (due_ms % MS_PER_DAY);
        let start_today = day_start + u64::from(self.start_minute) * MS_PER_MINUTE;
        if start_today > due_ms {
            start_today
        } else {
            start_today + MS_PER_DAY
        }
    }
}

impl<'de> Deserialize<'de> for PreferredWindow {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        PreferredWindow::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl serde::Serialize for PreferredWindow {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!(
            "{:02}:{:02}-{:02}:{:02}",
            self.start_minute / 60,
            self.start_minute % 60,
            self.end_minute / 60,
            self.end_minute % 60
        ))
    }
}

fn parse_hhmm(raw: &str) -> Option<u32> {
    let (hh, mm) = raw.trim().split_once(':')?;
    let hours: u32 = hh.parse().ok()?;
    let minutes: u32 = mm.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

#[cfg(test)]
#[path = "interval_tests.rs"]
mod tests;
