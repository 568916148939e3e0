// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-(plugin, command) circuit breaker for scheduled polls.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Failure gate that temporarily stops scheduled polls for a plugin.
///
/// Created lazily on first use and persisted so restarts do not forget open
/// circuits. Only scheduler-originated poll jobs consult the breaker;
/// `handle` jobs from routing or external triggers are never blocked.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub state: BreakerState,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until_ms: Option<u64>,
}

impl CircuitBreaker {
    /// Whether a scheduled poll is currently blocked.
    pub fn blocks_poll(&self, now_ms: u64) -> bool {
        self.state == BreakerState::Open
            && self.cooldown_until_ms.map_or(false, |until| now_ms < until)
    }

    /// Whether the cooldown has elapsed and a half-open probe is allowed.
    pub fn cooldown_elapsed(&self, now_ms: u64) -> bool {
        self.state == BreakerState::Open
            && self.cooldown_until_ms.map_or(true, |until| now_ms >= until)
    }

    /// Move an open breaker to half-open, allowing exactly one probe poll.
    pub fn begin_probe(&mut self) {
        if self.state == BreakerState::Open {
            self.state = BreakerState::HalfOpen;
        }
    }

    /// Record a successful terminal poll. Returns true if the circuit closed
    /// as a result (it was open or half-open before).
    pub fn record_success(&mut self) -> bool {
        let was_tripped = self.state != BreakerState::Closed;
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at_ms = None;
        self.cooldown_until_ms = None;
        was_tripped
    }

    /// Record a retry-or-dead terminal poll. Returns true if the circuit
    /// opened as a result.
    ///
    /// A half-open probe failure reopens immediately with a fresh cooldown;
    /// a closed breaker opens once `consecutive_failures` reaches the
    /// threshold.
    pub fn record_failure(&mut self, now_ms: u64, threshold: u32, reset_after_ms: u64) -> bool {
        self.consecutive_failures += 1;
        match self.state {
            BreakerState::HalfOpen => {
                self.open(now_ms, reset_after_ms);
                true
            }
            BreakerState::Closed if self.consecutive_failures >= threshold => {
                self.open(now_ms, reset_after_ms);
                true
            }
            BreakerState::Open => {
                // Already open (e.g. a non-scheduler poll failed); extending
                // the cooldown would starve recovery, so leave it alone.
                false
            }
            BreakerState::Closed => false,
        }
    }

    /// Operator-initiated reset.
    pub fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at_ms = None;
        self.cooldown_until_ms = None;
    }

    fn open(&mut self, now_ms: u64, reset_after_ms: u64) {
        self.state = BreakerState::Open;
        self.opened_at_ms = Some(now_ms);
        self.cooldown_until_ms = Some(now_ms + reset_after_ms);
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
