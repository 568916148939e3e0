// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resource caps and policy defaults

use std::time::Duration;

/// Maximum bytes of plugin stdout captured in memory.
pub const MAX_STDOUT_BYTES: usize = 10 * 1024 * 1024;

/// Maximum bytes of plugin stderr captured in memory.
pub const MAX_STDERR_BYTES: usize = 1024 * 1024;

/// Stderr tail persisted in the job ledger.
pub const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// Maximum serialized size of a plugin's state blob.
pub const MAX_STATE_BYTES: usize = 1024 * 1024;

/// Maximum serialized size of an event context's accumulated value.
pub const MAX_ACCUMULATED_BYTES: usize = 1024 * 1024;

/// Default replay ring capacity of the observability bus.
pub const DEFAULT_RING_CAPACITY: usize = 100;

/// Default pipeline hop-depth guard.
pub const DEFAULT_MAX_HOPS: u32 = 20;

/// Default cap on outstanding (non-terminal) poll jobs per plugin.
pub const DEFAULT_MAX_OUTSTANDING_POLLS: u32 = 1;

/// Default attempt budget per job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Default retry backoff base.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(30);

/// Default dedupe suppression window.
pub const DEFAULT_DEDUPE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default retention of terminal jobs in the ledger.
pub const DEFAULT_JOB_LOG_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default scheduler tick interval.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Default circuit-breaker failure threshold.
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 3;

/// Default circuit-breaker cooldown.
pub const DEFAULT_BREAKER_RESET_AFTER: Duration = Duration::from_secs(30 * 60);

/// Grace period between SIGTERM and SIGKILL on timeout or shutdown.
pub const TERM_GRACE: Duration = Duration::from_secs(5);
