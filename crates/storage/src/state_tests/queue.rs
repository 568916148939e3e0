// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

// ── Admission & start ────────────────────────────────────────────────────────

#[test]
fn enqueued_inserts_queued_job() {
    let mut state = MaterializedState::default();
    state.apply_event(&enqueued_event("job-1", 1, 100));

    let job = &state.job_queue["job-1"];
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(state.next_seq, 2);
}

#[test]
fn enqueued_twice_is_idempotent() {
    let mut state = MaterializedState::default();
    state.apply_event(&enqueued_event("job-1", 1, 100));
    state.apply_event(&started_event("job-1", 1, 200));
    // Replay of the same admission must not reset the running job.
    state.apply_event(&enqueued_event("job-1", 1, 100));

    assert_eq!(state.job_queue["job-1"].status, JobStatus::Running);
}

#[test]
fn started_sets_running_and_timestamp() {
    let mut state = MaterializedState::default();
    state.apply_event(&enqueued_event("job-1", 1, 100));
    state.apply_event(&started_event("job-1", 1, 250));

    let job = &state.job_queue["job-1"];
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.started_at_ms, Some(250));
    assert!(job.next_retry_at_ms.is_none());
}

#[test]
fn started_on_running_job_is_idempotent() {
    let mut state = MaterializedState::default();
    state.apply_event(&enqueued_event("job-1", 1, 100));
    state.apply_event(&started_event("job-1", 1, 250));
    state.apply_event(&started_event("job-1", 1, 999));

    assert_eq!(state.job_queue["job-1"].started_at_ms, Some(250));
}

// ── Terminal transitions ─────────────────────────────────────────────────────

#[test]
fn succeeded_moves_job_to_ledger() {
    let mut state = MaterializedState::default();
    state.apply_event(&enqueued_event("job-1", 1, 100));
    state.apply_event(&started_event("job-1", 1, 200));
    state.apply_event(&Event::JobSucceeded {
        id: JobId::new("job-1"),
        completed_at_ms: 500,
        stderr_tail: "warn: slow".into(),
    });

    assert!(!state.job_queue.contains_key("job-1"));
    let record = &state.job_log["job-1"];
    assert_eq!(record.job.status, JobStatus::Succeeded);
    assert_eq!(record.job.completed_at_ms, Some(500));
    assert_eq!(record.stderr_tail, "warn: slow");
    assert_eq!(record.duration_ms, 300);
}

#[test]
fn dead_moves_job_to_ledger_with_error() {
    let mut state = MaterializedState::default();
    state.apply_event(&enqueued_event("job-1", 1, 100));
    state.apply_event(&started_event("job-1", 1, 200));
    state.apply_event(&Event::JobDead {
        id: JobId::new("job-1"),
        status: JobStatus::Failed,
        error: "boom".into(),
        completed_at_ms: 400,
        stderr_tail: String::new(),
        raw_stdout: Some("not json".into()),
    });

    let record = &state.job_log["job-1"];
    assert_eq!(record.job.status, JobStatus::Dead);
    assert_eq!(record.job.last_error.as_deref(), Some("boom"));
    assert_eq!(record.raw_stdout.as_deref(), Some("not json"));
}

#[test]
fn retry_scheduled_requeues_with_backoff() {
    let mut state = MaterializedState::default();
    state.apply_event(&enqueued_event("job-1", 1, 100));
    state.apply_event(&started_event("job-1", 1, 200));
    state.apply_event(&Event::JobRetryScheduled {
        id: JobId::new("job-1"),
        status: JobStatus::TimedOut,
        error: "deadline exceeded".into(),
        next_retry_at_ms: 30_200,
        attempt: 2,
    });

    let job = &state.job_queue["job-1"];
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt, 2);
    assert_eq!(job.next_retry_at_ms, Some(30_200));
    assert_eq!(job.last_error.as_deref(), Some("deadline exceeded"));
}

#[test]
fn terminal_rows_never_transition() {
    let mut state = MaterializedState::default();
    state.apply_event(&enqueued_event("job-1", 1, 100));
    state.apply_event(&started_event("job-1", 1, 200));
    state.apply_event(&Event::JobSucceeded {
        id: JobId::new("job-1"),
        completed_at_ms: 500,
        stderr_tail: String::new(),
    });

    // A replayed retry for an already-terminal job is a no-op.
    state.apply_event(&Event::JobRetryScheduled {
        id: JobId::new("job-1"),
        status: JobStatus::Failed,
        error: "late".into(),
        next_retry_at_ms: 900,
        attempt: 2,
    });

    assert!(!state.job_queue.contains_key("job-1"));
    assert_eq!(state.job_log["job-1"].job.status, JobStatus::Succeeded);
}

// ── Orphan recovery ──────────────────────────────────────────────────────────

#[test]
fn recovered_requeues_running_job_immediately() {
    let mut state = MaterializedState::default();
    state.apply_event(&enqueued_event("job-1", 1, 100));
    state.apply_event(&started_event("job-1", 1, 200));
    state.apply_event(&Event::JobRecovered {
        id: JobId::new("job-1"),
        requeued: true,
        attempt: 2,
    });

    let job = &state.job_queue["job-1"];
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt, 2);
    assert!(job.next_retry_at_ms.is_none());
    assert!(job.is_eligible(200));
}

// ── FIFO selection ───────────────────────────────────────────────────────────

#[test]
fn eligible_job_is_fifo_by_created_then_seq() {
    let mut state = MaterializedState::default();
    state.apply_event(&enqueued_event("late", 3, 300));
    state.apply_event(&enqueued_event("early-b", 2, 100));
    state.apply_event(&enqueued_event("early-a", 1, 100));

    // Same created_at: lower admission sequence wins.
    assert_eq!(state.eligible_job(1_000).unwrap().id, "early-a");
}

#[test]
fn eligible_job_skips_backoff_and_running() {
    let mut state = MaterializedState::default();
    state.apply_event(&enqueued_event("running", 1, 100));
    state.apply_event(&started_event("running", 1, 150));
    state.apply_event(&enqueued_event("deferred", 2, 110));
    if let Some(job) = state.job_queue.get_mut("deferred") {
        job.next_retry_at_ms = Some(5_000);
    }
    state.apply_event(&enqueued_event("ready", 3, 120));

    assert_eq!(state.eligible_job(1_000).unwrap().id, "ready");
    // Once the backoff passes, FIFO order reasserts itself.
    assert_eq!(state.eligible_job(5_000).unwrap().id, "deferred");
}

// ── Ledger pruning & queries ─────────────────────────────────────────────────

#[test]
fn ledger_pruned_drops_old_rows_only() {
    let mut state = MaterializedState::default();
    for (id, seq, done_at) in [("old", 1, 1_000), ("new", 2, 9_000)] {
        state.apply_event(&enqueued_event(id, seq, 100));
        state.apply_event(&started_event(id, 1, 200));
        state.apply_event(&Event::JobSucceeded {
            id: JobId::new(id),
            completed_at_ms: done_at,
            stderr_tail: String::new(),
        });
    }

    state.apply_event(&Event::LedgerPruned { before_ms: 5_000 });
    assert!(!state.job_log.contains_key("old"));
    assert!(state.job_log.contains_key("new"));
}

#[test]
fn dedupe_hit_respects_ttl_window() {
    let mut state = MaterializedState::default();
    let mut job = Job::admit(
        NewJob::new("notify", Command::Handle, SubmittedBy::Api)
            .with_dedupe_key("alert-2026-02-15"),
        JobId::new("job-1"),
        1,
        100,
    );
    job.status = JobStatus::Running;
    state.job_queue.insert("job-1".into(), job);
    state.apply_event(&Event::JobSucceeded {
        id: JobId::new("job-1"),
        completed_at_ms: 1_000,
        stderr_tail: String::new(),
    });

    let ttl = 24 * 60 * 60 * 1000;
    assert!(state.dedupe_hit("notify", "alert-2026-02-15", 2_000, ttl).is_some());
    assert!(state.dedupe_hit("notify", "other-key", 2_000, ttl).is_none());
    assert!(state.dedupe_hit("other-plugin", "alert-2026-02-15", 2_000, ttl).is_none());
    // Expired window.
    assert!(state
        .dedupe_hit("notify", "alert-2026-02-15", 1_000 + ttl, ttl)
        .is_none());
}

#[test]
fn outstanding_counts_non_terminal_only() {
    let mut state = MaterializedState::default();
    state.apply_event(&enqueued_event("a", 1, 100));
    state.apply_event(&enqueued_event("b", 2, 110));
    state.apply_event(&started_event("a", 1, 150));
    assert_eq!(state.outstanding("echo", Command::Poll), 2);

    state.apply_event(&Event::JobSucceeded {
        id: JobId::new("a"),
        completed_at_ms: 500,
        stderr_tail: String::new(),
    });
    assert_eq!(state.outstanding("echo", Command::Poll), 1);
}

#[test]
fn last_success_tracks_newest_completion() {
    let mut state = MaterializedState::default();
    for (id, seq, done_at) in [("a", 1, 1_000), ("b", 2, 3_000)] {
        state.apply_event(&enqueued_event(id, seq, 100));
        state.apply_event(&started_event(id, 1, 200));
        state.apply_event(&Event::JobSucceeded {
            id: JobId::new(id),
            completed_at_ms: done_at,
            stderr_tail: String::new(),
        });
    }
    assert_eq!(state.last_success_ms("echo", Command::Poll), Some(3_000));
    assert_eq!(state.last_success_ms("echo", Command::Handle), None);
}
