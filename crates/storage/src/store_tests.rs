// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::Checkpointer;
use ductile_core::{NewJob, SubmittedBy};
use serde_json::json;

const TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct Harness {
    store: Store,
    _dir: tempfile::TempDir,
    paths: StorePaths,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = StorePaths {
        wal_path: dir.path().join("wal/events.wal"),
        snapshot_path: dir.path().join("snapshot.bin"),
    };
    let (store, _) = Store::open(&paths).expect("open store");
    Harness {
        store,
        _dir: dir,
        paths,
    }
}

fn poll_req(plugin: &str) -> NewJob {
    NewJob::new(plugin, Command::Poll, SubmittedBy::Scheduler)
}

fn created(outcome: Enqueued) -> Job {
    match outcome {
        Enqueued::Created(job) => job,
        Enqueued::Deduplicated { existing } => panic!("unexpected dedupe against {existing}"),
    }
}

// ── Enqueue / dequeue ────────────────────────────────────────────────────────

#[test]
fn enqueue_then_dequeue_claims_fifo() {
    let h = harness();
    let first = created(h.store.enqueue(poll_req("echo"), TTL, 100).unwrap());
    let _second = created(h.store.enqueue(poll_req("echo"), TTL, 200).unwrap());

    let claimed = h.store.dequeue(1_000).unwrap().unwrap();
    assert_eq!(claimed.id, first.id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.started_at_ms, Some(1_000));

    // The claimed job is gone from the eligible pool.
    let next = h.store.dequeue(1_000).unwrap().unwrap();
    assert_ne!(next.id, first.id);
    assert!(h.store.dequeue(1_000).unwrap().is_none());
}

#[test]
fn empty_plugin_is_rejected() {
    let h = harness();
    assert!(matches!(
        h.store.enqueue(poll_req("  "), TTL, 0),
        Err(QueueError::EmptyPlugin)
    ));
}

#[test]
fn dequeue_on_empty_queue_is_none() {
    let h = harness();
    assert!(h.store.dequeue(0).unwrap().is_none());
}

// ── Dedupe ───────────────────────────────────────────────────────────────────

#[test]
fn dedupe_drops_only_after_success() {
    let h = harness();
    let req = NewJob::new("notify", Command::Handle, SubmittedBy::Api)
        .with_dedupe_key("alert-2026-02-15");

    let first = created(h.store.enqueue(req.clone(), TTL, 100).unwrap());
    // While the first is still queued, a duplicate key is admitted.
    let second = created(h.store.enqueue(req.clone(), TTL, 200).unwrap());

    // Run the first to success.
    let claimed = h.store.dequeue(300).unwrap().unwrap();
    assert_eq!(claimed.id, first.id);
    h.store.mark_succeeded(&first.id, 400, String::new()).unwrap();

    // Now the key suppresses re-enqueue, observably.
    match h.store.enqueue(req.clone(), TTL, 500).unwrap() {
        Enqueued::Deduplicated { existing } => assert_eq!(existing, first.id),
        Enqueued::Created(job) => panic!("expected dedupe, created {}", job.id),
    }

    // Outside the TTL window the key is admitted again.
    let later = 400 + TTL.as_millis() as u64;
    created(h.store.enqueue(req, TTL, later).unwrap());

    // The still-queued duplicate is unaffected.
    assert!(h.store.find_job(&second.id).is_some());
}

// ── Terminal transitions ─────────────────────────────────────────────────────

#[test]
fn mark_retry_requeues_with_attempt_bump() {
    let h = harness();
    let job = created(h.store.enqueue(poll_req("echo"), TTL, 100).unwrap());
    h.store.dequeue(200).unwrap().unwrap();

    let retried = h
        .store
        .mark_retry(&job.id, JobStatus::TimedOut, "deadline exceeded".into(), 30_200)
        .unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    assert_eq!(retried.attempt, 2);
    assert_eq!(retried.next_retry_at_ms, Some(30_200));

    // Not eligible until the backoff passes.
    assert!(h.store.dequeue(29_000).unwrap().is_none());
    assert!(h.store.dequeue(30_200).unwrap().is_some());
}

#[test]
fn mark_retry_refuses_when_attempts_exhausted() {
    let h = harness();
    let job = created(
        h.store
            .enqueue(poll_req("echo").with_max_attempts(1), TTL, 100)
            .unwrap(),
    );
    h.store.dequeue(200).unwrap();
    assert!(matches!(
        h.store.mark_retry(&job.id, JobStatus::Failed, "e".into(), 900),
        Err(QueueError::AttemptsExhausted(_))
    ));
}

#[test]
fn mark_dead_moves_to_ledger_with_raw_stdout() {
    let h = harness();
    let job = created(h.store.enqueue(poll_req("echo"), TTL, 100).unwrap());
    h.store.dequeue(200).unwrap();

    let dead = h
        .store
        .mark_dead(
            &job.id,
            JobStatus::Failed,
            "protocol error: trailing data".into(),
            300,
            "stderr tail".into(),
            Some("not-json".into()),
        )
        .unwrap();
    assert_eq!(dead.status, JobStatus::Dead);

    let record = h.store.ledger_record(&job.id).unwrap();
    assert_eq!(record.raw_stdout.as_deref(), Some("not-json"));
    assert_eq!(record.stderr_tail, "stderr tail");
}

#[test]
fn transitions_from_queued_are_refused() {
    let h = harness();
    let job = created(h.store.enqueue(poll_req("echo"), TTL, 100).unwrap());
    assert!(matches!(
        h.store.mark_succeeded(&job.id, 200, String::new()),
        Err(QueueError::InvalidTransition { .. })
    ));
    assert!(matches!(
        h.store.mark_retry(&job.id, JobStatus::Failed, "e".into(), 900),
        Err(QueueError::InvalidTransition { .. })
    ));
}

#[test]
fn succeeded_is_final() {
    let h = harness();
    let job = created(h.store.enqueue(poll_req("echo"), TTL, 100).unwrap());
    h.store.dequeue(200).unwrap();
    h.store.mark_succeeded(&job.id, 300, String::new()).unwrap();

    assert!(matches!(
        h.store.mark_dead(&job.id, JobStatus::Failed, "late".into(), 400, String::new(), None),
        Err(QueueError::UnknownJob(_))
    ));
}

// ── Crash recovery ───────────────────────────────────────────────────────────

#[test]
fn state_survives_reopen_via_wal_replay() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths {
        wal_path: dir.path().join("events.wal"),
        snapshot_path: dir.path().join("snapshot.bin"),
    };

    let job_id = {
        let (store, _) = Store::open(&paths).unwrap();
        let job = created(store.enqueue(poll_req("echo"), TTL, 100).unwrap());
        store.dequeue(200).unwrap();
        store
            .merge_plugin_state("echo", json!({"last_run": "T1"}).as_object().unwrap(), 250)
            .unwrap();
        job.id
    };

    let (store, report) = Store::open(&paths).unwrap();
    assert_eq!(report.running_jobs, 1);
    assert!(report.replayed_events >= 3);
    assert_eq!(store.plugin_state("echo"), json!({"last_run": "T1"}));

    // Every running job is an orphan after restart.
    let recovered = store.recover_orphans(1_000).unwrap();
    assert_eq!(recovered.len(), 1);
    assert!(recovered[0].requeued);
    assert_eq!(recovered[0].attempt, 2);
    let job = store.find_job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.is_eligible(1_000));
}

#[test]
fn orphan_with_exhausted_budget_dies_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths {
        wal_path: dir.path().join("events.wal"),
        snapshot_path: dir.path().join("snapshot.bin"),
    };

    let job_id = {
        let (store, _) = Store::open(&paths).unwrap();
        let job = created(
            store
                .enqueue(poll_req("echo").with_max_attempts(1), TTL, 100)
                .unwrap(),
        );
        store.dequeue(200).unwrap();
        job.id
    };

    let (store, _) = Store::open(&paths).unwrap();
    let recovered = store.recover_orphans(1_000).unwrap();
    assert!(!recovered[0].requeued);
    assert_eq!(store.find_job(&job_id).unwrap().status, JobStatus::Dead);
    // Startup invariant: nothing is running.
    assert!(store.jobs_with_status(JobStatus::Running).is_empty());
}

#[test]
fn checkpoint_then_truncate_preserves_recovery() {
    let h = harness();
    let job = created(h.store.enqueue(poll_req("echo"), TTL, 100).unwrap());

    let (seq, state) = h.store.checkpoint_snapshot();
    Checkpointer::new(h.paths.snapshot_path.clone())
        .checkpoint_sync(seq, &state)
        .unwrap();
    h.store.truncate_wal_through(seq).unwrap();

    // More work lands after the checkpoint.
    let later = created(h.store.enqueue(poll_req("echo"), TTL, 200).unwrap());

    let (reopened, report) = Store::open(&h.paths).unwrap();
    assert_eq!(report.snapshot_seq, seq);
    assert!(reopened.find_job(&job.id).is_some());
    assert!(reopened.find_job(&later.id).is_some());
}

#[test]
fn events_after_a_full_checkpoint_are_never_skipped_by_replay() {
    let h = harness();
    created(h.store.enqueue(poll_req("echo"), TTL, 100).unwrap());

    // Checkpoint covers the whole WAL, then the WAL is compacted.
    let (seq, state) = h.store.checkpoint_snapshot();
    Checkpointer::new(h.paths.snapshot_path.clone())
        .checkpoint_sync(seq, &state)
        .unwrap();
    h.store.truncate_wal_through(seq).unwrap();

    // Reopen (sequence numbering must resume, not reset), then append.
    let (reopened, _) = Store::open(&h.paths).unwrap();
    let fresh = created(reopened.enqueue(poll_req("echo"), TTL, 200).unwrap());

    // A crash-restart replays the post-checkpoint event.
    let (recovered, report) = Store::open(&h.paths).unwrap();
    assert_eq!(report.snapshot_seq, seq);
    assert!(report.replayed_events >= 1);
    assert!(recovered.find_job(&fresh.id).is_some());
}

// ── Plugin state / contexts / breakers ───────────────────────────────────────

#[test]
fn plugin_state_defaults_to_empty_object() {
    let h = harness();
    assert_eq!(h.store.plugin_state("ghost"), json!({}));
}

#[test]
fn merge_with_empty_updates_is_identity() {
    let h = harness();
    h.store
        .merge_plugin_state("echo", json!({"a": 1}).as_object().unwrap(), 100)
        .unwrap();
    let before = h.store.plugin_state("echo");
    let merged = h
        .store
        .merge_plugin_state("echo", &serde_json::Map::new(), 200)
        .unwrap();
    assert_eq!(merged, before);
}

#[test]
fn oversized_state_blob_is_rejected() {
    let h = harness();
    let big = "x".repeat(ductile_core::limits::MAX_STATE_BYTES);
    let updates = json!({"blob": big});
    assert!(matches!(
        h.store.merge_plugin_state("echo", updates.as_object().unwrap(), 100),
        Err(QueueError::StateTooLarge { .. })
    ));
    // The failed merge left no trace.
    assert_eq!(h.store.plugin_state("echo"), json!({}));
}

#[test]
fn oversized_context_is_rejected() {
    use ductile_core::{EventContext, EventId};
    let h = harness();
    let big = "x".repeat(ductile_core::limits::MAX_ACCUMULATED_BYTES);
    let context = EventContext::entry(
        EventId::new("evt-1"),
        JobId::new("job-1"),
        "p",
        "s",
        "x.y",
        "src",
        json!({"blob": big}),
        100,
    );
    assert!(matches!(
        h.store.insert_context(&context),
        Err(QueueError::ContextTooLarge { .. })
    ));
}

#[test]
fn breaker_rows_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths {
        wal_path: dir.path().join("events.wal"),
        snapshot_path: dir.path().join("snapshot.bin"),
    };

    {
        let (store, _) = Store::open(&paths).unwrap();
        let mut breaker = store.breaker("echo", Command::Poll);
        breaker.record_failure(1_000, 1, 60_000);
        store.record_breaker("echo", Command::Poll, breaker).unwrap();
    }

    let (store, _) = Store::open(&paths).unwrap();
    assert!(store.breaker("echo", Command::Poll).blocks_poll(2_000));

    store.reset_breaker("echo", Command::Poll).unwrap();
    assert!(!store.breaker("echo", Command::Poll).blocks_poll(2_000));
}

// ── Reload & retention ───────────────────────────────────────────────────────

#[test]
fn removed_plugins_kill_queued_jobs_only() {
    let h = harness();
    let gone = created(h.store.enqueue(poll_req("gone"), TTL, 100).unwrap());
    let kept = created(h.store.enqueue(poll_req("kept"), TTL, 200).unwrap());

    let dead = h
        .store
        .dead_removed_plugins(&["kept".to_string()], 1_000)
        .unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, gone.id);
    assert_eq!(dead[0].last_error.as_deref(), Some("plugin_removed"));
    assert_eq!(h.store.find_job(&kept.id).unwrap().status, JobStatus::Queued);
}

#[test]
fn prune_job_log_applies_retention() {
    let h = harness();
    let old = created(h.store.enqueue(poll_req("echo"), TTL, 100).unwrap());
    h.store.dequeue(150).unwrap();
    h.store.mark_succeeded(&old.id, 1_000, String::new()).unwrap();

    let new = created(h.store.enqueue(poll_req("echo"), TTL, 200).unwrap());
    h.store.dequeue(250).unwrap();
    h.store.mark_succeeded(&new.id, 9_000, String::new()).unwrap();

    assert_eq!(h.store.prune_job_log(5_000).unwrap(), 1);
    assert!(h.store.find_job(&old.id).is_none());
    assert!(h.store.find_job(&new.id).is_some());
    // Nothing left to prune.
    assert_eq!(h.store.prune_job_log(5_000).unwrap(), 0);
}
