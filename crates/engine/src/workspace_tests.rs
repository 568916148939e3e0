// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn manager() -> (WorkspaceManager, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    (WorkspaceManager::new(dir.path().join("workspaces")), dir)
}

#[test]
fn ensure_creates_job_directory() {
    let (ws, _dir) = manager();
    let path = ws.ensure(&JobId::new("job-a")).unwrap();
    assert!(path.is_dir());
    assert!(path.ends_with("job-a"));
    // Idempotent.
    ws.ensure(&JobId::new("job-a")).unwrap();
}

#[test]
fn clone_mirrors_nested_tree() {
    let (ws, _dir) = manager();
    let producer = JobId::new("job-a");
    let src = ws.ensure(&producer).unwrap();
    fs::write(src.join("audio.wav"), b"wav-bytes").unwrap();
    fs::create_dir_all(src.join("frames/raw")).unwrap();
    fs::write(src.join("frames/raw/0.png"), b"png").unwrap();

    let successor = JobId::new("job-b");
    let dst = ws.clone_for(&producer, &successor).unwrap();

    assert_eq!(fs::read(dst.join("audio.wav")).unwrap(), b"wav-bytes");
    assert_eq!(fs::read(dst.join("frames/raw/0.png")).unwrap(), b"png");
}

#[test]
fn clone_prefers_hard_links() {
    use std::os::unix::fs::MetadataExt;

    let (ws, _dir) = manager();
    let producer = JobId::new("job-a");
    let src = ws.ensure(&producer).unwrap();
    fs::write(src.join("data.bin"), b"payload").unwrap();

    let dst = ws.clone_for(&producer, &JobId::new("job-b")).unwrap();

    let src_meta = fs::metadata(src.join("data.bin")).unwrap();
    let dst_meta = fs::metadata(dst.join("data.bin")).unwrap();
    assert_eq!(src_meta.ino(), dst_meta.ino(), "same inode = hard link");
}

#[test]
fn clones_are_isolated_from_producer_and_siblings() {
    let (ws, _dir) = manager();
    let producer = JobId::new("job-a");
    let src = ws.ensure(&producer).unwrap();
    fs::write(src.join("shared.txt"), b"original").unwrap();

    let left = ws.clone_for(&producer, &JobId::new("job-l")).unwrap();
    let right = ws.clone_for(&producer, &JobId::new("job-r")).unwrap();

    // A successor writing a NEW file is invisible everywhere else.
    fs::write(left.join("left-only.txt"), b"mine").unwrap();
    assert!(!src.join("left-only.txt").exists());
    assert!(!right.join("left-only.txt").exists());

    // Replacing a file (write-new-then-rename, the usual tool behavior)
    // breaks the link rather than mutating the shared inode.
    let tmp = left.join("shared.txt.tmp");
    fs::write(&tmp, b"rewritten").unwrap();
    fs::rename(&tmp, left.join("shared.txt")).unwrap();
    assert_eq!(fs::read(src.join("shared.txt")).unwrap(), b"original");
    assert_eq!(fs::read(right.join("shared.txt")).unwrap(), b"original");
}

#[test]
fn clone_of_missing_producer_yields_empty_workspace() {
    let (ws, _dir) = manager();
    let dst = ws
        .clone_for(&JobId::new("never-ran"), &JobId::new("job-b"))
        .unwrap();
    assert!(dst.is_dir());
    assert_eq!(fs::read_dir(&dst).unwrap().count(), 0);
}

#[test]
fn symlinks_are_recreated_not_followed() {
    let (ws, _dir) = manager();
    let producer = JobId::new("job-a");
    let src = ws.ensure(&producer).unwrap();
    fs::write(src.join("real.txt"), b"x").unwrap();
    std::os::unix::fs::symlink("real.txt", src.join("link.txt")).unwrap();

    let dst = ws.clone_for(&producer, &JobId::new("job-b")).unwrap();
    let meta = fs::symlink_metadata(dst.join("link.txt")).unwrap();
    assert!(meta.file_type().is_symlink());
}

#[test]
fn sweep_removes_only_dead_and_old_directories() {
    let (ws, _dir) = manager();
    ws.ensure(&JobId::new("live")).unwrap();
    ws.ensure(&JobId::new("dead-old")).unwrap();

    let live: HashSet<String> = ["live".to_string()].into_iter().collect();

    // Cutoff far in the future: everything not live qualifies by age.
    let removed = ws.sweep(u64::MAX, &live).unwrap();
    assert_eq!(removed, 1);
    assert!(ws.path_for(&JobId::new("live")).exists());
    assert!(!ws.path_for(&JobId::new("dead-old")).exists());
}

#[test]
fn sweep_keeps_recent_directories() {
    let (ws, _dir) = manager();
    ws.ensure(&JobId::new("recent")).unwrap();
    // Cutoff in the past: nothing is old enough.
    let removed = ws.sweep(0, &HashSet::new()).unwrap();
    assert_eq!(removed, 0);
    assert!(ws.path_for(&JobId::new("recent")).exists());
}
