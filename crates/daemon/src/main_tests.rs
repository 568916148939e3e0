// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn small_log_is_not_rotated() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("ductile.log");
    std::fs::write(&log, "short").unwrap();

    rotate_log_if_needed(&log);
    assert!(log.exists());
    assert!(!dir.path().join("ductile.log.1").exists());
}

#[test]
fn oversized_log_rotates_into_numbered_files() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("ductile.log");
    std::fs::write(&log, vec![b'x'; (MAX_LOG_SIZE + 1) as usize]).unwrap();

    rotate_log_if_needed(&log);
    assert!(!log.exists());
    assert!(dir.path().join("ductile.log.1").exists());
}

#[test]
fn rotation_shifts_and_caps_generations() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("ductile.log");

    for generation in 0..5u8 {
        std::fs::write(&log, vec![generation; (MAX_LOG_SIZE + 1) as usize]).unwrap();
        rotate_log_if_needed(&log);
    }

    assert!(dir.path().join("ductile.log.1").exists());
    assert!(dir.path().join("ductile.log.2").exists());
    assert!(dir.path().join("ductile.log.3").exists());
    assert!(!dir.path().join("ductile.log.4").exists());
    // Newest rotation is the last generation written.
    assert_eq!(
        std::fs::read(dir.path().join("ductile.log.1")).unwrap()[0],
        4
    );
}

#[test]
fn missing_log_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    rotate_log_if_needed(&dir.path().join("absent.log"));
}
