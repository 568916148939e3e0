// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn snapshot_carries_current_version() {
    let snapshot = Snapshot::new(7, MaterializedState::default());
    assert_eq!(snapshot.version, CURRENT_SNAPSHOT_VERSION);
    assert_eq!(snapshot.seq, 7);
}

#[test]
fn version_field_serializes_as_v() {
    let snapshot = Snapshot::new(1, MaterializedState::default());
    let value = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(value["v"], 1);
    assert!(value.get("version").is_none());
}

#[test]
fn missing_version_defaults_to_one() {
    let raw = r#"{"seq": 3, "state": {}, "created_at": "2026-01-01T00:00:00Z"}"#;
    let snapshot: Snapshot = serde_json::from_str(raw).unwrap();
    assert_eq!(snapshot.version, 1);
}

#[test]
fn bak_rotation_shifts_existing_backups() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.bin");

    // First rotation: nothing to shift.
    let first = rotate_bak_path(&path);
    assert_eq!(first, path.with_extension("bak"));
    std::fs::write(&first, "one").unwrap();

    // Second rotation: .bak shifts to .bak.2.
    let second = rotate_bak_path(&path);
    assert_eq!(second, path.with_extension("bak"));
    assert_eq!(
        std::fs::read_to_string(path.with_extension("bak.2")).unwrap(),
        "one"
    );
}

#[test]
fn bak_rotation_caps_backup_count() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.bin");

    for n in 0..5 {
        let bak = rotate_bak_path(&path);
        std::fs::write(&bak, format!("gen-{n}")).unwrap();
    }

    assert!(path.with_extension("bak").exists());
    assert!(path.with_extension("bak.2").exists());
    assert!(path.with_extension("bak.3").exists());
    assert!(!path.with_extension("bak.4").exists());
}
