// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serial_test::serial;

#[test]
#[serial]
fn explicit_state_dir_wins() {
    std::env::set_var("DUCTILE_STATE_DIR", "/tmp/ductile-test-state");
    assert_eq!(state_dir(), Some(PathBuf::from("/tmp/ductile-test-state")));
    std::env::remove_var("DUCTILE_STATE_DIR");
}

#[test]
#[serial]
fn empty_override_falls_back_to_platform_dir() {
    std::env::set_var("DUCTILE_STATE_DIR", "");
    let dir = state_dir();
    std::env::remove_var("DUCTILE_STATE_DIR");
    if let Some(dir) = dir {
        assert!(dir.ends_with("ductile"));
    }
}

#[test]
#[serial]
fn config_defaults_under_state_dir() {
    std::env::set_var("DUCTILE_STATE_DIR", "/tmp/ductile-test-state");
    std::env::remove_var("DUCTILE_CONFIG");
    assert_eq!(
        config_path(),
        Some(PathBuf::from("/tmp/ductile-test-state/ductile.yaml"))
    );
    std::env::remove_var("DUCTILE_STATE_DIR");
}

#[test]
#[serial]
fn explicit_config_path_wins() {
    std::env::set_var("DUCTILE_CONFIG", "/etc/ductile/config.yaml");
    assert_eq!(config_path(), Some(PathBuf::from("/etc/ductile/config.yaml")));
    std::env::remove_var("DUCTILE_CONFIG");
}
