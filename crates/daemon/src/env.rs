// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Environment-driven path resolution for the daemon.

use std::path::PathBuf;

/// State directory: `$DUCTILE_STATE_DIR`, else the platform state dir
/// (`~/.local/state/ductile` on Linux).
pub fn state_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("DUCTILE_STATE_DIR") {
        if !dir.is_empty() {
            return Some(PathBuf::from(dir));
        }
    }
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join("ductile"))
}

/// Config file: `$DUCTILE_CONFIG`, else `<state_dir>/ductile.yaml`.
pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("DUCTILE_CONFIG") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    state_dir().map(|dir| dir.join("ductile.yaml"))
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
