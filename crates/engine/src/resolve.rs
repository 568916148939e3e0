// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Plugin discovery and trust checks.
//!
//! A configured plugin resolves to `<root>/<name>/` in the first plugin
//! root that has it. The directory must carry a valid manifest, must not be
//! world-writable, and its entrypoint must be an executable that stays
//! inside the plugin directory after symlink resolution. Anything else
//! refuses the plugin at load time; it is never dispatched.

use ductile_core::Command;
use ductile_pipeline::{ManifestError, PluginConfig, PluginManifest};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("plugin directory not found under any root")]
    NotFound,
    #[error("plugin name {0:?} is not a plain directory name")]
    BadName(String),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("plugin directory {0} is world-writable")]
    WorldWritable(PathBuf),
    #[error("entrypoint {0} is not an executable file")]
    NotExecutable(PathBuf),
    #[error("entrypoint {0} escapes the plugin directory")]
    EscapesRoot(PathBuf),
}

/// A plugin that passed discovery and trust checks.
#[derive(Debug, Clone)]
pub struct ResolvedPlugin {
    pub name: String,
    pub dir: PathBuf,
    pub binary: PathBuf,
    pub manifest: PluginManifest,
}

impl ResolvedPlugin {
    pub fn supports(&self, command: Command) -> bool {
        self.manifest.supports(command)
    }
}

/// All currently loadable plugins.
#[derive(Debug, Default, Clone)]
pub struct PluginCatalog {
    plugins: HashMap<String, ResolvedPlugin>,
}

impl PluginCatalog {
    /// Resolve every enabled configured plugin. Refusals are returned for
    /// reporting; refused plugins are simply absent from the catalog.
    pub fn load(
        roots: &[PathBuf],
        configured: &IndexMap<String, PluginConfig>,
    ) -> (Self, Vec<(String, ResolveError)>) {
        let mut plugins = HashMap::new();
        let mut refused = Vec::new();

        for (name, config) in configured {
            if !config.enabled {
                continue;
            }
            match resolve_plugin(roots, name, config) {
                Ok(resolved) => {
                    plugins.insert(name.clone(), resolved);
                }
                Err(error) => {
                    warn!(plugin = %name, error = %error, "plugin refused at load");
                    refused.push((name.clone(), error));
                }
            }
        }

        (Self { plugins }, refused)
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedPlugin> {
        self.plugins.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&mut self, plugin: ResolvedPlugin) {
        self.plugins.insert(plugin.name.clone(), plugin);
    }
}

fn resolve_plugin(
    roots: &[PathBuf],
    name: &str,
    config: &PluginConfig,
) -> Result<ResolvedPlugin, ResolveError> {
    // The name becomes a path segment; refuse separators outright.
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(ResolveError::BadName(name.to_string()));
    }

    let dir = roots
        .iter()
        .map(|root| root.join(name))
        .find(|dir| dir.is_dir())
        .ok_or(ResolveError::NotFound)?;

    check_not_world_writable(&dir)?;

    let manifest = PluginManifest::load(&dir)?;
    manifest.check_config(&config.config)?;

    let binary = dir.join(&manifest.entrypoint);
    check_executable(&binary)?;
    check_contained(&dir, &binary)?;

    Ok(ResolvedPlugin {
        name: name.to_string(),
        dir,
        binary,
        manifest,
    })
}

fn check_not_world_writable(dir: &Path) -> Result<(), ResolveError> {
    let mode = std::fs::metadata(dir)
        .map(|m| m.permissions().mode())
        .unwrap_or(0);
    if mode & 0o002 != 0 {
        return Err(ResolveError::WorldWritable(dir.to_path_buf()));
    }
    Ok(())
}

fn check_executable(binary: &Path) -> Result<(), ResolveError> {
    let Ok(metadata) = std::fs::metadata(binary) else {
        return Err(ResolveError::NotExecutable(binary.to_path_buf()));
    };
    if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
        return Err(ResolveError::NotExecutable(binary.to_path_buf()));
    }
    Ok(())
}

/// The manifest already forbids `..`, but a symlinked entrypoint could
/// still point outside; compare canonical paths.
fn check_contained(dir: &Path, binary: &Path) -> Result<(), ResolveError> {
    let canonical_dir = dir
        .canonicalize()
        .map_err(|_| ResolveError::NotFound)?;
    let canonical_binary = binary
        .canonicalize()
        .map_err(|_| ResolveError::NotExecutable(binary.to_path_buf()))?;
    if !canonical_binary.starts_with(&canonical_dir) {
        return Err(ResolveError::EscapesRoot(binary.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
#[path = "resolve_tests.rs"]
mod tests;
