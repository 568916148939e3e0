// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Plugin manifests.
//!
//! Each plugin directory carries a `ductile.yaml` describing the plugin:
//! name, protocol revision, entrypoint, supported commands, and config
//! keys. Manifests that fail validation refuse the plugin at load time; it
//! is never dispatched.

use ductile_core::{Command, PROTOCOL_VERSION};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Manifest file name inside a plugin directory.
pub const MANIFEST_FILE: &str = "ductile.yaml";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("manifest name must not be empty")]
    EmptyName,
    #[error("plugin {name:?} speaks protocol {protocol}, this core speaks {PROTOCOL_VERSION}")]
    UnsupportedProtocol { name: String, protocol: u32 },
    #[error("plugin {name:?} entrypoint must be a relative path without parent components")]
    UnsafeEntrypoint { name: String },
    #[error("plugin {name:?} declares no commands")]
    NoCommands { name: String },
    #[error("plugin {name:?} has metadata for undeclared command {command:?}")]
    UnknownMetadataCommand { name: String, command: String },
    #[error("plugin {name:?} is missing required config key {key:?}")]
    MissingConfigKey { name: String, key: String },
}

/// Required and optional config keys a plugin declares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigKeys {
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

/// Whether a command reads or mutates the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Read,
    Write,
}

/// Optional per-command metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandMeta {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<AccessKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

/// A plugin's manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub protocol: u32,
    /// Relative path of the executable inside the plugin directory.
    pub entrypoint: PathBuf,
    pub commands: Vec<Command>,
    #[serde(default)]
    pub config_keys: ConfigKeys,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub metadata: IndexMap<String, CommandMeta>,
}

impl PluginManifest {
    /// Read and validate `ductile.yaml` from a plugin directory.
    pub fn load(plugin_dir: &Path) -> Result<Self, ManifestError> {
        let path = plugin_dir.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|source| ManifestError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Parse and validate a manifest document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ManifestError> {
        let manifest: PluginManifest = serde_yaml::from_str(yaml)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.name.trim().is_empty() {
            return Err(ManifestError::EmptyName);
        }
        if self.protocol != PROTOCOL_VERSION {
            return Err(ManifestError::UnsupportedProtocol {
                name: self.name.clone(),
                protocol: self.protocol,
            });
        }
        if !is_safe_relative(&self.entrypoint) {
            return Err(ManifestError::UnsafeEntrypoint {
                name: self.name.clone(),
            });
        }
        if self.commands.is_empty() {
            return Err(ManifestError::NoCommands {
                name: self.name.clone(),
            });
        }
        for command in self.metadata.keys() {
            let declared = command
                .parse::<Command>()
                .ok()
                .map_or(false, |c| self.commands.contains(&c));
            if !declared {
                return Err(ManifestError::UnknownMetadataCommand {
                    name: self.name.clone(),
                    command: command.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn supports(&self, command: Command) -> bool {
        self.commands.contains(&command)
    }

    /// Verify the plugin's static config section satisfies the manifest.
    pub fn check_config(&self, config: &Value) -> Result<(), ManifestError> {
        for key in &self.config_keys.required {
            if config.get(key).is_none() {
                return Err(ManifestError::MissingConfigKey {
                    name: self.name.clone(),
                    key: key.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Relative, non-empty, and free of `..`/root components.
fn is_safe_relative(path: &Path) -> bool {
    if path.as_os_str().is_empty() {
        return false;
    }
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
#[path = "manifest_tests.rs"]
mod tests;
