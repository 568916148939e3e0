// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serde_json::json;

const ECHO: &str = r#"
name: echo
protocol: 2
entrypoint: bin/echo.sh
commands: [poll, handle]
config_keys:
  required: [token]
  optional: [region]
metadata:
  poll:
    type: read
    description: Fetch new items
"#;

#[test]
fn valid_manifest_parses() {
    let manifest = PluginManifest::from_yaml_str(ECHO).unwrap();
    assert_eq!(manifest.name, "echo");
    assert_eq!(manifest.entrypoint, PathBuf::from("bin/echo.sh"));
    assert!(manifest.supports(Command::Poll));
    assert!(manifest.supports(Command::Handle));
    assert!(!manifest.supports(Command::Init));
    assert_eq!(manifest.metadata["poll"].kind, Some(AccessKind::Read));
}

#[test]
fn unsupported_protocol_is_refused() {
    let yaml = "name: old\nprotocol: 1\nentrypoint: run\ncommands: [poll]\n";
    assert!(matches!(
        PluginManifest::from_yaml_str(yaml),
        Err(ManifestError::UnsupportedProtocol { protocol: 1, .. })
    ));
}

#[yare::parameterized(
    parent_traversal = { "../outside" },
    absolute = { "/usr/bin/sh" },
    sneaky_parent = { "bin/../../outside" },
    empty = { "\"\"" },
)]
fn unsafe_entrypoints_are_refused(entrypoint: &str) {
    let yaml = format!("name: bad\nprotocol: 2\nentrypoint: {entrypoint}\ncommands: [poll]\n");
    assert!(matches!(
        PluginManifest::from_yaml_str(&yaml),
        Err(ManifestError::UnsafeEntrypoint { .. })
    ));
}

#[test]
fn dotted_relative_entrypoint_is_allowed() {
    let yaml = "name: ok\nprotocol: 2\nentrypoint: ./run.sh\ncommands: [poll]\n";
    assert!(PluginManifest::from_yaml_str(yaml).is_ok());
}

#[test]
fn empty_commands_are_refused() {
    let yaml = "name: idle\nprotocol: 2\nentrypoint: run\ncommands: []\n";
    assert!(matches!(
        PluginManifest::from_yaml_str(yaml),
        Err(ManifestError::NoCommands { .. })
    ));
}

#[test]
fn metadata_for_undeclared_command_is_refused() {
    let yaml = r#"
name: bad
protocol: 2
entrypoint: run
commands: [poll]
metadata:
  handle:
    description: not declared
"#;
    assert!(matches!(
        PluginManifest::from_yaml_str(yaml),
        Err(ManifestError::UnknownMetadataCommand { command, .. }) if command == "handle"
    ));
}

#[test]
fn metadata_for_unknown_command_name_is_refused() {
    let yaml = r#"
name: bad
protocol: 2
entrypoint: run
commands: [poll]
metadata:
  reload:
    description: no such command
"#;
    assert!(matches!(
        PluginManifest::from_yaml_str(yaml),
        Err(ManifestError::UnknownMetadataCommand { .. })
    ));
}

#[test]
fn required_config_keys_are_checked() {
    let manifest = PluginManifest::from_yaml_str(ECHO).unwrap();
    assert!(manifest.check_config(&json!({"token": "x"})).is_ok());
    assert!(matches!(
        manifest.check_config(&json!({"region": "eu"})),
        Err(ManifestError::MissingConfigKey { key, .. }) if key == "token"
    ));
}

#[test]
fn load_reads_from_plugin_dir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(MANIFEST_FILE), ECHO).unwrap();
    let manifest = PluginManifest::load(dir.path()).unwrap();
    assert_eq!(manifest.name, "echo");
}

#[test]
fn missing_manifest_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        PluginManifest::load(dir.path()),
        Err(ManifestError::Read { .. })
    ));
}
