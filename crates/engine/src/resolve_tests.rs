// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use indexmap::indexmap;
use serde_json::json;
use std::fs;
use std::os::unix::fs::PermissionsExt;

const MANIFEST: &str = r#"
name: echo
protocol: 2
entrypoint: run.sh
commands: [poll, handle]
"#;

fn write_plugin(root: &Path, name: &str, manifest: &str) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("ductile.yaml"), manifest).unwrap();
    let binary = dir.join("run.sh");
    fs::write(&binary, "#!/bin/sh\n").unwrap();
    fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
    dir
}

fn configured(names: &[&str]) -> IndexMap<String, PluginConfig> {
    names
        .iter()
        .map(|n| (n.to_string(), PluginConfig::default()))
        .collect()
}

#[test]
fn resolves_plugin_from_first_matching_root() {
    let dir = tempfile::tempdir().unwrap();
    let root_a = dir.path().join("a");
    let root_b = dir.path().join("b");
    fs::create_dir_all(&root_a).unwrap();
    write_plugin(&root_b, "echo", MANIFEST);

    let (catalog, refused) = PluginCatalog::load(
        &[root_a, root_b.clone()],
        &configured(&["echo"]),
    );
    assert!(refused.is_empty());
    let plugin = catalog.get("echo").unwrap();
    assert_eq!(plugin.dir, root_b.join("echo"));
    assert_eq!(plugin.binary, root_b.join("echo/run.sh"));
    assert!(plugin.supports(ductile_core::Command::Poll));
}

#[test]
fn disabled_plugins_are_skipped_silently() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "echo", MANIFEST);

    let mut config = configured(&["echo"]);
    config["echo"].enabled = false;

    let (catalog, refused) = PluginCatalog::load(&[dir.path().to_path_buf()], &config);
    assert!(catalog.is_empty());
    assert!(refused.is_empty());
}

#[test]
fn missing_plugin_dir_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (catalog, refused) =
        PluginCatalog::load(&[dir.path().to_path_buf()], &configured(&["ghost"]));
    assert!(catalog.is_empty());
    assert!(matches!(refused[0].1, ResolveError::NotFound));
}

#[test]
fn path_separators_in_name_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (_, refused) = PluginCatalog::load(
        &[dir.path().to_path_buf()],
        &configured(&["../escape"]),
    );
    assert!(matches!(refused[0].1, ResolveError::BadName(_)));
}

#[test]
fn world_writable_dir_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let plugin_dir = write_plugin(dir.path(), "echo", MANIFEST);
    fs::set_permissions(&plugin_dir, fs::Permissions::from_mode(0o777)).unwrap();

    let (_, refused) = PluginCatalog::load(&[dir.path().to_path_buf()], &configured(&["echo"]));
    assert!(matches!(refused[0].1, ResolveError::WorldWritable(_)));
}

#[test]
fn non_executable_entrypoint_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let plugin_dir = write_plugin(dir.path(), "echo", MANIFEST);
    fs::set_permissions(plugin_dir.join("run.sh"), fs::Permissions::from_mode(0o644)).unwrap();

    let (_, refused) = PluginCatalog::load(&[dir.path().to_path_buf()], &configured(&["echo"]));
    assert!(matches!(refused[0].1, ResolveError::NotExecutable(_)));
}

#[test]
fn missing_entrypoint_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let plugin_dir = write_plugin(dir.path(), "echo", MANIFEST);
    fs::remove_file(plugin_dir.join("run.sh")).unwrap();

    let (_, refused) = PluginCatalog::load(&[dir.path().to_path_buf()], &configured(&["echo"]));
    assert!(matches!(refused[0].1, ResolveError::NotExecutable(_)));
}

#[test]
fn symlinked_entrypoint_escaping_the_dir_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let outside = dir.path().join("outside.sh");
    fs::write(&outside, "#!/bin/sh\n").unwrap();
    fs::set_permissions(&outside, fs::Permissions::from_mode(0o755)).unwrap();

    let plugin_dir = write_plugin(dir.path(), "echo", MANIFEST);
    fs::remove_file(plugin_dir.join("run.sh")).unwrap();
    std::os::unix::fs::symlink(&outside, plugin_dir.join("run.sh")).unwrap();

    let (_, refused) = PluginCatalog::load(&[dir.path().to_path_buf()], &configured(&["echo"]));
    assert!(matches!(refused[0].1, ResolveError::EscapesRoot(_)));
}

#[test]
fn bad_manifest_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "echo", "name: echo\nprotocol: 1\nentrypoint: run.sh\ncommands: [poll]\n");

    let (_, refused) = PluginCatalog::load(&[dir.path().to_path_buf()], &configured(&["echo"]));
    assert!(matches!(refused[0].1, ResolveError::Manifest(_)));
}

#[test]
fn missing_required_config_key_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = r#"
name: echo
protocol: 2
entrypoint: run.sh
commands: [poll]
config_keys:
  required: [token]
"#;
    write_plugin(dir.path(), "echo", manifest);

    let mut config = configured(&["echo"]);
    config["echo"].config = json!({});
    let (_, refused) = PluginCatalog::load(&[dir.path().to_path_buf()], &config);
    assert!(matches!(
        refused[0].1,
        ResolveError::Manifest(ManifestError::MissingConfigKey { .. })
    ));

    config["echo"].config = json!({"token": "x"});
    let (catalog, refused) = PluginCatalog::load(&[dir.path().to_path_buf()], &config);
    assert!(refused.is_empty());
    assert_eq!(catalog.len(), 1);
}
