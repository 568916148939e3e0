// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared scaffolding for engine tests: a real store in a tempdir, a fake
//! clock, a scripted runner, and plugin directories that pass the trust
//! checks.

use crate::bus::{BusSubscription, EventBus};
use crate::ctx::{ConfigView, EngineCtx};
use crate::resolve::PluginCatalog;
use crate::workspace::WorkspaceManager;
use ductile_adapters::FakePluginRunner;
use ductile_core::{Event, FakeClock};
use ductile_pipeline::{compile_set, Config, PipelineDoc, PipelineSet, Router, StateConfig};
use ductile_storage::{Store, StorePaths};
use indexmap::IndexMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

pub const T0: u64 = 1_000_000;

pub struct TestEngine {
    pub ctx: Arc<EngineCtx<FakePluginRunner, FakeClock>>,
    pub runner: FakePluginRunner,
    pub clock: FakeClock,
    _dir: tempfile::TempDir,
}

impl TestEngine {
    /// A subscription positioned after everything published so far.
    pub fn tap(&self) -> Tap {
        let mut sub = self.ctx.bus.subscribe();
        while sub.try_recv().is_some() {}
        Tap { sub }
    }
}

pub struct Tap {
    sub: BusSubscription,
}

impl Tap {
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.sub.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Write a trust-clean plugin directory (manifest + executable stub).
pub fn write_plugin_dir(root: &Path, name: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).expect("plugin dir");
    std::fs::write(
        dir.join("ductile.yaml"),
        format!("name: {name}\nprotocol: 2\nentrypoint: run.sh\ncommands: [poll, handle, health, init]\n"),
    )
    .expect("manifest");
    let binary = dir.join("run.sh");
    std::fs::write(&binary, "#!/bin/sh\nexit 0\n").expect("stub");
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).expect("chmod");
}

/// Build a full engine around a fake runner and clock.
///
/// `plugins_yaml` is the `plugins:` mapping body (or empty), and
/// `pipelines_yaml` the `pipelines:` mapping body (or empty). Plugin
/// directories are created for every plugin named in either.
pub fn engine(plugins_yaml: &str, pipelines_yaml: &str) -> TestEngine {
    let dir = tempfile::tempdir().expect("tempdir");
    let state_dir = dir.path().join("state");
    let plugin_root = dir.path().join("plugins");
    std::fs::create_dir_all(&plugin_root).expect("plugin root");

    let plugins: IndexMap<String, ductile_pipeline::PluginConfig> = if plugins_yaml.is_empty() {
        IndexMap::new()
    } else {
        serde_yaml::from_str(plugins_yaml).expect("plugins yaml")
    };
    let pipelines: IndexMap<String, PipelineDoc> = if pipelines_yaml.is_empty() {
        IndexMap::new()
    } else {
        serde_yaml::from_str(pipelines_yaml).expect("pipelines yaml")
    };

    for name in plugins.keys() {
        write_plugin_dir(&plugin_root, name);
    }
    for doc in pipelines.values() {
        for step in &doc.steps {
            write_plugin_dir(&plugin_root, &step.plugin);
        }
    }

    let mut config = Config {
        service: Default::default(),
        state: StateConfig {
            path: state_dir.clone(),
        },
        plugin_roots: vec![plugin_root.clone()],
        plugins,
        pipelines,
    };
    // Pipeline steps need config entries so successors inherit retry
    // policy; default anything not spelled out.
    let step_plugins: Vec<String> = config
        .pipelines
        .values()
        .flat_map(|doc| doc.steps.iter().map(|s| s.plugin.clone()))
        .collect();
    for name in step_plugins {
        config.plugins.entry(name).or_default();
    }

    let compiled = compile_set(&config.pipelines).expect("compile pipelines");
    let router = Router::new(PipelineSet::new(compiled));

    let (store, _) = Store::open(&StorePaths {
        wal_path: state_dir.join("wal/events.wal"),
        snapshot_path: state_dir.join("snapshot.bin"),
    })
    .expect("open store");

    let (catalog, refused) = PluginCatalog::load(&config.plugin_roots, &config.plugins);
    assert!(refused.is_empty(), "test plugins refused: {refused:?}");

    let runner = FakePluginRunner::new();
    let clock = FakeClock::new(T0);
    let ctx = EngineCtx::new(
        store,
        EventBus::new(100),
        router,
        WorkspaceManager::new(state_dir.join("workspaces")),
        runner.clone(),
        clock.clone(),
        ConfigView {
            config: Arc::new(config),
            catalog: Arc::new(catalog),
        },
    );

    TestEngine {
        ctx,
        runner,
        clock,
        _dir: dir,
    }
}
