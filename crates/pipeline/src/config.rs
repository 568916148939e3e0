// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Validated service configuration.
//!
//! Discovery and file-integrity checking live outside the core; this module
//! defines the shape the loader must produce plus a plain YAML entry point
//! used by the daemon and by tests.

use crate::ast::PipelineDoc;
use crate::interval::{serde_interval, serde_interval_opt, PreferredWindow};
use ductile_core::limits::{
    DEFAULT_BACKOFF_BASE, DEFAULT_BREAKER_RESET_AFTER, DEFAULT_BREAKER_THRESHOLD,
    DEFAULT_DEDUPE_TTL, DEFAULT_JOB_LOG_RETENTION, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_OUTSTANDING_POLLS, DEFAULT_TICK_INTERVAL,
};
use ductile_core::Command;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("plugin name must not be empty")]
    EmptyPluginName,
    #[error("plugin {0:?} schedule uses command {1} (schedules may only poll or health-check)")]
    BadScheduleCommand(String, Command),
    #[error("no plugin roots configured")]
    NoPluginRoots,
}

/// Service-level knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    #[serde(with = "serde_interval")]
    pub tick_interval: Duration,
    #[serde(with = "serde_interval")]
    pub dedupe_ttl: Duration,
    #[serde(with = "serde_interval")]
    pub job_log_retention: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            dedupe_ttl: DEFAULT_DEDUPE_TTL,
            job_log_retention: DEFAULT_JOB_LOG_RETENTION,
        }
    }
}

/// Storage location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    /// State directory holding the store, lock file, and workspaces.
    pub path: PathBuf,
}

/// One schedule entry for a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDef {
    #[serde(with = "serde_interval")]
    pub every: Duration,
    #[serde(default, with = "serde_interval_opt", skip_serializing_if = "Option::is_none")]
    pub jitter: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_window: Option<PreferredWindow>,
    #[serde(default = "default_schedule_command")]
    pub command: Command,
}

fn default_schedule_command() -> Command {
    Command::Poll
}

/// Retry policy for a plugin's jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "serde_interval")]
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

/// Per-command timeout overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    #[serde(with = "serde_interval_opt", skip_serializing_if = "Option::is_none")]
    pub poll: Option<Duration>,
    #[serde(with = "serde_interval_opt", skip_serializing_if = "Option::is_none")]
    pub handle: Option<Duration>,
    #[serde(with = "serde_interval_opt", skip_serializing_if = "Option::is_none")]
    pub health: Option<Duration>,
    #[serde(with = "serde_interval_opt", skip_serializing_if = "Option::is_none")]
    pub init: Option<Duration>,
}

impl Timeouts {
    /// The effective deadline for a command (override or protocol default).
    pub fn resolve(&self, command: Command) -> Duration {
        let override_for = match command {
            Command::Poll => self.poll,
            Command::Handle => self.handle,
            Command::Health => self.health,
            Command::Init => self.init,
        };
        override_for.unwrap_or_else(|| command.default_timeout())
    }
}

/// Circuit-breaker policy for scheduled polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerPolicy {
    pub threshold: u32,
    #[serde(with = "serde_interval")]
    pub reset_after: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_BREAKER_THRESHOLD,
            reset_after: DEFAULT_BREAKER_RESET_AFTER,
        }
    }
}

/// Per-plugin configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub enabled: bool,
    pub schedules: Vec<ScheduleDef>,
    /// Opaque static config handed to the plugin in every request.
    pub config: Value,
    pub retry: RetryPolicy,
    pub timeouts: Timeouts,
    pub circuit_breaker: BreakerPolicy,
    pub max_outstanding_polls: u32,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedules: Vec::new(),
            config: Value::Object(Default::default()),
            retry: RetryPolicy::default(),
            timeouts: Timeouts::default(),
            circuit_breaker: BreakerPolicy::default(),
            max_outstanding_polls: DEFAULT_MAX_OUTSTANDING_POLLS,
        }
    }
}

/// The whole validated configuration object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    pub state: StateConfig,
    pub plugin_roots: Vec<PathBuf>,
    #[serde(default)]
    pub plugins: IndexMap<String, PluginConfig>,
    #[serde(default)]
    pub pipelines: IndexMap<String, PipelineDoc>,
}

impl Config {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plugin_roots.is_empty() {
            return Err(ConfigError::NoPluginRoots);
        }
        for (name, plugin) in &self.plugins {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyPluginName);
            }
            for schedule in &plugin.schedules {
                // Event-driven commands cannot be scheduled; they need input.
                if matches!(schedule.command, Command::Handle | Command::Init) {
                    return Err(ConfigError::BadScheduleCommand(
                        name.clone(),
                        schedule.command,
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginConfig> {
        self.plugins.get(name)
    }

    /// Enabled plugins with at least one schedule, in declaration order.
    pub fn scheduled_plugins(&self) -> impl Iterator<Item = (&String, &PluginConfig)> {
        self.plugins
            .iter()
            .filter(|(_, p)| p.enabled && !p.schedules.is_empty())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
