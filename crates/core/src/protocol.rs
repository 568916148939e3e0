// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Plugin wire protocol (v2).
//!
//! Framing: one JSON object written to the plugin's stdin, one JSON object
//! read back from its stdout, process exits. Stderr is free-form
//! diagnostics. Anything on stdout that is not exactly one schema-valid
//! JSON object is a protocol error and fails the job permanently.

use crate::id::JobId;
use crate::job::Command;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use thiserror::Error;

/// Protocol revision spoken by this core.
pub const PROTOCOL_VERSION: u32 = 2;

/// Exit code a plugin uses to signal a non-retryable configuration error.
pub const EXIT_CONFIG_ERROR: i32 = 78;

/// Exit code a plugin uses to signal an explicitly transient failure.
pub const EXIT_TRANSIENT: i32 = 75;

/// Request envelope, core → plugin on fd 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRequest {
    pub protocol: u32,
    pub job_id: JobId,
    pub command: Command,
    /// The plugin's static config section from the loaded config.
    #[serde(default)]
    pub config: Value,
    /// Full current plugin state blob.
    #[serde(default)]
    pub state: Value,
    /// Present for `handle` only; equals the parent hop's payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_context: Option<RequestContext>,
    pub workspace_dir: PathBuf,
    /// Informational ISO-8601 deadline.
    pub deadline_at: String,
}

/// The slice of the event context a plugin is shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub accumulated: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// An event a plugin emitted for routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// A structured log line relayed into the core's own logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginLog {
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
}

/// Response envelope, plugin → core on fd 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default = "default_retry")]
    pub retry: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EmittedEvent>,
    /// Shallow-merged into the plugin's state blob on success.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub state_updates: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<PluginLog>,
}

fn default_retry() -> bool {
    true
}

impl PluginResponse {
    pub fn ok() -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            retry: true,
            events: Vec::new(),
            state_updates: Map::new(),
            logs: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>, retry: bool) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(message.into()),
            retry,
            events: Vec::new(),
            state_updates: Map::new(),
            logs: Vec::new(),
        }
    }
}

/// Violations of the stdout-is-protocol rule.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty stdout (expected one JSON object)")]
    Empty,
    #[error("stdout is not valid JSON: {0}")]
    Invalid(String),
    #[error("trailing data after the response object")]
    TrailingData,
    #[error("status is \"error\" but no error message was given")]
    MissingErrorMessage,
    #[error("emitted event #{index} has an empty type")]
    EmptyEventType { index: usize },
}

/// Parse a plugin's captured stdout as exactly one response object.
pub fn parse_response(stdout: &[u8]) -> Result<PluginResponse, ProtocolError> {
    let text = std::str::from_utf8(stdout)
        .map_err(|e| ProtocolError::Invalid(e.to_string()))?
        .trim();
    if text.is_empty() {
        return Err(ProtocolError::Empty);
    }

    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<PluginResponse>();
    let response = match stream.next() {
        Some(Ok(response)) => response,
        Some(Err(e)) => return Err(ProtocolError::Invalid(e.to_string())),
        None => return Err(ProtocolError::Empty),
    };
    if text[stream.byte_offset()..].trim() != "" {
        return Err(ProtocolError::TrailingData);
    }

    if response.status == ResponseStatus::Error && response.error.is_none() {
        return Err(ProtocolError::MissingErrorMessage);
    }
    for (index, event) in response.events.iter().enumerate() {
        if event.event_type.is_empty() {
            return Err(ProtocolError::EmptyEventType { index });
        }
    }

    Ok(response)
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "protocol_property_tests.rs"]
mod property_tests;
