// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pipeline document AST, as written in YAML.
//!
//! ```yaml
//! pipelines:
//!   wisdom:
//!     on: discord.link_posted
//!     steps:
//!       - id: transcribe
//!         plugin: transcriber
//!         on:
//!           transcript.ready: summarize
//!       - id: summarize
//!         plugin: summarizer
//!         on:
//!           summary.ready: [archive, { call: publish }]
//! ```
//!
//! A transition target is a step id, a `{ call: pipeline }` reference into
//! another pipeline's entry step, or a list of either (`split` fan-out).
//! Declared step order fixes the entry step; routing itself is always via
//! explicit event-type transitions.

use ductile_core::Command;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One named pipeline as declared by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDoc {
    /// Trigger event type that opens a new context chain.
    pub on: String,
    pub steps: Vec<StepDoc>,
}

/// A step within a pipeline document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDoc {
    /// Step id; defaults to the plugin name when unambiguous.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub plugin: String,
    #[serde(default = "default_command")]
    pub command: Command,
    /// Emitted event type → successor target(s).
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub on: IndexMap<String, TransitionDoc>,
}

fn default_command() -> Command {
    Command::Handle
}

impl StepDoc {
    /// Effective step id (explicit id, else the plugin name).
    pub fn effective_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.plugin)
    }
}

/// A transition target in a step's `on` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransitionDoc {
    /// `event: step_id`
    Step(String),
    /// `event: { call: pipeline_name }`
    Call { call: String },
    /// `event: [target, target, ...]` — split fan-out in the same hop.
    Split(Vec<TransitionDoc>),
}

impl TransitionDoc {
    /// Flatten into leaf targets (splits expand, order preserved).
    pub fn leaves(&self) -> Vec<&TransitionDoc> {
        match self {
            TransitionDoc::Split(targets) => targets.iter().flat_map(|t| t.leaves()).collect(),
            leaf => vec![leaf],
        }
    }
}

#[cfg(test)]
#[path = "ast_tests.rs"]
mod tests;
