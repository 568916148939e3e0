// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event-type routing over compiled pipeline sets.
//!
//! The router answers two questions:
//! - entry: which pipelines does this event type trigger?
//! - next: given a job pinned to `(pipeline, step, fingerprint)` and an
//!   emitted event type, which steps run next?
//!
//! Chains are pinned to the fingerprint they started under. A reload swaps
//! the current set atomically and retires the previous pipelines by
//! fingerprint so in-flight chains keep resolving against the DAG they
//! began with; a pin that is no longer loadable falls back to the current
//! set with a logged mismatch, and a step absent from the resolved DAG is
//! never executed.

use crate::compiler::{CompiledPipeline, StepRef};
use ductile_core::Command;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// One successor to enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub pipeline: String,
    pub step_id: String,
    pub plugin: String,
    pub command: Command,
    /// Fingerprint the successor job is pinned to.
    pub fingerprint: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("pipeline {0:?} is not loaded")]
    UnknownPipeline(String),
    #[error("step {step:?} does not exist in pipeline {pipeline:?} (fingerprint {fingerprint})")]
    UnknownStep {
        pipeline: String,
        step: String,
        fingerprint: String,
    },
}

/// An immutable compiled pipeline set.
#[derive(Debug, Default, Clone)]
pub struct PipelineSet {
    by_name: IndexMap<String, Arc<CompiledPipeline>>,
    by_fingerprint: HashMap<String, Arc<CompiledPipeline>>,
}

impl PipelineSet {
    pub fn new(compiled: IndexMap<String, CompiledPipeline>) -> Self {
        let mut by_name = IndexMap::new();
        let mut by_fingerprint = HashMap::new();
        for (name, pipeline) in compiled {
            let pipeline = Arc::new(pipeline);
            by_fingerprint.insert(pipeline.fingerprint.clone(), Arc::clone(&pipeline));
            by_name.insert(name, pipeline);
        }
        Self {
            by_name,
            by_fingerprint,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CompiledPipeline>> {
        self.by_name.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.by_name.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }
}

/// Shared routing handle; `swap` publishes a new set atomically.
#[derive(Clone, Default)]
pub struct Router {
    inner: Arc<RwLock<RouterInner>>,
}

#[derive(Default)]
struct RouterInner {
    current: PipelineSet,
    /// Pipelines from previous sets, kept addressable by fingerprint so
    /// pinned chains outlive reloads.
    retired: HashMap<String, Arc<CompiledPipeline>>,
}

impl Router {
    pub fn new(set: PipelineSet) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RouterInner {
                current: set,
                retired: HashMap::new(),
            })),
        }
    }

    /// Replace the active set; the previous set's pipelines are retired by
    /// fingerprint.
    pub fn swap(&self, set: PipelineSet) {
        let mut inner = self.inner.write();
        let old = std::mem::replace(&mut inner.current, set);
        for pipeline in old.by_fingerprint.into_values() {
            inner
                .retired
                .entry(pipeline.fingerprint.clone())
                .or_insert(pipeline);
        }
    }

    /// Pipelines whose trigger matches this event type, in deterministic
    /// (declared, name-stable) order. All matches fan out.
    pub fn entry_matches(&self, event_type: &str) -> Vec<RouteTarget> {
        let inner = self.inner.read();
        let mut matches: Vec<&Arc<CompiledPipeline>> = inner
            .current
            .by_name
            .values()
            .filter(|p| p.trigger == event_type)
            .collect();
        matches.sort_by(|a, b| a.name.cmp(&b.name));

        matches
            .into_iter()
            .filter_map(|pipeline| {
                let entry = pipeline.entry_step()?;
                Some(RouteTarget {
                    pipeline: pipeline.name.clone(),
                    step_id: entry.id.clone(),
                    plugin: entry.plugin.clone(),
                    command: entry.command,
                    fingerprint: pipeline.fingerprint.clone(),
                })
            })
            .collect()
    }

    /// Successors of `(pipeline, step)` for an emitted event type.
    ///
    /// An empty vec is a no-op (no transition declared for this event
    /// type), not an error. Cross-pipeline (`call`) successors are pinned
    /// to the target pipeline's current fingerprint.
    pub fn next(
        &self,
        pipeline_name: &str,
        pinned_fingerprint: Option<&str>,
        step_id: &str,
        event_type: &str,
    ) -> Result<Vec<RouteTarget>, RouteError> {
        let inner = self.inner.read();
        let pipeline = inner.resolve(pipeline_name, pinned_fingerprint)?;

        let step = pipeline
            .step(step_id)
            .ok_or_else(|| RouteError::UnknownStep {
                pipeline: pipeline.name.clone(),
                step: step_id.to_string(),
                fingerprint: pipeline.fingerprint.clone(),
            })?;

        let Some(successors) = step.transitions.get(event_type) else {
            return Ok(Vec::new());
        };

        let mut targets = Vec::with_capacity(successors.len());
        for StepRef {
            pipeline: target_pipeline,
            step_id: target_step,
        } in successors
        {
            let resolved = if target_pipeline == &pipeline.name {
                Arc::clone(&pipeline)
            } else {
                // A call edge enters the other pipeline's current version.
                inner.resolve(target_pipeline, None)?
            };
            let step = resolved
                .step(target_step)
                .ok_or_else(|| RouteError::UnknownStep {
                    pipeline: resolved.name.clone(),
                    step: target_step.clone(),
                    fingerprint: resolved.fingerprint.clone(),
                })?;
            targets.push(RouteTarget {
                pipeline: resolved.name.clone(),
                step_id: step.id.clone(),
                plugin: step.plugin.clone(),
                command: step.command,
                fingerprint: resolved.fingerprint.clone(),
            });
        }
        Ok(targets)
    }
}

impl RouterInner {
    fn resolve(
        &self,
        name: &str,
        pinned_fingerprint: Option<&str>,
    ) -> Result<Arc<CompiledPipeline>, RouteError> {
        if let Some(pin) = pinned_fingerprint {
            if let Some(pipeline) = self.current.by_fingerprint.get(pin) {
                return Ok(Arc::clone(pipeline));
            }
            if let Some(pipeline) = self.retired.get(pin) {
                return Ok(Arc::clone(pipeline));
            }
            warn!(
                pipeline = name,
                fingerprint = pin,
                "pinned pipeline fingerprint no longer loadable, falling back to current"
            );
        }
        self.current
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| RouteError::UnknownPipeline(name.to_string()))
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
