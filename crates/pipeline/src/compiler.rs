// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pipeline compiler: documents → linked, cycle-free, fingerprinted DAGs.
//!
//! Passes:
//! 1. Resolve step ids and transition targets within each pipeline.
//! 2. Link `call` references to the target pipeline's entry step.
//! 3. Reject cycles in the cross-pipeline call graph and in each
//!    pipeline's step graph (DFS with a recursion stack).
//! 4. Canonicalize the compiled form (sorted maps) and fingerprint it
//!    with BLAKE3.

use crate::ast::{PipelineDoc, TransitionDoc};
use ductile_core::Command;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("pipeline {pipeline:?} has no steps")]
    NoSteps { pipeline: String },
    #[error("pipeline {pipeline:?} declares step {step:?} twice")]
    DuplicateStep { pipeline: String, step: String },
    #[error("pipeline {pipeline:?} has an empty trigger")]
    EmptyTrigger { pipeline: String },
    #[error("pipeline {pipeline:?} step {step:?} routes {event:?} to unknown step {target:?}")]
    UnknownStep {
        pipeline: String,
        step: String,
        event: String,
        target: String,
    },
    #[error("pipeline {pipeline:?} step {step:?} calls unknown pipeline {target:?}")]
    UnknownCall {
        pipeline: String,
        step: String,
        target: String,
    },
    #[error("cycle in pipeline call graph: {}", path.join(" -> "))]
    CallCycle { path: Vec<String> },
    #[error("cycle in pipeline {pipeline:?} step graph: {}", path.join(" -> "))]
    StepCycle { pipeline: String, path: Vec<String> },
}

/// A linked successor reference: a step inside a (possibly different)
/// pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRef {
    pub pipeline: String,
    pub step_id: String,
}

/// A compiled step: invocation plus its transition map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledStep {
    pub id: String,
    pub plugin: String,
    pub command: Command,
    /// Emitted event type → linked successors (split fan-out keeps order).
    pub transitions: IndexMap<String, Vec<StepRef>>,
}

/// An immutable compiled pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledPipeline {
    pub name: String,
    /// Trigger event type that opens a new chain at the entry step.
    pub trigger: String,
    pub entry: String,
    pub steps: IndexMap<String, CompiledStep>,
    /// BLAKE3 over the canonicalized compiled form; pins chains against
    /// live config edits.
    pub fingerprint: String,
}

impl CompiledPipeline {
    pub fn step(&self, id: &str) -> Option<&CompiledStep> {
        self.steps.get(id)
    }

    pub fn entry_step(&self) -> Option<&CompiledStep> {
        self.steps.get(&self.entry)
    }
}

/// Compile every pipeline document, linking `call` references across them.
pub fn compile_set(
    docs: &IndexMap<String, PipelineDoc>,
) -> Result<IndexMap<String, CompiledPipeline>, CompileError> {
    // Pass 0: entry step of each pipeline, for call linking.
    let mut entries: HashMap<String, String> = HashMap::new();
    for (name, doc) in docs {
        if doc.on.trim().is_empty() {
            return Err(CompileError::EmptyTrigger {
                pipeline: name.clone(),
            });
        }
        let first = doc.steps.first().ok_or_else(|| CompileError::NoSteps {
            pipeline: name.clone(),
        })?;
        entries.insert(name.clone(), first.effective_id().to_string());
    }

    // Pass 1+2: resolve and link each pipeline.
    let mut compiled: IndexMap<String, CompiledPipeline> = IndexMap::new();
    let mut call_edges: HashMap<String, Vec<String>> = HashMap::new();
    for (name, doc) in docs {
        let pipeline = compile_one(name, doc, &entries, &mut call_edges)?;
        compiled.insert(name.clone(), pipeline);
    }

    // Pass 3a: call-graph cycles.
    check_call_cycles(&call_edges)?;

    // Pass 3b: per-pipeline step-graph cycles (intra-pipeline edges only).
    for pipeline in compiled.values() {
        check_step_cycles(pipeline)?;
    }

    // Pass 4: fingerprint.
    for pipeline in compiled.values_mut() {
        pipeline.fingerprint = fingerprint(pipeline);
    }

    Ok(compiled)
}

fn compile_one(
    name: &str,
    doc: &PipelineDoc,
    entries: &HashMap<String, String>,
    call_edges: &mut HashMap<String, Vec<String>>,
) -> Result<CompiledPipeline, CompileError> {
    let mut step_ids: HashSet<String> = HashSet::new();
    for step in &doc.steps {
        if !step_ids.insert(step.effective_id().to_string()) {
            return Err(CompileError::DuplicateStep {
                pipeline: name.to_string(),
                step: step.effective_id().to_string(),
            });
        }
    }

    let mut steps: IndexMap<String, CompiledStep> = IndexMap::new();
    for step in &doc.steps {
        let step_id = step.effective_id().to_string();
        let mut transitions: IndexMap<String, Vec<StepRef>> = IndexMap::new();

        for (event_type, transition) in &step.on {
            let mut successors = Vec::new();
            for leaf in transition.leaves() {
                match leaf {
                    TransitionDoc::Step(target) => {
                        if !step_ids.contains(target) {
                            return Err(CompileError::UnknownStep {
                                pipeline: name.to_string(),
                                step: step_id.clone(),
                                event: event_type.clone(),
                                target: target.clone(),
                            });
                        }
                        successors.push(StepRef {
                            pipeline: name.to_string(),
                            step_id: target.clone(),
                        });
                    }
                    TransitionDoc::Call { call } => {
                        let entry =
                            entries.get(call).ok_or_else(|| CompileError::UnknownCall {
                                pipeline: name.to_string(),
                                step: step_id.clone(),
                                target: call.clone(),
                            })?;
                        call_edges
                            .entry(name.to_string())
                            .or_default()
                            .push(call.clone());
                        successors.push(StepRef {
                            pipeline: call.clone(),
                            step_id: entry.clone(),
                        });
                    }
                    TransitionDoc::Split(_) => {}
                }
            }
            transitions.insert(event_type.clone(), successors);
        }

        steps.insert(
            step_id.clone(),
            CompiledStep {
                id: step_id,
                plugin: step.plugin.clone(),
                command: step.command,
                transitions,
            },
        );
    }

    let entry = doc
        .steps
        .first()
        .map(|s| s.effective_id().to_string())
        .unwrap_or_default();

    Ok(CompiledPipeline {
        name: name.to_string(),
        trigger: doc.on.clone(),
        entry,
        steps,
        fingerprint: String::new(),
    })
}

fn check_call_cycles(edges: &HashMap<String, Vec<String>>) -> Result<(), CompileError> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<String> = Vec::new();
    let mut on_stack: HashSet<String> = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        edges: &'a HashMap<String, Vec<String>>,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<String>,
        on_stack: &mut HashSet<String>,
    ) -> Result<(), CompileError> {
        if on_stack.contains(node) {
            let mut path: Vec<String> = stack.clone();
            path.push(node.to_string());
            return Err(CompileError::CallCycle { path });
        }
        if !visited.insert(node) {
            return Ok(());
        }
        stack.push(node.to_string());
        on_stack.insert(node.to_string());
        if let Some(next) = edges.get(node) {
            for target in next {
                visit(target, edges, visited, stack, on_stack)?;
            }
        }
        stack.pop();
        on_stack.remove(node);
        Ok(())
    }

    let mut roots: Vec<&String> = edges.keys().collect();
    roots.sort();
    for root in roots {
        visit(root, edges, &mut visited, &mut stack, &mut on_stack)?;
    }
    Ok(())
}

fn check_step_cycles(pipeline: &CompiledPipeline) -> Result<(), CompileError> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<String> = Vec::new();
    let mut on_stack: HashSet<String> = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        pipeline: &'a CompiledPipeline,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<String>,
        on_stack: &mut HashSet<String>,
    ) -> Result<(), CompileError> {
        if on_stack.contains(node) {
            let mut path: Vec<String> = stack.clone();
            path.push(node.to_string());
            return Err(CompileError::StepCycle {
                pipeline: pipeline.name.clone(),
                path,
            });
        }
        if !visited.insert(node) {
            return Ok(());
        }
        stack.push(node.to_string());
        on_stack.insert(node.to_string());
        if let Some(step) = pipeline.steps.get(node) {
            for successors in step.transitions.values() {
                for target in successors {
                    // Cross-pipeline edges belong to the call graph.
                    if target.pipeline == pipeline.name {
                        visit(&target.step_id, pipeline, visited, stack, on_stack)?;
                    }
                }
            }
        }
        stack.pop();
        on_stack.remove(node);
        Ok(())
    }

    for step_id in pipeline.steps.keys() {
        visit(step_id, pipeline, &mut visited, &mut stack, &mut on_stack)?;
    }
    Ok(())
}

/// Canonicalize and hash the compiled form.
///
/// All maps are re-keyed into `BTreeMap` so serialization order is total;
/// arrays keep declared order (split order is semantic). The fingerprint
/// field itself is excluded.
fn fingerprint(pipeline: &CompiledPipeline) -> String {
    #[derive(Serialize)]
    struct CanonicalStep<'a> {
        plugin: &'a str,
        command: Command,
        transitions: BTreeMap<&'a str, &'a [StepRef]>,
    }

    #[derive(Serialize)]
    struct CanonicalPipeline<'a> {
        name: &'a str,
        trigger: &'a str,
        entry: &'a str,
        steps: BTreeMap<&'a str, CanonicalStep<'a>>,
    }

    let canonical = CanonicalPipeline {
        name: &pipeline.name,
        trigger: &pipeline.trigger,
        entry: &pipeline.entry,
        steps: pipeline
            .steps
            .iter()
            .map(|(id, step)| {
                (
                    id.as_str(),
                    CanonicalStep {
                        plugin: &step.plugin,
                        command: step.command,
                        transitions: step
                            .transitions
                            .iter()
                            .map(|(event, refs)| (event.as_str(), refs.as_slice()))
                            .collect(),
                    },
                )
            })
            .collect(),
    };

    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

#[cfg(test)]
#[path = "compiler_tests.rs"]
mod tests;
