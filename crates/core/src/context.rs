// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event context records and the accumulation merge.
//!
//! Each pipeline hop appends one immutable context record. A context's
//! `accumulated` value carries every upstream plugin's contribution under a
//! namespace keyed by the plugin name, plus a closed set of top-level
//! baggage keys copied without nesting so end-of-chain plugins can act with
//! originator information.

use crate::id::{EventId, JobId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Top-level keys copied across hops without namespacing.
pub const BAGGAGE_KEYS: &[&str] = &["channel_id", "user_id", "trace_id", "source"];

/// Immutable per-hop record.
///
/// Fan-out creates one child per matched successor; siblings share
/// `parent_event_id` but never a record, so branches cannot observe one
/// another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    pub event_id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<EventId>,
    /// The job that emitted the event this record captures.
    pub job_id: JobId,
    pub pipeline_name: String,
    pub source_step_id: String,
    pub emitted_event_type: String,
    /// Just the emitting plugin's contribution.
    #[serde(default)]
    pub payload: Value,
    /// Deep-namespaced merge of the parent's accumulated value with
    /// this hop's payload.
    #[serde(default)]
    pub accumulated: Value,
    #[serde(default)]
    pub hop_count: u32,
    pub created_at_ms: u64,
}

impl EventContext {
    /// Open a new chain from an external trigger or scheduler entry.
    #[allow(clippy::too_many_arguments)]
    pub fn entry(
        event_id: EventId,
        job_id: JobId,
        pipeline_name: impl Into<String>,
        source_step_id: impl Into<String>,
        emitted_event_type: impl Into<String>,
        source: &str,
        payload: Value,
        now_ms: u64,
    ) -> Self {
        let accumulated = accumulate(&Value::Null, source, &payload);
        Self {
            event_id,
            parent_event_id: None,
            job_id,
            pipeline_name: pipeline_name.into(),
            source_step_id: source_step_id.into(),
            emitted_event_type: emitted_event_type.into(),
            payload,
            accumulated,
            hop_count: 0,
            created_at_ms: now_ms,
        }
    }

    /// Derive the next hop's record from this one.
    ///
    /// `source` is the plugin that produced `payload`. Each call mints an
    /// independent child, so fan-out is one call per matched successor.
    #[allow(clippy::too_many_arguments)]
    pub fn child(
        &self,
        event_id: EventId,
        job_id: JobId,
        source_step_id: impl Into<String>,
        emitted_event_type: impl Into<String>,
        source: &str,
        payload: Value,
        now_ms: u64,
    ) -> Self {
        let accumulated = accumulate(&self.accumulated, source, &payload);
        Self {
            event_id,
            parent_event_id: Some(self.event_id.clone()),
            job_id,
            pipeline_name: self.pipeline_name.clone(),
            source_step_id: source_step_id.into(),
            emitted_event_type: emitted_event_type.into(),
            payload,
            accumulated,
            hop_count: self.hop_count + 1,
            created_at_ms: now_ms,
        }
    }
}

/// Merge a hop's payload into the parent's accumulated value.
///
/// The payload lands under `{source: payload}` with object values merged
/// recursively (last write wins per key inside one namespace; distinct
/// plugins cannot collide). Baggage keys found in the payload are copied
/// alongside at the top level.
pub fn accumulate(parent_accumulated: &Value, source: &str, payload: &Value) -> Value {
    let mut merged = match parent_accumulated {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    if let Value::Object(payload_map) = payload {
        for &key in BAGGAGE_KEYS {
            if let Some(value) = payload_map.get(key) {
                merged.insert(key.to_string(), value.clone());
            }
        }
    }

    let slot = merged
        .entry(source.to_string())
        .or_insert(Value::Object(Map::new()));
    deep_merge(slot, payload);

    Value::Object(merged)
}

/// Recursive object merge; non-object values replace the destination.
fn deep_merge(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (key, value) in src_map {
                match dst_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        dst_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}

/// Serialized byte length of a JSON value, for enforcing size caps.
pub fn serialized_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;
