// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scripted plugin runner for engine tests.
//!
//! Outcomes are consumed in FIFO order, one per invocation; every
//! invocation is recorded so tests can assert on the request envelopes the
//! dispatcher built.

use crate::process::{PluginInvocation, PluginRunOutput, PluginRunner, RunnerError};
use async_trait::async_trait;
use ductile_core::PluginResponse;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum FakeOutcome {
    /// A well-formed protocol response with the given exit code.
    Respond {
        response: PluginResponse,
        exit_code: i32,
    },
    /// Arbitrary raw stdout/stderr bytes with an exit code.
    Raw {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        exit_code: Option<i32>,
    },
    /// The plugin ran past its deadline and was killed.
    TimeOut,
    /// Spawn failure (missing or unrunnable binary).
    SpawnError,
}

#[derive(Default)]
struct Inner {
    script: VecDeque<FakeOutcome>,
    invocations: Vec<PluginInvocation>,
}

/// Scripted [`PluginRunner`].
#[derive(Clone, Default)]
pub struct FakePluginRunner {
    inner: Arc<Mutex<Inner>>,
}

impl FakePluginRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: FakeOutcome) {
        self.inner.lock().script.push_back(outcome);
    }

    /// Script a successful protocol response (exit 0).
    pub fn push_response(&self, response: PluginResponse) {
        self.push(FakeOutcome::Respond {
            response,
            exit_code: 0,
        });
    }

    /// Script a protocol response with a specific exit code.
    pub fn push_response_with_exit(&self, response: PluginResponse, exit_code: i32) {
        self.push(FakeOutcome::Respond {
            response,
            exit_code,
        });
    }

    /// Script raw stdout bytes (e.g. protocol garbage).
    pub fn push_raw_stdout(&self, stdout: &[u8], exit_code: i32) {
        self.push(FakeOutcome::Raw {
            stdout: stdout.to_vec(),
            stderr: Vec::new(),
            exit_code: Some(exit_code),
        });
    }

    pub fn push_timeout(&self) {
        self.push(FakeOutcome::TimeOut);
    }

    /// Request envelopes seen so far, in invocation order.
    pub fn invocations(&self) -> Vec<PluginInvocation> {
        self.inner.lock().invocations.clone()
    }

    pub fn remaining(&self) -> usize {
        self.inner.lock().script.len()
    }
}

#[async_trait]
impl PluginRunner for FakePluginRunner {
    async fn run(&self, invocation: PluginInvocation) -> Result<PluginRunOutput, RunnerError> {
        let outcome = {
            let mut inner = self.inner.lock();
            inner.invocations.push(invocation.clone());
            inner.script.pop_front()
        };

        match outcome {
            Some(FakeOutcome::Respond {
                response,
                exit_code,
            }) => Ok(PluginRunOutput {
                exit_code: Some(exit_code),
                stdout: serde_json::to_vec(&response).unwrap_or_default(),
                duration: Duration::from_millis(1),
                ..Default::default()
            }),
            Some(FakeOutcome::Raw {
                stdout,
                stderr,
                exit_code,
            }) => Ok(PluginRunOutput {
                exit_code,
                stdout,
                stderr,
                duration: Duration::from_millis(1),
                ..Default::default()
            }),
            Some(FakeOutcome::TimeOut) => Ok(PluginRunOutput {
                exit_code: None,
                timed_out: true,
                duration: invocation.timeout,
                ..Default::default()
            }),
            Some(FakeOutcome::SpawnError) | None => Err(RunnerError::Spawn {
                binary: invocation.binary,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "unscripted invocation"),
            }),
        }
    }
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
