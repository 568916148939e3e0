// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ductile-adapters: Subprocess plumbing between the core and plugins.

mod fake;
mod process;

pub use fake::{FakeOutcome, FakePluginRunner};
pub use process::{
    PluginInvocation, PluginRunOutput, PluginRunner, ProcessPluginRunner, RunnerError,
};
