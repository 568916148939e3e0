// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Plugin subprocess execution.
//!
//! One invocation: spawn the entrypoint as its own process group, write the
//! request envelope to fd 0 and close it, capture fd 1 and fd 2 under their
//! caps, and wait for exit under the command deadline. On deadline the
//! whole group gets SIGTERM, then SIGKILL after the grace window, so plugin
//! descendants cannot linger.

use async_trait::async_trait;
use ductile_core::limits::{MAX_STDERR_BYTES, MAX_STDOUT_BYTES};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("plugin I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to run a plugin once.
#[derive(Debug, Clone)]
pub struct PluginInvocation {
    pub binary: PathBuf,
    /// Serialized request envelope, delivered on fd 0.
    pub request: Vec<u8>,
    pub timeout: Duration,
    /// SIGTERM → SIGKILL grace window.
    pub term_grace: Duration,
}

/// Raw capture of one plugin run.
#[derive(Debug, Clone, Default)]
pub struct PluginRunOutput {
    /// Exit code; `None` when killed by signal (including our escalation).
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr: Vec<u8>,
    pub stderr_truncated: bool,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Runs one plugin invocation to completion.
#[async_trait]
pub trait PluginRunner: Send + Sync + 'static {
    async fn run(&self, invocation: PluginInvocation) -> Result<PluginRunOutput, RunnerError>;
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessPluginRunner;

#[async_trait]
impl PluginRunner for ProcessPluginRunner {
    async fn run(&self, invocation: PluginInvocation) -> Result<PluginRunOutput, RunnerError> {
        let start = Instant::now();

        let mut child = Command::new(&invocation.binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                binary: invocation.binary.clone(),
                source,
            })?;

        let pid = child.id();
        debug!(binary = %invocation.binary.display(), pid, "plugin spawned");

        // Hand over the request and close fd 0. A plugin that exits without
        // reading produces a broken pipe, which is its prerogative.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&invocation.request).await {
                debug!(error = %e, "plugin closed stdin early");
            }
        }

        // Capture both pipes concurrently with the wait: a plugin that
        // fills a pipe must never deadlock against us.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task =
            tokio::spawn(async move { read_capped(stdout_pipe, MAX_STDOUT_BYTES).await });
        let stderr_task =
            tokio::spawn(async move { read_capped(stderr_pipe, MAX_STDERR_BYTES).await });

        let mut timed_out = false;
        let exit_status = match tokio::time::timeout(invocation.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                timed_out = true;
                escalate(&mut child, pid, invocation.term_grace).await?
            }
        };

        let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
        let (stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();

        Ok(PluginRunOutput {
            exit_code: exit_status.code(),
            stdout,
            stdout_truncated,
            stderr,
            stderr_truncated,
            timed_out,
            duration: start.elapsed(),
        })
    }
}

/// SIGTERM the process group, wait out the grace window, then SIGKILL.
async fn escalate(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
) -> Result<std::process::ExitStatus, std::io::Error> {
    signal_group(child, pid, Signal::SIGTERM);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(pid, grace_secs = grace.as_secs(), "plugin ignored SIGTERM, killing group");
            signal_group(child, pid, Signal::SIGKILL);
            child.wait().await
        }
    }
}

/// Signal the whole group; fall back to the direct child if the group is
/// already gone.
fn signal_group(child: &mut Child, pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else {
        return;
    };
    if killpg(Pid::from_raw(pid as i32), signal).is_err() {
        let _ = child.start_kill();
    }
}

/// Read a pipe to EOF, keeping at most `cap` bytes and draining the rest so
/// the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(pipe: Option<R>, cap: usize) -> (Vec<u8>, bool) {
    let Some(mut pipe) = pipe else {
        return (Vec::new(), false);
    };

    let mut captured = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = cap.saturating_sub(captured.len());
                if room == 0 {
                    truncated = true;
                    continue;
                }
                let take = room.min(n);
                captured.extend_from_slice(&buf[..take]);
                if take < n {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (captured, truncated)
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
