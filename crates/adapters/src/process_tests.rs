// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn invocation(binary: PathBuf) -> PluginInvocation {
    PluginInvocation {
        binary,
        request: br#"{"protocol":2}"#.to_vec(),
        timeout: Duration::from_secs(5),
        term_grace: Duration::from_millis(200),
    }
}

#[tokio::test]
async fn captures_stdout_and_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "ok.sh", r#"echo '{"status":"ok"}'"#);

    let output = ProcessPluginRunner.run(invocation(script)).await.unwrap();
    assert_eq!(output.exit_code, Some(0));
    assert!(!output.timed_out);
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        r#"{"status":"ok"}"#
    );
}

#[tokio::test]
async fn request_arrives_on_stdin() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "cat.sh", "cat");

    let output = ProcessPluginRunner.run(invocation(script)).await.unwrap();
    assert_eq!(output.stdout, br#"{"protocol":2}"#);
}

#[tokio::test]
async fn stderr_is_captured_separately() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "noisy.sh", "echo out; echo diagnostics >&2; exit 3");

    let output = ProcessPluginRunner.run(invocation(script)).await.unwrap();
    assert_eq!(output.exit_code, Some(3));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "out");
    assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "diagnostics");
}

#[tokio::test]
async fn deadline_escalates_to_kill() {
    let dir = tempfile::tempdir().unwrap();
    // Ignore TERM and keep respawning work so only KILL can end the group.
    let script = write_script(
        dir.path(),
        "stubborn.sh",
        "trap '' TERM\nwhile :; do sleep 0.1 || :; done",
    );

    let start = std::time::Instant::now();
    let output = ProcessPluginRunner
        .run(PluginInvocation {
            binary: script,
            request: Vec::new(),
            timeout: Duration::from_millis(200),
            term_grace: Duration::from_millis(200),
        })
        .await
        .unwrap();

    assert!(output.timed_out);
    assert_eq!(output.exit_code, None, "killed by signal has no exit code");
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn graceful_term_is_honored_within_grace() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "polite.sh", "sleep 30");

    let output = ProcessPluginRunner
        .run(PluginInvocation {
            binary: script,
            request: Vec::new(),
            timeout: Duration::from_millis(200),
            term_grace: Duration::from_secs(5),
        })
        .await
        .unwrap();
    assert!(output.timed_out);
}

#[tokio::test]
async fn oversized_stdout_is_truncated_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    // Emit ~2x the stderr cap on stderr (cheaper than 10 MiB on stdout).
    let script = write_script(
        dir.path(),
        "chatty.sh",
        "head -c 2097152 /dev/zero | tr '\\0' 'x' >&2",
    );

    let output = ProcessPluginRunner.run(invocation(script)).await.unwrap();
    assert!(output.stderr_truncated);
    assert_eq!(output.stderr.len(), ductile_core::limits::MAX_STDERR_BYTES);
    assert_eq!(output.exit_code, Some(0));
}

#[tokio::test]
async fn missing_binary_is_a_spawn_error() {
    let result = ProcessPluginRunner
        .run(invocation(PathBuf::from("/nonexistent/plugin")))
        .await;
    assert!(matches!(result, Err(RunnerError::Spawn { .. })));
}

#[tokio::test]
async fn plugin_ignoring_stdin_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "deaf.sh", "exec 0<&-; echo done");

    let output = ProcessPluginRunner.run(invocation(script)).await.unwrap();
    assert_eq!(output.exit_code, Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "done");
}
