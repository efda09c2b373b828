// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[tokio::test]
async fn run_command_captures_cleaned_output() {
    let out = run_command(
        &["sh".into(), "-c".into(), "printf '\\033[32mgreen\\033[0m done\\n'".into()],
        Duration::from_secs(10),
    )
    .await;
    let out = out.unwrap_or_default();
    assert!(out.contains("green done"), "output was: {out:?}");
    assert!(!out.contains('\x1b'));
}

#[tokio::test]
async fn run_command_missing_binary_returns_none() {
    let out =
        run_command(&["corral-definitely-not-a-binary".into()], Duration::from_secs(5)).await;
    assert_eq!(out, None);
}

#[tokio::test]
async fn interactive_sends_lines_after_ready() {
    // `cat` echoes PTY input back; the prompt line makes the ready pattern hit.
    let out = run_interactive(
        &["sh".into(), "-c".into(), "echo ready; exec cat".into()],
        &["hello-probe"],
        ProbeOptions {
            ready_pattern: Some("ready".to_owned()),
            settle: Duration::from_millis(200),
            timeout: Duration::from_secs(10),
        },
    )
    .await;
    let out = out.unwrap_or_default();
    assert!(out.contains("hello-probe"), "output was: {out:?}");
}

#[tokio::test]
async fn interactive_settle_mode_without_pattern() {
    let out = run_interactive(
        &["sh".into(), "-c".into(), "exec cat".into()],
        &["settled"],
        ProbeOptions {
            ready_pattern: None,
            settle: Duration::from_millis(200),
            timeout: Duration::from_secs(10),
        },
    )
    .await;
    let out = out.unwrap_or_default();
    assert!(out.contains("settled"), "output was: {out:?}");
}
