// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! CLI subprocess streaming fallbacks.
//!
//! Claude streams NDJSON events via `--output-format stream-json`;
//! OpenCode prints plain text or JSON lines. Both run under a wall-clock
//! guard that kills the subprocess on expiry.

use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::{flatten_prompt, ChatMessage};

/// Wall-clock guard for CLI streaming subprocesses.
pub const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(120);

const TEXT_QUEUE: usize = 256;

/// Extract the text piece from a Claude `stream-json` NDJSON event.
///
/// Handles both the wrapped form (`stream_event` containing a
/// `content_block_delta`) and a bare `content_block_delta`.
pub fn extract_text_from_event(event: &Value) -> Option<String> {
    let inner = match event["type"].as_str() {
        Some("stream_event") => &event["event"],
        _ => event,
    };
    if inner["type"].as_str() == Some("content_block_delta")
        && inner["delta"]["type"].as_str() == Some("text_delta")
    {
        return inner["delta"]["text"].as_str().map(str::to_owned);
    }
    None
}

/// Stream a conversation through the Claude CLI.
pub fn stream_claude(messages: Vec<ChatMessage>) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(TEXT_QUEUE);
    tokio::spawn(async move {
        let prompt = flatten_prompt(&messages, true);
        let command = vec![
            "claude".to_owned(),
            "-p".to_owned(),
            prompt,
            "--output-format".to_owned(),
            "stream-json".to_owned(),
            "--verbose".to_owned(),
        ];
        run_cli_stream(command, tx, |line| {
            let event: Value = serde_json::from_str(line).ok()?;
            extract_text_from_event(&event)
        })
        .await;
    });
    rx
}

/// Stream a conversation through the OpenCode CLI (native
/// `provider/model` ids are only reachable this way).
pub fn stream_opencode(messages: Vec<ChatMessage>, model: String) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(TEXT_QUEUE);
    tokio::spawn(async move {
        let prompt = flatten_prompt(&messages, false);
        let command = vec![
            "opencode".to_owned(),
            "run".to_owned(),
            prompt,
            "--model".to_owned(),
            model,
        ];
        run_cli_stream(command, tx, |line| {
            let trimmed = line.trim();
            if trimmed.starts_with('{') {
                if let Ok(data) = serde_json::from_str::<Value>(trimmed) {
                    let text = data["output"]
                        .as_str()
                        .or(data["result"].as_str())
                        .or(data["content"].as_str());
                    if let Some(text) = text {
                        return Some(text.to_owned());
                    }
                }
            }
            (!line.is_empty()).then(|| format!("{line}\n"))
        })
        .await;
    });
    rx
}

/// Run a CLI, mapping each stdout line through `extract` and forwarding
/// the results. Kills the subprocess at the wall-clock deadline; reports
/// nonzero exits with a stderr excerpt.
async fn run_cli_stream<F>(command: Vec<String>, tx: mpsc::Sender<String>, extract: F)
where
    F: Fn(&str) -> Option<String>,
{
    let program = &command[0];
    let mut child = match Command::new(program)
        .args(&command[1..])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::error!(program = %program, "CLI not found");
            let _ = tx.send(format!("[Error: {program} CLI not found]")).await;
            return;
        }
        Err(e) => {
            tracing::error!(program = %program, err = %e, "CLI spawn failed");
            let _ = tx.send(format!("[Error: {e}]")).await;
            return;
        }
    };

    let Some(stdout) = child.stdout.take() else {
        let _ = tx.send("[Error: no stdout from CLI]".to_owned()).await;
        return;
    };
    let mut lines = BufReader::new(stdout).lines();
    let deadline = tokio::time::Instant::now() + SUBPROCESS_TIMEOUT;
    let mut timed_out = false;

    loop {
        let next = tokio::time::timeout_at(deadline, lines.next_line()).await;
        match next {
            Ok(Ok(Some(line))) => {
                if let Some(text) = extract(&line) {
                    if tx.send(text).await.is_err() {
                        let _ = child.kill().await;
                        return;
                    }
                }
            }
            Ok(Ok(None)) | Ok(Err(_)) => break,
            Err(_) => {
                timed_out = true;
                let _ = child.kill().await;
                break;
            }
        }
    }

    if timed_out {
        tracing::error!(program = %program, "CLI stream timed out");
        let _ = tx.send("\n\n[Request timed out]".to_owned()).await;
        return;
    }

    match child.wait().await {
        Ok(status) if !status.success() => {
            let mut stderr_text = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                use tokio::io::AsyncReadExt;
                let _ = stderr.read_to_string(&mut stderr_text).await;
            }
            let detail = if stderr_text.trim().is_empty() {
                format!("exit code {}", status.code().unwrap_or(-1))
            } else {
                stderr_text.trim().chars().take(200).collect()
            };
            tracing::error!(program = %program, detail = %detail, "CLI exited with error");
            let _ = tx.send(format!("\n\n[{program} CLI error: {detail}]")).await;
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(program = %program, err = %e, "CLI wait failed");
        }
    }
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
