// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Interactive PTY probes: run a CLI, optionally feed it input lines, and
//! capture cleaned output. Used for commands that only answer on a TTY
//! (e.g. the Codex `/status` query).

use std::collections::HashMap;
use std::time::Duration;

use regex::RegexBuilder;
use tokio::io::unix::AsyncFd;
use tokio::time::Instant;

use super::{read_chunk, terminate, MasterFd, PtyChild, READ_CHUNK};
use crate::ansi::strip_ansi;

/// Poll quantum for "no more data" detection.
const POLL_QUANTUM: Duration = Duration::from_millis(500);
/// Gap between written input lines so TUIs keep up.
const INTER_LINE_GAP: Duration = Duration::from_millis(300);

/// Options for [`run_interactive`].
pub struct ProbeOptions {
    /// Regex (case-insensitive) to wait for before sending input. When
    /// `None`, waits `settle` for initial output instead.
    pub ready_pattern: Option<String>,
    /// Settle window for initial output when no ready pattern is given.
    pub settle: Duration,
    /// Hard deadline for the whole interaction.
    pub timeout: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self { ready_pattern: None, settle: Duration::from_secs(1), timeout: Duration::from_secs(20) }
    }
}

/// Run a command in a PTY and capture all output until it goes quiet.
///
/// Returns the ANSI-stripped, trimmed output, or `None` on failure.
pub async fn run_command(command: &[String], timeout: Duration) -> Option<String> {
    let child = match PtyChild::spawn(command, None, &HashMap::new()) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(cmd = ?command, err = %e, "pty probe spawn failed");
            return None;
        }
    };

    let deadline = Instant::now() + timeout;
    let mut collected = Vec::new();
    read_until_quiet(&child.master, &mut collected, deadline).await;

    terminate(child.pid, child.pgid).await;
    cleaned(&collected)
}

/// Start an interactive session, send input lines once ready, capture the
/// resulting output.
pub async fn run_interactive(
    command: &[String],
    input_lines: &[&str],
    opts: ProbeOptions,
) -> Option<String> {
    let child = match PtyChild::spawn(command, None, &HashMap::new()) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(cmd = ?command, err = %e, "pty probe spawn failed");
            return None;
        }
    };

    let deadline = Instant::now() + opts.timeout;
    let mut collected = Vec::new();

    match opts.ready_pattern.as_deref() {
        Some(pattern) => {
            let ready = RegexBuilder::new(pattern).case_insensitive(true).build().ok()?;
            let mut buf = vec![0u8; READ_CHUNK];
            while Instant::now() < deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let window = remaining.min(Duration::from_secs(1));
                match tokio::time::timeout(window, read_chunk(&child.master, &mut buf)).await {
                    Ok(Ok(0)) | Ok(Err(_)) => break,
                    Ok(Ok(n)) => {
                        collected.extend_from_slice(&buf[..n]);
                        let text = strip_ansi(&String::from_utf8_lossy(&collected));
                        if ready.is_match(&text) {
                            break;
                        }
                    }
                    // Timed out waiting for the ready pattern: send anyway.
                    Err(_) => {}
                }
            }
        }
        None => {
            let settle_deadline = Instant::now() + opts.settle.min(opts.timeout);
            read_until_quiet(&child.master, &mut collected, settle_deadline).await;
        }
    }

    for line in input_lines {
        let data = format!("{line}\n");
        if super::write_all(&child.master, data.as_bytes()).await.is_err() {
            break;
        }
        tokio::time::sleep(INTER_LINE_GAP).await;
    }

    let drain_deadline = deadline.max(Instant::now() + POLL_QUANTUM);
    read_until_quiet(&child.master, &mut collected, drain_deadline).await;

    terminate(child.pid, child.pgid).await;
    cleaned(&collected)
}

/// Read until no data arrives within one poll quantum (once something has
/// been collected) or the deadline passes. EOF and EIO end the read.
async fn read_until_quiet(
    master: &AsyncFd<MasterFd>,
    collected: &mut Vec<u8>,
    deadline: Instant,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let window = deadline.saturating_duration_since(now).min(POLL_QUANTUM);
        match tokio::time::timeout(window, read_chunk(master, &mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => break,
            Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
            Err(_) => {
                if !collected.is_empty() {
                    break;
                }
            }
        }
    }
}

fn cleaned(collected: &[u8]) -> Option<String> {
    if collected.is_empty() {
        return None;
    }
    let text = strip_ansi(&String::from_utf8_lossy(collected));
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

#[cfg(test)]
#[path = "probe_tests.rs"]
mod tests;
