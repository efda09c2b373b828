// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ANSI escape sequence stripping for PTY output.

use std::sync::LazyLock;

use regex::Regex;

// CSI sequences (ESC [ ... final byte), OSC sequences (ESC ] ... BEL), and
// charset designators (ESC ( / ESC ) followed by one byte).
#[allow(clippy::unwrap_used)] // pattern is a compile-time constant
static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[@-~]|\x1b\][^\x07]*\x07|\x1b[()][A-B0-2]").unwrap()
});

/// Remove ANSI escape sequences from a line of terminal output.
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

#[cfg(test)]
#[path = "ansi_tests.rs"]
mod tests;
