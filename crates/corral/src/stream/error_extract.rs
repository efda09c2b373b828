// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Best-effort extraction of human-readable messages from proxy error
//! bodies.
//!
//! The local proxy sometimes embeds gzip-compressed upstream error bodies
//! inside its own JSON error response; when those bytes have been through a
//! lossy UTF-8 encode they are irrecoverable garbage. This module detects
//! the cases and falls back to structured fields or the HTTP status.

use std::io::Read;

use flate2::read::GzDecoder;
use serde_json::Value;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const SNIPPET_CHARS: usize = 200;

/// Extract a human-readable error message from a raw error response body.
pub fn extract_proxy_error(raw: &[u8], status: u16) -> String {
    // Case 1: entire body is gzip-compressed.
    if raw.len() >= 2 && raw[..2] == GZIP_MAGIC {
        let mut decompressed = Vec::new();
        if GzDecoder::new(raw).read_to_end(&mut decompressed).is_ok() {
            if let Ok(err) = serde_json::from_slice::<Value>(&decompressed) {
                if let Some(message) = err["error"]["message"].as_str() {
                    return message.to_owned();
                }
            }
            return snippet(&String::from_utf8_lossy(&decompressed));
        }
        return format!("HTTP {status} (compressed error, unable to decode)");
    }

    // Case 2: JSON body, possibly with lossy re-encoding.
    let parsed: Option<Value> = serde_json::from_slice(raw)
        .ok()
        .or_else(|| serde_json::from_str(&String::from_utf8_lossy(raw)).ok());

    if let Some(Value::Object(err)) = parsed {
        let error_obj = err.get("error").and_then(Value::as_object);
        let message =
            error_obj.and_then(|e| e.get("message")).and_then(Value::as_str).unwrap_or("");
        let error_type =
            error_obj.and_then(|e| e.get("type")).and_then(Value::as_str).unwrap_or("");

        if !message.is_empty() && is_readable(message) {
            return message.to_owned();
        }
        if !error_type.is_empty() {
            return format!("{error_type} (HTTP {status})");
        }
        return format!("HTTP {status}");
    }

    // Case 3: plain-text body.
    let body = String::from_utf8_lossy(raw);
    if !body.trim().is_empty() && is_readable(&body) {
        return snippet(&body);
    }

    format!("HTTP {status}")
}

/// Heuristic for "looks like human-readable text": fewer than 10% of the
/// first 100 chars are U+FFFD or control characters (TAB/CR/LF excluded).
pub fn is_readable(text: &str) -> bool {
    let sample: Vec<char> = text.chars().take(100).collect();
    if sample.is_empty() {
        return false;
    }
    let bad = sample
        .iter()
        .filter(|&&c| c == '\u{fffd}' || ((c as u32) < 32 && !matches!(c, '\n' | '\r' | '\t')))
        .count();
    (bad as f64) / (sample.len() as f64) < 0.1
}

fn snippet(text: &str) -> String {
    text.chars().take(SNIPPET_CHARS).collect()
}

#[cfg(test)]
#[path = "error_extract_tests.rs"]
mod tests;
