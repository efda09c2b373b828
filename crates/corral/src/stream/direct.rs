// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Direct Anthropic API streaming for the Claude backend.
//!
//! Used when no proxy is available but an API key is set in the
//! environment. No account routing is possible on this path.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::error_extract::extract_proxy_error;
use super::{ChatDelta, ChatMessage};

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const STREAM_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_TOKENS: u32 = 4096;

/// Stream typed chat deltas straight from the Anthropic messages API.
pub fn stream_anthropic_chat(
    messages: Vec<ChatMessage>,
    model: String,
    api_key: String,
) -> mpsc::Receiver<ChatDelta> {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        run_stream(messages, model, api_key, tx).await;
    });
    rx
}

/// Stream plain text chunks straight from the Anthropic messages API.
pub fn stream_anthropic_text(
    messages: Vec<ChatMessage>,
    model: String,
    api_key: String,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(256);
    let mut deltas = stream_anthropic_chat(messages, model, api_key);
    tokio::spawn(async move {
        while let Some(delta) = deltas.recv().await {
            let text = match delta {
                ChatDelta::ContentDelta { text } => text,
                ChatDelta::Error { message } => format!("\n\n[Streaming error: {message}]"),
                ChatDelta::ToolCall { .. } | ChatDelta::Finish { .. } => continue,
            };
            if tx.send(text).await.is_err() {
                break;
            }
        }
    });
    rx
}

async fn run_stream(
    messages: Vec<ChatMessage>,
    model: String,
    api_key: String,
    tx: mpsc::Sender<ChatDelta>,
) {
    // The messages API takes the system prompt as a separate field.
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_str())
        .collect();
    let turns: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != "system")
        .map(|m| json!({ "role": m.role, "content": m.content }))
        .collect();

    let mut payload = json!({
        "model": model,
        "max_tokens": MAX_TOKENS,
        "messages": turns,
        "stream": true,
    });
    if !system.is_empty() {
        payload["system"] = Value::String(system.join("\n\n"));
    }

    let client = reqwest::Client::builder()
        .timeout(STREAM_TIMEOUT)
        .build()
        .unwrap_or_default();

    let response = match client
        .post(MESSAGES_URL)
        .header("x-api-key", &api_key)
        .header("anthropic-version", API_VERSION)
        .header("Accept", "text/event-stream")
        .json(&payload)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(err = %e, "direct API request failed");
            let _ = tx.send(ChatDelta::Error { message: e.to_string() }).await;
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let raw = response.bytes().await.unwrap_or_default();
        let detail = extract_proxy_error(&raw, status);
        tracing::error!(status, detail = %detail, "direct API error response");
        let _ = tx.send(ChatDelta::Error { message: detail }).await;
        return;
    }

    let mut pending: Vec<u8> = Vec::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(ChatDelta::Error { message: e.to_string() }).await;
                return;
            }
        };
        pending.extend_from_slice(&chunk);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim_end_matches('\r');

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            let Ok(event) = serde_json::from_str::<Value>(data) else {
                continue;
            };

            match event["type"].as_str() {
                Some("content_block_delta") => {
                    if event["delta"]["type"].as_str() == Some("text_delta") {
                        if let Some(text) = event["delta"]["text"].as_str() {
                            let delta = ChatDelta::ContentDelta { text: text.to_owned() };
                            if tx.send(delta).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Some("message_delta") => {
                    if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                        let _ =
                            tx.send(ChatDelta::Finish { reason: reason.to_owned() }).await;
                    }
                }
                Some("error") => {
                    let message = event["error"]["message"]
                        .as_str()
                        .unwrap_or("unknown stream error")
                        .to_owned();
                    let _ = tx.send(ChatDelta::Error { message }).await;
                    return;
                }
                _ => {}
            }
        }
    }
}
