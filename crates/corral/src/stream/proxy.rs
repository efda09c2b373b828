// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Streaming through a local OpenAI-compatible proxy.
//!
//! Uses raw reqwest byte streams rather than an SDK: upstream error bodies
//! may be gzip-encoded and must be decoded by hand (see
//! [`crate::stream::error_extract`]).

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::error_extract::extract_proxy_error;
use super::{ChatDelta, ChatMessage};

/// Conventional local proxy address used for auto-detection.
pub const DEFAULT_LOCAL_PROXY: &str = "http://127.0.0.1:8317/v1";

const STREAM_TIMEOUT: Duration = Duration::from_secs(120);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const DELTA_QUEUE: usize = 256;

#[derive(Debug, Default)]
struct ToolCallBuffer {
    id: Option<String>,
    function_name: Option<String>,
    arguments: String,
}

/// Accumulates OpenAI-style streaming chunks into typed deltas.
///
/// Tool calls arrive as index-keyed fragments whose `arguments` field is
/// partial JSON; fragments are concatenated per index and emitted as one
/// `ToolCall` delta each when `finish_reason` arrives, before the `Finish`
/// delta.
#[derive(Debug, Default)]
pub struct DeltaParser {
    buffers: BTreeMap<u64, ToolCallBuffer>,
}

impl DeltaParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one parsed `data:` chunk, returning deltas in order.
    pub fn process_chunk(&mut self, chunk: &Value) -> Vec<ChatDelta> {
        let mut out = Vec::new();
        let Some(choice) = chunk["choices"].get(0) else {
            return out;
        };
        let delta = &choice["delta"];

        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                out.push(ChatDelta::ContentDelta { text: text.to_owned() });
            }
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0);
                let buffer = self.buffers.entry(index).or_default();
                if let Some(id) = tc["id"].as_str() {
                    buffer.id = Some(id.to_owned());
                }
                if let Some(name) = tc["function"]["name"].as_str() {
                    buffer.function_name = Some(name.to_owned());
                }
                if let Some(arguments) = tc["function"]["arguments"].as_str() {
                    buffer.arguments.push_str(arguments);
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            for (_, buffer) in std::mem::take(&mut self.buffers) {
                out.push(ChatDelta::ToolCall {
                    id: buffer.id,
                    function_name: buffer.function_name,
                    arguments_json: (!buffer.arguments.is_empty()).then_some(buffer.arguments),
                });
            }
            out.push(ChatDelta::Finish { reason: reason.to_owned() });
        }

        out
    }
}

/// Client for one proxy base URL.
pub struct ProxyClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ProxyClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(STREAM_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, base_url: base_url.trim_end_matches('/').to_owned(), api_key }
    }

    fn bearer(&self) -> String {
        self.api_key.clone().unwrap_or_else(|| "not-needed".to_owned())
    }

    /// `GET /models` health probe.
    pub async fn health_probe(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        let result = self
            .client
            .get(&url)
            .bearer_auth(self.bearer())
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %url, err = %e, "proxy health probe failed");
                false
            }
        }
    }

    /// Stream typed chat deltas from `/chat/completions`.
    pub fn stream_chat(
        self,
        messages: Vec<ChatMessage>,
        model: String,
        account_email: Option<String>,
    ) -> mpsc::Receiver<ChatDelta> {
        let (tx, rx) = mpsc::channel(DELTA_QUEUE);
        tokio::spawn(async move {
            self.run_stream(messages, model, account_email, tx).await;
        });
        rx
    }

    /// Stream plain text content; errors arrive as bracketed text chunks.
    pub fn stream_text(
        self,
        messages: Vec<ChatMessage>,
        model: String,
        account_email: Option<String>,
    ) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(DELTA_QUEUE);
        let mut deltas = self.stream_chat(messages, model, account_email);
        tokio::spawn(async move {
            while let Some(delta) = deltas.recv().await {
                let text = match delta {
                    ChatDelta::ContentDelta { text } => text,
                    ChatDelta::Error { message } => format!("\n\n[Proxy error: {message}]"),
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
        &self,
        messages: Vec<ChatMessage>,
        model: String,
        account_email: Option<String>,
        tx: mpsc::Sender<ChatDelta>,
    ) {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = json!({
            "model": model,
            "messages": messages,
            "stream": true,
        });

        let mut request = self
            .client
            .post(&url)
            .bearer_auth(self.bearer())
            .header("Accept", "text/event-stream")
            .json(&payload);
        // Accept-Encoding is left to reqwest: the proxy may send gzip
        // regardless, and the client decompresses negotiated encodings.
        if let Some(email) = &account_email {
            request = request.header("X-Account-Email", email);
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                tracing::error!(url = %url, "proxy request timed out");
                let _ = tx
                    .send(ChatDelta::Error { message: "Proxy request timed out".to_owned() })
                    .await;
                return;
            }
            Err(e) if e.is_connect() => {
                tracing::error!(url = %url, err = %e, "could not connect to proxy");
                let _ = tx
                    .send(ChatDelta::Error {
                        message: format!("Could not connect to proxy at {}", self.base_url),
                    })
                    .await;
                return;
            }
            Err(e) => {
                tracing::error!(url = %url, err = %e, "proxy streaming error");
                let _ = tx.send(ChatDelta::Error { message: e.to_string() }).await;
                return;
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let raw = response.bytes().await.unwrap_or_default();
            let detail = extract_proxy_error(&raw, status);
            tracing::error!(status, detail = %detail, "proxy error response");
            let _ = tx
                .send(ChatDelta::Error { message: format!("Proxy error: {detail}") })
                .await;
            return;
        }

        let mut parser = DeltaParser::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut body = response.bytes_stream();

        'stream: while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::error!(err = %e, "proxy stream read failed");
                    let _ = tx.send(ChatDelta::Error { message: e.to_string() }).await;
                    return;
                }
            };
            pending.extend_from_slice(&chunk);

            for line in take_lines(&mut pending) {
                let Some(data) = parse_data_line(&line) else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'stream;
                }
                let Ok(parsed) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                for delta in parser.process_chunk(&parsed) {
                    if tx.send(delta).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Drain complete lines out of the byte buffer, leaving any partial line.
fn take_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = pending.drain(..=pos).collect();
        let raw = &raw[..raw.len() - 1];
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        lines.push(String::from_utf8_lossy(raw).into_owned());
    }
    lines
}

/// The payload of a `data: ` SSE line; comments and empty lines are `None`.
fn parse_data_line(line: &str) -> Option<&str> {
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    line.strip_prefix("data: ").map(str::trim)
}

#[cfg(test)]
#[path = "proxy_tests.rs"]
mod tests;
