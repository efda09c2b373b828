// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Streaming gateway: one interface over the local OpenAI-compatible
//! proxy, the direct provider API, and CLI subprocesses.
//!
//! Route resolution priority:
//! 1. an explicitly configured proxy base URL,
//! 2. an auto-detected local proxy (required when account routing via the
//!    `X-Account-Email` header is requested),
//! 3. Claude only: a direct API key from the environment,
//! 4. OpenCode always: its own CLI,
//! 5. Claude only: the CLI subprocess in NDJSON streaming mode.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::backend::BackendKind;

pub mod cli;
pub mod direct;
pub mod error_extract;
pub mod proxy;

pub use error_extract::{extract_proxy_error, is_readable};
pub use proxy::{DeltaParser, ProxyClient, DEFAULT_LOCAL_PROXY};

/// One role-tagged message of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self { role: role.to_owned(), content: content.into() }
    }
}

/// Typed streaming event for the chat path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatDelta {
    ContentDelta {
        text: String,
    },
    /// A fully assembled tool call (fragments are accumulated per index
    /// until the finish signal).
    ToolCall {
        id: Option<String>,
        function_name: Option<String>,
        arguments_json: Option<String>,
    },
    Finish {
        reason: String,
    },
    Error {
        message: String,
    },
}

/// Where a stream request was routed.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRoute {
    Proxy { base_url: String, api_key: Option<String> },
    DirectApi { api_key: String },
    OpencodeCli,
    ClaudeCli,
    Unavailable { message: String },
}

/// Last-resort model ids per backend when the caller gives no override.
pub fn default_model(backend: BackendKind) -> &'static str {
    match backend {
        BackendKind::Claude => "claude-sonnet-4-20250514",
        BackendKind::Codex => "gpt-5.3-codex",
        BackendKind::Gemini => "gemini-3-pro-preview",
        BackendKind::Opencode => "opencode/glm-4.7-free",
    }
}

/// Unified streaming entry point.
pub struct StreamingGateway {
    proxy_base: Option<String>,
    proxy_key: Option<String>,
}

impl StreamingGateway {
    pub fn new(proxy_base: Option<String>, proxy_key: Option<String>) -> Self {
        Self { proxy_base, proxy_key }
    }

    /// Resolve which transport serves a request for `backend`.
    pub async fn resolve_route(
        &self,
        backend: BackendKind,
        account_email: Option<&str>,
    ) -> StreamRoute {
        // OpenCode models only route through the OpenCode CLI; the proxy
        // does not understand its provider/model ids.
        if backend == BackendKind::Opencode {
            return StreamRoute::OpencodeCli;
        }

        if let Some(base) = &self.proxy_base {
            return StreamRoute::Proxy {
                base_url: base.clone(),
                api_key: self.proxy_key.clone(),
            };
        }

        // Auto-detect a local proxy. Checked before the direct API key:
        // account routing via X-Account-Email only works through the proxy.
        let probe = ProxyClient::new(DEFAULT_LOCAL_PROXY.to_owned(), None);
        if probe.health_probe().await {
            tracing::info!(base = DEFAULT_LOCAL_PROXY, "auto-detected local proxy");
            return StreamRoute::Proxy {
                base_url: DEFAULT_LOCAL_PROXY.to_owned(),
                api_key: None,
            };
        }

        if backend != BackendKind::Claude {
            return StreamRoute::Unavailable {
                message: format!(
                    "local proxy not running; {backend} streaming requires the proxy"
                ),
            };
        }

        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            if !key.trim().is_empty() {
                if account_email.is_some() {
                    tracing::warn!(
                        "account_email requested but no proxy available; \
                         falling back to direct API, account selection ignored"
                    );
                }
                return StreamRoute::DirectApi { api_key: key.trim().to_owned() };
            }
        }

        StreamRoute::ClaudeCli
    }

    /// Stream plain text chunks for a conversation.
    pub async fn stream_text(
        &self,
        messages: Vec<ChatMessage>,
        backend: BackendKind,
        model: Option<String>,
        account_email: Option<String>,
    ) -> mpsc::Receiver<String> {
        let model = model.unwrap_or_else(|| default_model(backend).to_owned());
        let route = self.resolve_route(backend, account_email.as_deref()).await;
        tracing::info!(backend = %backend, model = %model, route = route_name(&route), "streaming text");

        match route {
            StreamRoute::Proxy { base_url, api_key } => {
                ProxyClient::new(base_url, api_key).stream_text(messages, model, account_email)
            }
            StreamRoute::DirectApi { api_key } => {
                direct::stream_anthropic_text(messages, model, api_key)
            }
            StreamRoute::OpencodeCli => cli::stream_opencode(messages, model),
            StreamRoute::ClaudeCli => cli::stream_claude(messages),
            StreamRoute::Unavailable { message } => {
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.try_send(format!("\n\n[Error: {message}]"));
                rx
            }
        }
    }

    /// Stream typed chat deltas (content, assembled tool calls, finish).
    pub async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        backend: BackendKind,
        model: Option<String>,
        account_email: Option<String>,
    ) -> mpsc::Receiver<ChatDelta> {
        let model = model.unwrap_or_else(|| default_model(backend).to_owned());
        let route = self.resolve_route(backend, account_email.as_deref()).await;
        tracing::info!(backend = %backend, model = %model, route = route_name(&route), "streaming chat");

        match route {
            StreamRoute::Proxy { base_url, api_key } => {
                ProxyClient::new(base_url, api_key).stream_chat(messages, model, account_email)
            }
            StreamRoute::DirectApi { api_key } => {
                direct::stream_anthropic_chat(messages, model, api_key)
            }
            StreamRoute::Unavailable { message } => one_shot_error(message),
            StreamRoute::OpencodeCli | StreamRoute::ClaudeCli => one_shot_error(
                "typed chat streaming requires the proxy or a direct API key".to_owned(),
            ),
        }
    }
}

fn one_shot_error(message: String) -> mpsc::Receiver<ChatDelta> {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(ChatDelta::Error { message });
    rx
}

fn route_name(route: &StreamRoute) -> &'static str {
    match route {
        StreamRoute::Proxy { .. } => "proxy",
        StreamRoute::DirectApi { .. } => "direct_api",
        StreamRoute::OpencodeCli => "opencode_cli",
        StreamRoute::ClaudeCli => "claude_cli",
        StreamRoute::Unavailable { .. } => "unavailable",
    }
}

/// Flatten a role-tagged conversation into a single prompt for CLI
/// backends that take one text argument.
pub fn flatten_prompt(messages: &[ChatMessage], label_user: bool) -> String {
    let mut parts = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role.as_str() {
            "system" => parts.push(format!("System: {}", message.content)),
            "assistant" => parts.push(format!("Assistant: {}", message.content)),
            _ if label_user => parts.push(format!("User: {}", message.content)),
            _ => parts.push(message.content.clone()),
        }
    }
    parts.join("\n\n")
}

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;
