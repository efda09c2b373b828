// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-provider usage clients — authoritative rate-limit window data.
//!
//! Response parsing is separated from transport so every provider shape is
//! unit-testable without network access.

use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::backend::BackendKind;
use crate::credential::CredentialResolver;
use crate::pty::probe::{self, ProbeOptions};
use crate::store::AccountRow;

const CLAUDE_USAGE_URL: &str = "https://api.anthropic.com/api/oauth/usage";
const CODEX_USAGE_URL: &str = "https://chatgpt.com/backend-api/wham/usage";
const GEMINI_QUOTA_URL: &str =
    "https://cloudcode-pa.googleapis.com/v1internal:retrieveUserQuota";

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// One provider-reported rate-limit window.
///
/// `tokens_limit == 0` marks percentage-only providers: only `percentage`
/// carries signal, and downstream consumption rates are in %/hr.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageWindow {
    pub window_type: String,
    pub percentage: f64,
    pub resets_at: Option<DateTime<Utc>>,
    pub tokens_used: u64,
    pub tokens_limit: u64,
}

/// Fetches real rate-limit utilization from provider APIs.
pub struct UsageClient {
    client: reqwest::Client,
    resolver: CredentialResolver,
}

impl Default for UsageClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, resolver: CredentialResolver::new() }
    }

    pub fn resolver(&self) -> &CredentialResolver {
        &self.resolver
    }

    /// Fetch the current windows for an account. Failures are logged and
    /// return empty — the monitor treats that tick as no-data.
    pub async fn fetch_usage(&self, account: &AccountRow) -> Vec<UsageWindow> {
        match account.backend {
            BackendKind::Claude => self.fetch_claude(account).await,
            BackendKind::Codex => self.fetch_codex(account).await,
            BackendKind::Gemini => self.fetch_gemini(account).await,
            BackendKind::Opencode => {
                tracing::debug!(account_id = account.id, "no provider usage API for opencode");
                Vec::new()
            }
        }
    }

    async fn fetch_claude(&self, account: &AccountRow) -> Vec<UsageWindow> {
        let Some(token) = self.resolver.claude_token(account) else {
            tracing::warn!(
                account_id = account.id,
                "claude: no OAuth token; run `claude login` or set a config path"
            );
            return Vec::new();
        };

        let resp = self
            .client
            .get(CLAUDE_USAGE_URL)
            .bearer_auth(&token)
            .header("anthropic-beta", "oauth-2025-04-20")
            .send()
            .await;

        match json_body(resp, account.id, "claude").await {
            Some(data) => parse_claude_usage(&data),
            None => Vec::new(),
        }
    }

    async fn fetch_codex(&self, account: &AccountRow) -> Vec<UsageWindow> {
        // PTY /status only ever reads the default ~/.codex config, so it is
        // wrong for accounts with a custom config path.
        let default_dir = std::env::var_os("HOME")
            .map(|h| std::path::PathBuf::from(h).join(".codex"));
        let is_default = match account.config_path.as_deref() {
            None => true,
            Some(p) => default_dir
                .as_deref()
                .is_some_and(|d| d == std::path::Path::new(p)),
        };
        if is_default {
            if let Some(windows) = self.fetch_codex_via_pty().await {
                return windows;
            }
        }

        let (token, chatgpt_account_id) = self.resolver.codex_token(account);
        let Some(token) = token else {
            tracing::warn!(
                account_id = account.id,
                "codex: no OAuth token; run `codex login` or set a config path"
            );
            return Vec::new();
        };

        let mut req = self.client.get(CODEX_USAGE_URL).bearer_auth(&token);
        if let Some(id) = chatgpt_account_id {
            req = req.header("ChatGPT-Account-Id", id);
        }

        match json_body(req.send().await, account.id, "codex").await {
            Some(data) => parse_codex_usage(&data, account.plan.as_deref()),
            None => Vec::new(),
        }
    }

    async fn fetch_codex_via_pty(&self) -> Option<Vec<UsageWindow>> {
        let output = probe::run_interactive(
            &["codex".to_owned()],
            &["/status"],
            ProbeOptions {
                ready_pattern: Some("(>|codex|prompt)".to_owned()),
                settle: Duration::from_secs(2),
                timeout: Duration::from_secs(15),
            },
        )
        .await?;

        let windows = parse_codex_status_output(&output);
        (!windows.is_empty()).then_some(windows)
    }

    async fn fetch_gemini(&self, account: &AccountRow) -> Vec<UsageWindow> {
        let Some(token) = self.resolver.gemini_token(account).await else {
            tracing::warn!(
                account_id = account.id,
                "gemini: no OAuth token; run `gemini auth` or set a config path"
            );
            return Vec::new();
        };

        let resp = self
            .client
            .post(GEMINI_QUOTA_URL)
            .bearer_auth(&token)
            .json(&serde_json::json!({ "project": "cloud-code-assist" }))
            .send()
            .await;

        match json_body(resp, account.id, "gemini").await {
            Some(data) => parse_gemini_quota(&data),
            None => Vec::new(),
        }
    }
}

async fn json_body(
    resp: Result<reqwest::Response, reqwest::Error>,
    account_id: i64,
    provider: &str,
) -> Option<Value> {
    match resp {
        Ok(r) if r.status().is_success() => r.json().await.ok(),
        Ok(r) => {
            tracing::warn!(account_id, provider, status = %r.status(), "usage fetch rejected");
            None
        }
        Err(e) => {
            tracing::debug!(account_id, provider, err = %e, "usage fetch failed");
            None
        }
    }
}

/// Claude OAuth usage: fixed window keys with 0-100 `utilization` taken
/// verbatim; token counts are not reported (percentage-only mode).
pub fn parse_claude_usage(data: &Value) -> Vec<UsageWindow> {
    let mut windows = Vec::new();
    for key in ["five_hour", "seven_day", "seven_day_sonnet"] {
        let Some(window) = data.get(key).filter(|w| !w.is_null()) else {
            continue;
        };
        let utilization = window["utilization"].as_f64().unwrap_or(0.0);
        windows.push(UsageWindow {
            window_type: key.to_owned(),
            percentage: round1(utilization),
            resets_at: window["resets_at"].as_str().and_then(parse_rfc3339),
            tokens_used: 0,
            tokens_limit: 0,
        });
    }
    windows
}

/// Codex wham/usage: primary/secondary windows from the base rate limit,
/// plus per-model buckets from `additional_rate_limits` — the latter only
/// when the account's recorded plan matches the server's `plan_type`.
pub fn parse_codex_usage(data: &Value, account_plan: Option<&str>) -> Vec<UsageWindow> {
    let mut windows = Vec::new();

    let additional = data["additional_rate_limits"].as_array();

    // Base model name, e.g. "GPT-5.3-Codex-Spark" → "GPT-5.3-Codex".
    let base_model = additional
        .and_then(|a| a.first())
        .and_then(|e| e["limit_name"].as_str())
        .and_then(|name| name.rsplit_once('-').map(|(base, _)| base.to_owned()))
        .unwrap_or_else(|| "Codex".to_owned());

    if let Some(rate_limit) = data.get("rate_limit") {
        extract_codex_windows(rate_limit, &base_model, &mut windows);
    }

    let account_plan = account_plan.unwrap_or("").to_lowercase();
    let api_plan = data["plan_type"].as_str().unwrap_or("").to_lowercase();
    if account_plan.is_empty() || account_plan == api_plan {
        for extra in additional.map(Vec::as_slice).unwrap_or(&[]) {
            let limit_name = extra["limit_name"].as_str().unwrap_or("");
            if let Some(rate_limit) = extra.get("rate_limit").filter(|r| !r.is_null()) {
                extract_codex_windows(rate_limit, limit_name, &mut windows);
            }
        }
    }

    windows
}

fn extract_codex_windows(rate_limit: &Value, prefix: &str, windows: &mut Vec<UsageWindow>) {
    for key in ["primary_window", "secondary_window"] {
        let Some(window) = rate_limit.get(key).filter(|w| !w.is_null()) else {
            continue;
        };
        let used_pct = window["used_percent"].as_f64().unwrap_or(0.0);
        let resets_at = window["reset_at"]
            .as_f64()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0));
        let window_type =
            if prefix.is_empty() { key.to_owned() } else { format!("{prefix}_{key}") };
        windows.push(UsageWindow {
            window_type,
            percentage: round1(used_pct),
            resets_at,
            tokens_used: 0,
            tokens_limit: 0,
        });
    }
}

/// Parse labeled percentages (and an optional reset timestamp) out of the
/// Codex interactive `/status` output.
pub fn parse_codex_status_output(text: &str) -> Vec<UsageWindow> {
    let pct_re = build_ci(r"(\w[\w\s]*?)(?:usage|window|limit)?[:\s]+(\d+(?:\.\d+)?)\s*%");
    let reset_re =
        build_ci(r"reset[s]?\s+(?:at\s+)?(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(?::\d{2})?Z?)");

    let mut windows = Vec::new();
    if let Some(pct_re) = pct_re {
        for cap in pct_re.captures_iter(text) {
            let label = cap
                .get(1)
                .map(|m| m.as_str().trim().to_lowercase().replace(' ', "_"))
                .unwrap_or_default();
            let pct: f64 = cap.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0.0);
            let window_type =
                if label.is_empty() { "primary_window".to_owned() } else { label };
            windows.push(UsageWindow {
                window_type,
                percentage: round1(pct),
                resets_at: None,
                tokens_used: 0,
                tokens_limit: 0,
            });
        }
    }

    if let Some(reset_re) = reset_re {
        if let Some(cap) = reset_re.captures(text) {
            let mut reset = cap.get(1).map(|m| m.as_str().to_owned()).unwrap_or_default();
            if !reset.ends_with('Z') {
                reset.push('Z');
            }
            let normalized = reset.replace(' ', "T");
            let parsed = parse_rfc3339(&normalized).or_else(|| {
                // `/status` output may omit seconds.
                chrono::NaiveDateTime::parse_from_str(
                    normalized.trim_end_matches('Z'),
                    "%Y-%m-%dT%H:%M",
                )
                .ok()
                .map(|n| n.and_utc())
            });
            for window in &mut windows {
                if window.resets_at.is_none() {
                    window.resets_at = parsed;
                }
            }
        }
    }

    windows
}

/// Gemini quota buckets: skip Vertex duplicates, deprecated models, and
/// older major-version families; utilization is `(1 − remainingFraction)`.
pub fn parse_gemini_quota(data: &Value) -> Vec<UsageWindow> {
    let empty = Vec::new();
    let buckets = data["buckets"].as_array().unwrap_or(&empty);
    let major_re = Regex::new(r"gemini-(\d+)").ok();

    let skip = |model_id: &str| {
        model_id.ends_with("_vertex") || model_id.contains("2.0") || model_id.contains("2.5-flash")
    };
    let major_of = |model_id: &str| -> Option<u32> {
        major_re
            .as_ref()?
            .captures(model_id)?
            .get(1)?
            .as_str()
            .parse()
            .ok()
    };

    let latest_major = buckets
        .iter()
        .filter_map(|b| b["modelId"].as_str())
        .filter(|id| !skip(id))
        .filter_map(major_of)
        .max()
        .unwrap_or(0);

    let mut windows = Vec::new();
    for bucket in buckets {
        let model_id = bucket["modelId"].as_str().unwrap_or("gemini");
        if skip(model_id) {
            continue;
        }
        if let Some(major) = major_of(model_id) {
            if major < latest_major {
                tracing::debug!(model_id, latest_major, "gemini: skipping older model family");
                continue;
            }
        }

        let remaining = bucket["remainingFraction"].as_f64().unwrap_or(1.0);
        let resets_at = bucket["resetTime"]
            .as_str()
            .filter(|t| t.contains('T'))
            .and_then(parse_rfc3339);

        windows.push(UsageWindow {
            window_type: model_id.to_owned(),
            percentage: round1((1.0 - remaining) * 100.0),
            resets_at,
            tokens_used: 0,
            tokens_limit: 0,
        });
    }
    windows
}

fn build_ci(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(pattern).case_insensitive(true).build().ok()
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s.replace("Z", "+00:00"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
