// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Provider OAuth credential resolution.
//!
//! File-first, with macOS Keychain fallbacks where the CLIs store their
//! tokens there. Reads are strictly read-only; the out-of-process CLIs own
//! credential creation. The one exception is Gemini token refresh, which
//! this module performs against Google's token endpoint when the stored
//! access token has expired.

use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::backend::BackendKind;
use crate::store::AccountRow;

// Gemini CLI well-known OAuth credentials (public, embedded in the
// open-source CLI).
const GEMINI_CLI_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const GEMINI_CLI_CLIENT_SECRET: &str = "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";

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Resolves OAuth tokens for each provider from local credential stores.
pub struct CredentialResolver {
    client: reqwest::Client,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialResolver {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    /// Read the Claude OAuth token.
    ///
    /// Priority (account-specific first):
    /// 1. Keychain entry with a config-path hash suffix (non-default accounts)
    /// 2. `<config_path>/.credentials.json`
    /// 3. Keychain entry `Claude Code-credentials` (default account)
    /// 4. `~/.claude/.credentials.json`
    pub fn claude_token(&self, account: &AccountRow) -> Option<String> {
        let default_dir = home().map(|h| h.join(".claude"));
        let config_path = account.config_path.as_deref().map(expanduser);
        let is_default =
            config_path.is_none() || config_path.as_deref() == default_dir.as_deref();

        if let (Some(path), false) = (&config_path, is_default) {
            // Non-default account: its own Keychain entry, then its file.
            let suffix = &sha256_hex(path.to_string_lossy().as_bytes())[..8];
            let service = format!("Claude Code-credentials-{suffix}");
            if let Some(token) =
                keychain_json_field(&service, &["claudeAiOauth", "accessToken"])
            {
                return Some(token);
            }
            return read_json_field(&path.join(".credentials.json"), &[
                "claudeAiOauth",
                "accessToken",
            ]);
        }

        if let Some(token) =
            keychain_json_field("Claude Code-credentials", &["claudeAiOauth", "accessToken"])
        {
            return Some(token);
        }

        let mut candidates = Vec::new();
        if let Some(path) = config_path {
            candidates.push(path.join(".credentials.json"));
        }
        if let Some(dir) = default_dir {
            candidates.push(dir.join(".credentials.json"));
        }
        candidates
            .iter()
            .find_map(|p| read_json_field(p, &["claudeAiOauth", "accessToken"]))
    }

    /// Read the Codex OAuth token and ChatGPT account id.
    pub fn codex_token(&self, account: &AccountRow) -> (Option<String>, Option<String>) {
        if let Some(config_path) = account.config_path.as_deref() {
            let auth = expanduser(config_path).join("auth.json");
            if let Some(token) = read_json_field(&auth, &["tokens", "access_token"]) {
                let acct = read_json_field(&auth, &["tokens", "account_id"]);
                return (Some(token), acct);
            }
        }
        let Some(auth) = home().map(|h| h.join(".codex").join("auth.json")) else {
            return (None, None);
        };
        (
            read_json_field(&auth, &["tokens", "access_token"]),
            read_json_field(&auth, &["tokens", "account_id"]),
        )
    }

    /// Read the Gemini OAuth token, refreshing through Google's token
    /// endpoint if the stored one has expired.
    pub async fn gemini_token(&self, account: &AccountRow) -> Option<String> {
        let mut creds = None;

        if let Some(config_path) = account.config_path.as_deref() {
            creds = read_json_file(&expanduser(config_path).join("oauth_creds.json"));
        }
        if creds.is_none() {
            creds = keychain_raw("gemini-cli-oauth")
                .and_then(|raw| serde_json::from_str(&raw).ok());
        }
        if creds.is_none() {
            creds = home()
                .map(|h| h.join(".gemini").join("oauth_creds.json"))
                .and_then(|p| read_json_file(&p));
        }

        let creds = creds?;
        let access_token = creds["access_token"].as_str().map(str::to_owned);
        let refresh_token = creds["refresh_token"].as_str();
        let client_id = creds["client_id"].as_str().unwrap_or(GEMINI_CLI_CLIENT_ID);
        let client_secret =
            creds["client_secret"].as_str().unwrap_or(GEMINI_CLI_CLIENT_SECRET);

        if gemini_creds_expired(&creds, Utc::now()) {
            if let Some(refresh) = refresh_token {
                if let Some(fresh) =
                    self.refresh_google_token(refresh, client_id, client_secret).await
                {
                    return Some(fresh);
                }
            }
        }

        access_token
    }

    async fn refresh_google_token(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Option<String> {
        let resp = self
            .client
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await;

        let resp = match resp {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::warn!(status = %r.status(), "gemini token refresh rejected");
                return None;
            }
            Err(e) => {
                tracing::warn!(err = %e, "gemini token refresh failed");
                return None;
            }
        };

        let body: Value = resp.json().await.ok()?;
        body["access_token"].as_str().map(str::to_owned)
    }

    /// Short fingerprint of the resolved token, for deduplicating usage
    /// fetches across accounts that share one credential.
    ///
    /// A 12-hex-char sha256 prefix is a collision heuristic, not an
    /// identity guarantee; two distinct tokens could in principle collide.
    pub async fn fingerprint(&self, account: &AccountRow) -> Option<String> {
        let token = match account.backend {
            BackendKind::Claude => self.claude_token(account),
            BackendKind::Codex => self.codex_token(account).0,
            BackendKind::Gemini => self.gemini_token(account).await,
            BackendKind::Opencode => None,
        }?;
        Some(sha256_hex(token.as_bytes())[..12].to_owned())
    }
}

/// Whether the stored Gemini credentials are expired at `now`.
///
/// The Gemini CLI writes `expiry_date` (epoch millis); other formats use an
/// ISO `expiry` or `token_expiry` string.
pub fn gemini_creds_expired(creds: &Value, now: DateTime<Utc>) -> bool {
    if let Some(ms) = creds["expiry_date"].as_i64() {
        return DateTime::<Utc>::from_timestamp_millis(ms)
            .map(|exp| exp < now)
            .unwrap_or(false);
    }
    let iso = creds["expiry"].as_str().or(creds["token_expiry"].as_str());
    if let Some(iso) = iso {
        if let Ok(exp) = DateTime::parse_from_rfc3339(&iso.replace("Z", "+00:00")) {
            return exp.with_timezone(&Utc) < now;
        }
    }
    false
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Expand a leading `~` to the home directory.
fn expanduser(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn read_json_file(path: &Path) -> Option<Value> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Read a nested string field from a JSON file.
fn read_json_field(path: &Path, keys: &[&str]) -> Option<String> {
    let mut value = read_json_file(path)?;
    for key in keys {
        value = value.get_mut(*key)?.take();
    }
    value.as_str().map(str::to_owned)
}

/// Read a generic password from the macOS Keychain. Returns `None` on
/// other platforms and on any lookup failure — the Keychain is an optional
/// source, never required for correctness.
fn keychain_raw(service: &str) -> Option<String> {
    if !cfg!(target_os = "macos") {
        return None;
    }
    let output = Command::new("security")
        .args(["find-generic-password", "-s", service, "-w"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let secret = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    (!secret.is_empty()).then_some(secret)
}

/// Read a nested string field from a JSON payload stored in the Keychain.
fn keychain_json_field(service: &str, keys: &[&str]) -> Option<String> {
    let raw = keychain_raw(service)?;
    let mut value: Value = serde_json::from_str(&raw).ok()?;
    for key in keys {
        value = value.get_mut(*key)?.take();
    }
    value.as_str().map(str::to_owned)
}

#[cfg(test)]
#[path = "credential_tests.rs"]
mod tests;
