// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rate-limit detection from CLI stderr and account cooldown management.

use std::sync::Arc;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::{Regex, RegexBuilder};

use crate::backend::BackendKind;
use crate::store::{AccountRow, Store};

/// Cooldown applied when no retry-after hint is present.
pub const DEFAULT_COOLDOWN_SECONDS: u64 = 60;

fn build_set(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
        .collect()
}

static CLAUDE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    build_set(&["429", "rate_limit_error", "rate.limit", "exceeded.*quota"])
});
static OPENCODE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    build_set(&["statusCode.*429", "Rate limit exceeded", "rate.limited"])
});
static GEMINI_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    build_set(&["429", "RESOURCE_EXHAUSTED", "rate.limit", "quota.*exceeded"])
});
static CODEX_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    build_set(&["429", "rate_limit", "rate.limit", "too many requests"])
});

static RETRY_AFTER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    RegexBuilder::new(r"retry.after.*?(\d+)").case_insensitive(true).build().ok()
});

fn patterns_for(backend: BackendKind) -> &'static [Regex] {
    match backend {
        BackendKind::Claude => &CLAUDE_PATTERNS,
        BackendKind::Opencode => &OPENCODE_PATTERNS,
        BackendKind::Gemini => &GEMINI_PATTERNS,
        BackendKind::Codex => &CODEX_PATTERNS,
    }
}

/// Check a stderr line for rate-limit indicators.
///
/// Returns the cooldown in seconds when one matches: the retry-after value
/// if present, else [`DEFAULT_COOLDOWN_SECONDS`].
pub fn check_stderr_line(line: &str, backend: BackendKind) -> Option<u64> {
    for pattern in patterns_for(backend) {
        if pattern.is_match(line) {
            if let Some(retry) = RETRY_AFTER.as_ref() {
                if let Some(cap) = retry.captures(line) {
                    if let Some(secs) = cap.get(1).and_then(|m| m.as_str().parse().ok()) {
                        return Some(secs);
                    }
                }
            }
            return Some(DEFAULT_COOLDOWN_SECONDS);
        }
    }
    None
}

/// Account cooldown bookkeeping over the store.
pub struct RateLimitTracker {
    store: Arc<dyn Store>,
}

impl RateLimitTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Mark an account rate-limited for `cooldown_seconds` from now.
    pub fn mark_rate_limited(&self, account_id: i64, cooldown_seconds: u64) {
        let until = Utc::now() + Duration::seconds(cooldown_seconds as i64);
        if let Err(e) = self.store.set_rate_limited(
            account_id,
            Some(until),
            Some("rate_limit_429".to_owned()),
        ) {
            tracing::warn!(account_id, err = %e, "failed to mark account rate-limited");
        }
    }

    /// Clear an account's cooldown.
    pub fn clear_rate_limit(&self, account_id: i64) {
        if let Err(e) = self.store.set_rate_limited(account_id, None, None) {
            tracing::warn!(account_id, err = %e, "failed to clear rate limit");
        }
    }

    /// Whether the account's cooldown is still in the future.
    pub fn is_rate_limited(&self, account_id: i64, now: DateTime<Utc>) -> bool {
        match self.store.account(account_id) {
            Ok(Some(account)) => is_cooling_down(&account, now),
            _ => false,
        }
    }

    /// Best available account for a backend: cooldowns filtered out, then
    /// `is_default DESC, last_used_at ASC` (the store returns that order).
    pub fn pick_best_account(
        &self,
        backend: BackendKind,
        now: DateTime<Utc>,
    ) -> Option<AccountRow> {
        let accounts = self.store.accounts_for_backend(backend).ok()?;
        accounts.into_iter().find(|account| !is_cooling_down(account, now))
    }
}

fn is_cooling_down(account: &AccountRow, now: DateTime<Utc>) -> bool {
    account.rate_limited_until.map(|until| until > now).unwrap_or(false)
}

#[cfg(test)]
#[path = "ratelimit_tests.rs"]
mod tests;
