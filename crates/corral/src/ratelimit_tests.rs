// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use chrono::{Duration, Utc};
use yare::parameterized;

use crate::backend::BackendKind;
use crate::store::{AccountRow, MemoryStore, Store};

use super::*;

fn account(id: i64, backend: BackendKind, is_default: bool) -> AccountRow {
    AccountRow {
        id,
        backend,
        name: format!("acct-{id}"),
        email: None,
        config_path: None,
        api_key_env: None,
        is_default,
        plan: None,
        rate_limited_until: None,
        rate_limit_reason: None,
        last_used_at: None,
        total_executions: 0,
    }
}

#[parameterized(
    claude_429 = { "Error: 429 Too Many Requests", BackendKind::Claude },
    claude_code = { "rate_limit_error: please slow down", BackendKind::Claude },
    claude_quota = { "you have exceeded your quota", BackendKind::Claude },
    gemini_exhausted = { "RESOURCE_EXHAUSTED", BackendKind::Gemini },
    codex_tmr = { "HTTP error: too many requests", BackendKind::Codex },
    opencode = { "statusCode: 429", BackendKind::Opencode },
)]
fn detects_rate_limit_lines(line: &str, backend: BackendKind) {
    assert_eq!(check_stderr_line(line, backend), Some(DEFAULT_COOLDOWN_SECONDS));
}

#[test]
fn extracts_retry_after_seconds() {
    let line = "429 rate limited, retry-after: 120 seconds";
    assert_eq!(check_stderr_line(line, BackendKind::Claude), Some(120));
}

#[test]
fn clean_lines_pass() {
    assert_eq!(check_stderr_line("compiling corral v0.4.2", BackendKind::Claude), None);
    assert_eq!(check_stderr_line("", BackendKind::Codex), None);
}

#[test]
fn mark_and_expiry_roundtrip() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.put_account(account(1, BackendKind::Claude, true));
    let tracker = RateLimitTracker::new(Arc::clone(&store) as Arc<dyn Store>);

    let now = Utc::now();
    assert!(!tracker.is_rate_limited(1, now));

    tracker.mark_rate_limited(1, 60);
    assert!(tracker.is_rate_limited(1, now));
    // Expired cooldowns clear themselves by time passing.
    assert!(!tracker.is_rate_limited(1, now + Duration::seconds(120)));

    tracker.clear_rate_limit(1);
    assert!(!tracker.is_rate_limited(1, now));
    Ok(())
}

#[test]
fn pick_best_prefers_default_then_least_recently_used() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();

    let mut stale = account(1, BackendKind::Claude, false);
    stale.last_used_at = Some(now - Duration::hours(10));
    let mut fresh = account(2, BackendKind::Claude, false);
    fresh.last_used_at = Some(now - Duration::hours(1));
    let default = account(3, BackendKind::Claude, true);

    store.put_account(fresh);
    store.put_account(stale);
    store.put_account(default);

    let tracker = RateLimitTracker::new(Arc::clone(&store) as Arc<dyn Store>);

    // Default account wins outright.
    assert_eq!(tracker.pick_best_account(BackendKind::Claude, now).map(|a| a.id), Some(3));

    // With the default cooling down, least-recently-used wins.
    tracker.mark_rate_limited(3, 300);
    assert_eq!(tracker.pick_best_account(BackendKind::Claude, now).map(|a| a.id), Some(1));

    // All cooling down: nothing to pick.
    tracker.mark_rate_limited(1, 300);
    tracker.mark_rate_limited(2, 300);
    assert_eq!(tracker.pick_best_account(BackendKind::Claude, now).map(|a| a.id), None);
    Ok(())
}

#[test]
fn pick_best_ignores_other_backends() {
    let store = Arc::new(MemoryStore::new());
    store.put_account(account(1, BackendKind::Gemini, true));
    let tracker = RateLimitTracker::new(store as Arc<dyn Store>);
    assert!(tracker.pick_best_account(BackendKind::Claude, Utc::now()).is_none());
}
