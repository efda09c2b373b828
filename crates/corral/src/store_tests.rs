// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use chrono::{Duration, TimeZone, Utc};

use crate::backend::BackendKind;
use crate::monitor::ThresholdLevel;

use super::*;

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap_or_default()
}

fn snapshot(account_id: i64, window: &str, minutes_ago: i64) -> SnapshotRow {
    SnapshotRow {
        account_id,
        backend: BackendKind::Claude,
        window_type: window.to_owned(),
        tokens_used: 0,
        tokens_limit: 0,
        percentage: 10.0,
        threshold_level: ThresholdLevel::Normal,
        resets_at: None,
        recorded_at: t0() - Duration::minutes(minutes_ago),
    }
}

#[test]
fn latest_snapshots_newest_per_window_within_age() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.insert_snapshot(snapshot(1, "five_hour", 20))?;
    store.insert_snapshot(snapshot(1, "five_hour", 5))?;
    store.insert_snapshot(snapshot(1, "seven_day", 5))?;
    store.insert_snapshot(snapshot(2, "five_hour", 120))?;

    let latest = store.latest_snapshots(Duration::minutes(30), t0())?;
    assert_eq!(latest.len(), 2);
    // Newest snapshot wins per (account, window); stale account 2 excluded.
    assert!(latest
        .iter()
        .all(|s| s.recorded_at == t0() - Duration::minutes(5)));
    Ok(())
}

#[test]
fn snapshot_history_is_ascending() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.insert_snapshot(snapshot(1, "w", 5))?;
    store.insert_snapshot(snapshot(1, "w", 60))?;
    store.insert_snapshot(snapshot(1, "w", 30))?;

    let history = store.snapshot_history(1, "w")?;
    assert_eq!(history.len(), 3);
    assert!(history.windows(2).all(|pair| pair[0].recorded_at <= pair[1].recorded_at));
    Ok(())
}

#[test]
fn accounts_for_backend_ordering() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let base = |id: i64| AccountRow {
        id,
        backend: BackendKind::Claude,
        name: format!("a{id}"),
        email: None,
        config_path: None,
        api_key_env: None,
        is_default: false,
        plan: None,
        rate_limited_until: None,
        rate_limit_reason: None,
        last_used_at: None,
        total_executions: 0,
    };

    let mut used_recently = base(1);
    used_recently.last_used_at = Some(t0());
    let mut used_long_ago = base(2);
    used_long_ago.last_used_at = Some(t0() - Duration::days(2));
    let mut default = base(3);
    default.is_default = true;
    default.last_used_at = Some(t0());
    let never_used = base(4);

    store.put_account(used_recently);
    store.put_account(used_long_ago);
    store.put_account(default);
    store.put_account(never_used);

    let order: Vec<i64> =
        store.accounts_for_backend(BackendKind::Claude)?.iter().map(|a| a.id).collect();
    // Default first, then never-used, then least recently used.
    assert_eq!(order, vec![3, 4, 2, 1]);
    Ok(())
}

#[test]
fn record_execution_updates_counters() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.put_account(AccountRow {
        id: 1,
        backend: BackendKind::Codex,
        name: "c".to_owned(),
        email: None,
        config_path: None,
        api_key_env: None,
        is_default: true,
        plan: None,
        rate_limited_until: None,
        rate_limit_reason: None,
        last_used_at: None,
        total_executions: 0,
    });

    store.record_execution(1, t0())?;
    store.record_execution(1, t0() + Duration::minutes(1))?;

    let account = store.account(1)?.ok_or_else(|| anyhow::anyhow!("missing"))?;
    assert_eq!(account.total_executions, 2);
    assert_eq!(account.last_used_at, Some(t0() + Duration::minutes(1)));
    Ok(())
}

#[test]
fn monitor_config_roundtrip_with_default() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    // Unset config yields the defaults.
    assert_eq!(store.monitor_config()?.polling_minutes, 5);

    let mut config = crate::config::MonitorConfig { enabled: true, ..Default::default() };
    config.polling_minutes = 15;
    store.save_monitor_config(&config)?;
    let loaded = store.monitor_config()?;
    assert!(loaded.enabled);
    assert_eq!(loaded.polling_minutes, 15);
    Ok(())
}
