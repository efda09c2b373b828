// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Opaque persistence boundary.
//!
//! The control plane reads and writes rows for sessions, accounts,
//! rate-limit snapshots, scheduler state, monitoring config, and fallback
//! chains through this trait; the storage engine behind it is an external
//! concern. [`MemoryStore`] is the in-process reference implementation and
//! the fake injected by tests.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendKind, ExecutionKind, ExecutionMode, SessionStatus};
use crate::config::MonitorConfig;
use crate::monitor::ThresholdLevel;
use crate::scheduler::{SchedState, StopReason};

/// Persisted PTY session row (crash-recovery record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: String,
    pub project_id: String,
    pub pid: Option<i32>,
    pub pgid: Option<i32>,
    pub status: SessionStatus,
    pub execution_type: ExecutionKind,
    pub execution_mode: ExecutionMode,
    pub worktree_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Provider account row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRow {
    pub id: i64,
    pub backend: BackendKind,
    pub name: String,
    pub email: Option<String>,
    pub config_path: Option<String>,
    /// Name of the env var holding this account's API key (indirection —
    /// the key itself never lands in the store).
    pub api_key_env: Option<String>,
    pub is_default: bool,
    pub plan: Option<String>,
    pub rate_limited_until: Option<DateTime<Utc>>,
    pub rate_limit_reason: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub total_executions: u64,
}

/// Append-only rate-limit window snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub account_id: i64,
    pub backend: BackendKind,
    pub window_type: String,
    pub tokens_used: u64,
    /// 0 means the provider only reports utilization percentage.
    pub tokens_limit: u64,
    pub percentage: f64,
    pub threshold_level: ThresholdLevel,
    pub resets_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

/// Persisted admission-scheduler state for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerRow {
    pub account_id: i64,
    pub state: SchedState,
    pub stop_reason: Option<StopReason>,
    pub stop_window_type: Option<String>,
    pub stop_eta_minutes: Option<f64>,
    pub resume_estimate: Option<DateTime<Utc>>,
    pub consecutive_safe_polls: u32,
    pub updated_at: DateTime<Utc>,
}

/// One fallback chain entry: a backend, optionally pinned to an account.
/// `account_id: None` means "auto-select the best available account".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub backend: BackendKind,
    pub account_id: Option<i64>,
}

/// Persistence operations the core needs. Implementations must be
/// thread-safe; calls never block on I/O long enough to matter under the
/// callers' locks.
pub trait Store: Send + Sync {
    // -- sessions -------------------------------------------------------------
    fn insert_session(&self, row: SessionRow) -> anyhow::Result<()>;
    fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()>;
    /// Sessions persisted as `active`/`paused` (candidates for boot
    /// reconciliation).
    fn active_sessions(&self) -> anyhow::Result<Vec<SessionRow>>;

    // -- accounts -------------------------------------------------------------
    fn accounts(&self) -> anyhow::Result<Vec<AccountRow>>;
    /// Accounts for one backend, ordered `is_default DESC, last_used_at ASC`.
    fn accounts_for_backend(&self, backend: BackendKind) -> anyhow::Result<Vec<AccountRow>>;
    fn account(&self, id: i64) -> anyhow::Result<Option<AccountRow>>;
    fn set_rate_limited(
        &self,
        id: i64,
        until: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> anyhow::Result<()>;
    /// Increment the executions counter and stamp `last_used_at`.
    fn record_execution(&self, id: i64, at: DateTime<Utc>) -> anyhow::Result<()>;

    // -- rate-limit snapshots -------------------------------------------------
    fn insert_snapshot(&self, row: SnapshotRow) -> anyhow::Result<()>;
    /// Newest snapshot per `(account_id, window_type)` recorded within
    /// `max_age` of `now`.
    fn latest_snapshots(&self, max_age: Duration, now: DateTime<Utc>)
        -> anyhow::Result<Vec<SnapshotRow>>;
    /// Full history for one window, ascending by `recorded_at`.
    fn snapshot_history(&self, account_id: i64, window_type: &str)
        -> anyhow::Result<Vec<SnapshotRow>>;
    fn delete_snapshots_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize>;

    // -- scheduler ------------------------------------------------------------
    fn scheduler_rows(&self) -> anyhow::Result<Vec<SchedulerRow>>;
    fn upsert_scheduler_row(&self, row: SchedulerRow) -> anyhow::Result<()>;

    // -- monitoring config ----------------------------------------------------
    fn monitor_config(&self) -> anyhow::Result<MonitorConfig>;
    fn save_monitor_config(&self, config: &MonitorConfig) -> anyhow::Result<()>;

    // -- fallback chains ------------------------------------------------------
    fn fallback_chain(&self, trigger_id: &str) -> anyhow::Result<Vec<ChainEntry>>;
}

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<String, SessionRow>,
    accounts: HashMap<i64, AccountRow>,
    snapshots: Vec<SnapshotRow>,
    scheduler: HashMap<i64, SchedulerRow>,
    monitor_config: Option<MonitorConfig>,
    chains: HashMap<String, Vec<ChainEntry>>,
}

/// In-memory [`Store`] used in tests and single-process deployments without
/// an external database.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account (test/bootstrap helper).
    pub fn put_account(&self, account: AccountRow) {
        self.inner.lock().accounts.insert(account.id, account);
    }

    /// Seed a fallback chain (test/bootstrap helper).
    pub fn put_chain(&self, trigger_id: &str, chain: Vec<ChainEntry>) {
        self.inner.lock().chains.insert(trigger_id.to_owned(), chain);
    }

    /// Fetch one session row (test helper).
    pub fn session(&self, id: &str) -> Option<SessionRow> {
        self.inner.lock().sessions.get(id).cloned()
    }
}

impl Store for MemoryStore {
    fn insert_session(&self, row: SessionRow) -> anyhow::Result<()> {
        self.inner.lock().sessions.insert(row.id.clone(), row);
        Ok(())
    }

    fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.sessions.get_mut(id) {
            row.status = status;
            if ended_at.is_some() {
                row.ended_at = ended_at;
            }
        }
        Ok(())
    }

    fn active_sessions(&self) -> anyhow::Result<Vec<SessionRow>> {
        let inner = self.inner.lock();
        Ok(inner
            .sessions
            .values()
            .filter(|row| !row.status.is_terminal())
            .cloned()
            .collect())
    }

    fn accounts(&self) -> anyhow::Result<Vec<AccountRow>> {
        let inner = self.inner.lock();
        let mut rows: Vec<_> = inner.accounts.values().cloned().collect();
        rows.sort_by_key(|a| a.id);
        Ok(rows)
    }

    fn accounts_for_backend(&self, backend: BackendKind) -> anyhow::Result<Vec<AccountRow>> {
        let inner = self.inner.lock();
        let mut rows: Vec<_> =
            inner.accounts.values().filter(|a| a.backend == backend).cloned().collect();
        rows.sort_by(|a, b| {
            b.is_default
                .cmp(&a.is_default)
                .then_with(|| {
                    // Never-used accounts sort before recently-used ones.
                    match (a.last_used_at, b.last_used_at) {
                        (None, None) => std::cmp::Ordering::Equal,
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (Some(_), None) => std::cmp::Ordering::Greater,
                        (Some(x), Some(y)) => x.cmp(&y),
                    }
                })
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(rows)
    }

    fn account(&self, id: i64) -> anyhow::Result<Option<AccountRow>> {
        Ok(self.inner.lock().accounts.get(&id).cloned())
    }

    fn set_rate_limited(
        &self,
        id: i64,
        until: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(account) = inner.accounts.get_mut(&id) {
            account.rate_limited_until = until;
            account.rate_limit_reason = reason;
        }
        Ok(())
    }

    fn record_execution(&self, id: i64, at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(account) = inner.accounts.get_mut(&id) {
            account.total_executions += 1;
            account.last_used_at = Some(at);
        }
        Ok(())
    }

    fn insert_snapshot(&self, row: SnapshotRow) -> anyhow::Result<()> {
        self.inner.lock().snapshots.push(row);
        Ok(())
    }

    fn latest_snapshots(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<SnapshotRow>> {
        let inner = self.inner.lock();
        let cutoff = now - max_age;
        let mut latest: HashMap<(i64, String), SnapshotRow> = HashMap::new();
        for snap in &inner.snapshots {
            if snap.recorded_at < cutoff {
                continue;
            }
            let key = (snap.account_id, snap.window_type.clone());
            match latest.get(&key) {
                Some(existing) if existing.recorded_at >= snap.recorded_at => {}
                _ => {
                    latest.insert(key, snap.clone());
                }
            }
        }
        let mut rows: Vec<_> = latest.into_values().collect();
        rows.sort_by(|a, b| {
            a.account_id.cmp(&b.account_id).then_with(|| a.window_type.cmp(&b.window_type))
        });
        Ok(rows)
    }

    fn snapshot_history(
        &self,
        account_id: i64,
        window_type: &str,
    ) -> anyhow::Result<Vec<SnapshotRow>> {
        let inner = self.inner.lock();
        let mut rows: Vec<_> = inner
            .snapshots
            .iter()
            .filter(|s| s.account_id == account_id && s.window_type == window_type)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.recorded_at);
        Ok(rows)
    }

    fn delete_snapshots_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize> {
        let mut inner = self.inner.lock();
        let before = inner.snapshots.len();
        inner.snapshots.retain(|s| s.recorded_at >= cutoff);
        Ok(before - inner.snapshots.len())
    }

    fn scheduler_rows(&self) -> anyhow::Result<Vec<SchedulerRow>> {
        let inner = self.inner.lock();
        let mut rows: Vec<_> = inner.scheduler.values().cloned().collect();
        rows.sort_by_key(|r| r.account_id);
        Ok(rows)
    }

    fn upsert_scheduler_row(&self, row: SchedulerRow) -> anyhow::Result<()> {
        self.inner.lock().scheduler.insert(row.account_id, row);
        Ok(())
    }

    fn monitor_config(&self) -> anyhow::Result<MonitorConfig> {
        Ok(self.inner.lock().monitor_config.clone().unwrap_or_default())
    }

    fn save_monitor_config(&self, config: &MonitorConfig) -> anyhow::Result<()> {
        self.inner.lock().monitor_config = Some(config.clone());
        Ok(())
    }

    fn fallback_chain(&self, trigger_id: &str) -> anyhow::Result<Vec<ChainEntry>> {
        Ok(self.inner.lock().chains.get(trigger_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
