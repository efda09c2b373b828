// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rate-limit monitor: periodic provider polling, snapshot history,
//! threshold transitions, moving-average consumption rates, and ETA
//! projection.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::provider::UsageClient;
use crate::store::{AccountRow, SnapshotRow, Store};

/// Snapshot retention in days for the daily cleanup.
pub const SNAPSHOT_RETENTION_DAYS: i64 = 31;

/// Consumption-rate lookbacks: label and minutes.
pub const LOOKBACKS: [(&str, i64); 5] =
    [("24h", 1440), ("48h", 2880), ("72h", 4320), ("96h", 5760), ("120h", 7200)];

/// Discrete utilization bucket with 50/75/90 cutoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdLevel {
    Normal,
    Info,
    Warning,
    Critical,
}

impl ThresholdLevel {
    pub fn from_percentage(pct: f64) -> Self {
        if pct >= 90.0 {
            Self::Critical
        } else if pct >= 75.0 {
            Self::Warning
        } else if pct >= 50.0 {
            Self::Info
        } else {
            Self::Normal
        }
    }

    pub fn severity(&self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Info => 1,
            Self::Warning => 2,
            Self::Critical => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// A severity-increase transition recorded during a poll tick.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdAlert {
    pub account_id: i64,
    pub window_type: String,
    pub previous_level: ThresholdLevel,
    pub current_level: ThresholdLevel,
    pub percentage: f64,
}

/// Projected time-to-limit for one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Eta {
    AtLimit {
        message: String,
    },
    NoData {
        message: String,
    },
    Safe {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        resets_at: Option<DateTime<Utc>>,
    },
    Projected {
        eta: DateTime<Utc>,
        minutes_remaining: f64,
        message: String,
    },
}

impl Eta {
    pub fn minutes_remaining(&self) -> Option<f64> {
        match self {
            Self::Projected { minutes_remaining, .. } => Some(*minutes_remaining),
            _ => None,
        }
    }
}

/// Moving-average consumption rates per lookback, in units per hour.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumptionRates {
    /// `(label, rate_per_hour)`; `None` when fewer than 2 snapshots fall
    /// inside the lookback.
    pub rates: Vec<(String, Option<f64>)>,
    /// `"tok/hr"` or `"%/hr"` (percentage-only windows).
    pub unit: &'static str,
}

impl ConsumptionRates {
    /// Best rate for ETA projection: the longest lookback with data,
    /// converted to units per minute.
    pub fn best_per_minute(&self) -> Option<f64> {
        self.rates
            .iter()
            .rev()
            .find_map(|(_, rate)| rate.as_ref())
            .map(|per_hour| per_hour / 60.0)
    }
}

/// One window in the monitoring status report.
#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    pub account_id: i64,
    pub account_name: String,
    pub plan: String,
    pub backend_type: String,
    pub window_type: String,
    pub tokens_used: u64,
    pub tokens_limit: u64,
    pub percentage: f64,
    pub threshold_level: ThresholdLevel,
    pub resets_at: Option<DateTime<Utc>>,
    pub recorded_at: Option<DateTime<Utc>>,
    pub consumption_rates: Option<ConsumptionRates>,
    pub eta: Eta,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub shared_with: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub no_data: bool,
}

/// Full monitoring status, served by the API and consumed by the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub enabled: bool,
    pub polling_minutes: u32,
    pub windows: Vec<WindowReport>,
    pub threshold_alerts: Vec<ThresholdAlert>,
    pub last_polled_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct MonitorState {
    last_levels: HashMap<(i64, String), ThresholdLevel>,
    recent_alerts: Vec<ThresholdAlert>,
    last_polled_at: Option<DateTime<Utc>>,
}

/// Periodic rate-limit monitor over all enabled provider accounts.
pub struct RateLimitMonitor {
    store: Arc<dyn Store>,
    usage: UsageClient,
    state: Mutex<MonitorState>,
}

impl RateLimitMonitor {
    pub fn new(store: Arc<dyn Store>, usage: UsageClient) -> Self {
        Self { store, usage, state: Mutex::new(MonitorState::default()) }
    }

    /// Seed the threshold-level cache from persisted snapshots so alert
    /// detection survives a restart without a spurious first-poll alert.
    pub fn seed_threshold_levels(&self, now: DateTime<Utc>) {
        let snapshots = match self
            .store
            .latest_snapshots(Duration::days(SNAPSHOT_RETENTION_DAYS), now)
        {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(err = %e, "could not seed threshold levels from store");
                return;
            }
        };
        let mut state = self.state.lock();
        for snap in snapshots {
            state
                .last_levels
                .insert((snap.account_id, snap.window_type.clone()), snap.threshold_level);
        }
    }

    /// One poll tick: fetch usage per enabled account (deduplicating shared
    /// credentials by token fingerprint), record snapshots, and collect
    /// threshold alerts.
    ///
    /// Provider failures are no-data for this tick; the next poll retries.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Vec<ThresholdAlert> {
        self.state.lock().recent_alerts.clear();
        tracing::info!(at = %now, "monitoring poll: starting");

        let mut config = match self.store.monitor_config() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(err = %e, "monitoring poll: failed to load config");
                return Vec::new();
            }
        };
        let accounts = match self.store.accounts() {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(err = %e, "monitoring poll: failed to load accounts");
                return Vec::new();
            }
        };
        if accounts.is_empty() {
            return Vec::new();
        }

        // Auto-register new accounts in the config map so they show up in
        // later reconfiguration UIs.
        let mut config_changed = false;
        for account in &accounts {
            let key = account.id.to_string();
            if !config.accounts.contains_key(&key) {
                config
                    .accounts
                    .insert(key, crate::config::AccountMonitorConfig { enabled: true });
                config_changed = true;
            }
        }
        if config_changed {
            if let Err(e) = self.store.save_monitor_config(&config) {
                tracing::warn!(err = %e, "monitoring poll: failed to save updated config");
            }
        }

        // fingerprint:plan -> cached windows, deduplicating accounts that
        // share one credential.
        let mut fetched: HashMap<String, Vec<crate::provider::UsageWindow>> = HashMap::new();

        for account in &accounts {
            if !config.account_enabled(account.id) {
                continue;
            }

            let fingerprint = self.usage.resolver().fingerprint(account).await;
            let plan = account.plan.clone().unwrap_or_default().to_lowercase();
            let cache_key = fingerprint.as_ref().map(|fp| format!("{fp}:{plan}"));

            let windows = match cache_key.as_ref().and_then(|k| fetched.get(k)) {
                Some(cached) => {
                    tracing::info!(
                        account_id = account.id,
                        fingerprint = fingerprint.as_deref().unwrap_or(""),
                        "monitoring poll: shared credentials, reusing cached data"
                    );
                    cached.clone()
                }
                None => {
                    let windows = self.usage.fetch_usage(account).await;
                    if let Some(key) = cache_key {
                        fetched.insert(key, windows.clone());
                    }
                    windows
                }
            };

            if windows.is_empty() {
                tracing::debug!(account_id = account.id, "monitoring poll: no windows returned");
                continue;
            }

            for window in &windows {
                let level = ThresholdLevel::from_percentage(window.percentage);
                let row = SnapshotRow {
                    account_id: account.id,
                    backend: account.backend,
                    window_type: window.window_type.clone(),
                    tokens_used: window.tokens_used,
                    tokens_limit: window.tokens_limit,
                    percentage: window.percentage,
                    threshold_level: level,
                    resets_at: window.resets_at,
                    recorded_at: now,
                };
                if let Err(e) = self.store.insert_snapshot(row) {
                    tracing::error!(account_id = account.id, err = %e, "snapshot insert failed");
                    continue;
                }

                if let Some(alert) =
                    self.check_transition(account.id, &window.window_type, window.percentage)
                {
                    self.state.lock().recent_alerts.push(alert);
                }
            }
        }

        let mut state = self.state.lock();
        state.last_polled_at = Some(now);
        state.recent_alerts.clone()
    }

    /// Detect a threshold transition for one window. Fires only on severity
    /// increase; decreases update the cache silently (cooldown).
    fn check_transition(
        &self,
        account_id: i64,
        window_type: &str,
        percentage: f64,
    ) -> Option<ThresholdAlert> {
        let current = ThresholdLevel::from_percentage(percentage);
        let key = (account_id, window_type.to_owned());

        let mut state = self.state.lock();
        let previous = state.last_levels.get(&key).copied().unwrap_or(ThresholdLevel::Normal);
        if current == previous {
            return None;
        }
        state.last_levels.insert(key, current);

        if current.severity() > previous.severity() {
            tracing::info!(
                account_id,
                window_type,
                from = previous.as_str(),
                to = current.as_str(),
                percentage,
                "threshold transition"
            );
            return Some(ThresholdAlert {
                account_id,
                window_type: window_type.to_owned(),
                previous_level: previous,
                current_level: current,
                percentage,
            });
        }
        None
    }

    /// Moving-average consumption rates for one window over the standard
    /// lookbacks, anchored at the newest snapshot (not `now`, so a paused
    /// poller does not dilute the rate).
    pub fn consumption_rates(&self, account_id: i64, window_type: &str) -> ConsumptionRates {
        let history = self.store.snapshot_history(account_id, window_type).unwrap_or_default();

        let is_pct_only = history.last().map(|s| s.tokens_limit == 0).unwrap_or(false);
        let unit = if is_pct_only { "%/hr" } else { "tok/hr" };

        let mut rates = Vec::with_capacity(LOOKBACKS.len());
        for (label, minutes) in LOOKBACKS {
            let rate = if history.len() >= 2 {
                let newest = &history[history.len() - 1];
                let cutoff = newest.recorded_at - Duration::minutes(minutes);
                let windowed: Vec<&SnapshotRow> =
                    history.iter().filter(|s| s.recorded_at >= cutoff).collect();
                rate_over(&windowed, is_pct_only)
            } else {
                None
            };
            rates.push((label.to_owned(), rate));
        }

        ConsumptionRates { rates, unit }
    }

    /// Project time-to-limit for a window given a consumption rate in
    /// units per minute.
    pub fn compute_eta(
        tokens_used: u64,
        tokens_limit: u64,
        percentage: f64,
        resets_at: Option<DateTime<Utc>>,
        rate_per_minute: Option<f64>,
        now: DateTime<Utc>,
    ) -> Eta {
        let is_pct_only = tokens_limit == 0;
        let remaining = if is_pct_only {
            100.0 - percentage
        } else {
            tokens_limit as f64 - tokens_used as f64
        };

        if remaining <= 0.0 {
            return Eta::AtLimit { message: "Rate limit reached".to_owned() };
        }

        let Some(rate) = rate_per_minute else {
            return Eta::NoData { message: "Insufficient data".to_owned() };
        };
        if rate <= 0.0 {
            let message = if percentage <= 0.0 { "No activity" } else { "Usage declining" };
            return Eta::Safe { message: message.to_owned(), resets_at: None };
        }

        let minutes = remaining / rate;
        let eta = now + Duration::seconds((minutes * 60.0) as i64);

        if let Some(resets) = resets_at {
            if eta > resets {
                return Eta::Safe {
                    message: "Window resets before limit".to_owned(),
                    resets_at: Some(resets),
                };
            }
        }

        Eta::Projected {
            eta,
            minutes_remaining: (minutes * 10.0).round() / 10.0,
            message: format_eta(minutes),
        }
    }

    /// Full monitoring status: recent windows enriched with rates and ETAs,
    /// shared-credential peers, alerts since the last poll, and placeholders
    /// for enabled accounts with no data.
    pub async fn status(&self, now: DateTime<Utc>) -> MonitorStatus {
        let config = self.store.monitor_config().unwrap_or_default();
        let accounts = self.store.accounts().unwrap_or_default();

        let names: HashMap<i64, String> =
            accounts.iter().map(|a| (a.id, a.name.clone())).collect();
        let plans: HashMap<i64, String> = accounts
            .iter()
            .map(|a| (a.id, a.plan.clone().unwrap_or_default()))
            .collect();

        let shared = self.shared_credential_peers(&accounts).await;

        // Exclude stale snapshots: anything older than 3 polling intervals
        // (at least 30 minutes, to ride out gaps).
        let max_age_minutes = (config.polling_minutes as i64 * 3).max(30);
        let snapshots = self
            .store
            .latest_snapshots(Duration::minutes(max_age_minutes), now)
            .unwrap_or_default();

        let mut windows = Vec::new();
        let mut accounts_with_data: std::collections::HashSet<i64> =
            std::collections::HashSet::new();

        for snap in snapshots {
            accounts_with_data.insert(snap.account_id);

            let rates = self.consumption_rates(snap.account_id, &snap.window_type);
            let eta = Self::compute_eta(
                snap.tokens_used,
                snap.tokens_limit,
                snap.percentage,
                snap.resets_at,
                rates.best_per_minute(),
                now,
            );

            windows.push(WindowReport {
                account_id: snap.account_id,
                account_name: names.get(&snap.account_id).cloned().unwrap_or_default(),
                plan: plans.get(&snap.account_id).cloned().unwrap_or_default(),
                backend_type: snap.backend.as_str().to_owned(),
                window_type: snap.window_type,
                tokens_used: snap.tokens_used,
                tokens_limit: snap.tokens_limit,
                percentage: snap.percentage,
                threshold_level: snap.threshold_level,
                resets_at: snap.resets_at,
                recorded_at: Some(snap.recorded_at),
                consumption_rates: Some(rates),
                eta,
                shared_with: shared.get(&snap.account_id).cloned().unwrap_or_default(),
                no_data: false,
            });
        }

        // Enabled accounts with no recent data still get a card with a
        // no-data marker (usually missing or expired credentials).
        for account in &accounts {
            if config.account_enabled(account.id) && !accounts_with_data.contains(&account.id) {
                windows.push(WindowReport {
                    account_id: account.id,
                    account_name: account.name.clone(),
                    plan: account.plan.clone().unwrap_or_default(),
                    backend_type: account.backend.as_str().to_owned(),
                    window_type: "no_data".to_owned(),
                    tokens_used: 0,
                    tokens_limit: 0,
                    percentage: 0.0,
                    threshold_level: ThresholdLevel::Normal,
                    resets_at: None,
                    recorded_at: None,
                    consumption_rates: None,
                    eta: Eta::NoData { message: "No monitoring data".to_owned() },
                    shared_with: Vec::new(),
                    no_data: true,
                });
            }
        }

        let state = self.state.lock();
        MonitorStatus {
            enabled: config.enabled,
            polling_minutes: config.polling_minutes,
            windows,
            threshold_alerts: state.recent_alerts.clone(),
            last_polled_at: state.last_polled_at,
        }
    }

    async fn shared_credential_peers(
        &self,
        accounts: &[AccountRow],
    ) -> HashMap<i64, Vec<String>> {
        let mut by_fingerprint: HashMap<String, Vec<i64>> = HashMap::new();
        for account in accounts {
            if let Some(fp) = self.usage.resolver().fingerprint(account).await {
                by_fingerprint.entry(fp).or_default().push(account.id);
            }
        }

        let names: HashMap<i64, String> =
            accounts.iter().map(|a| (a.id, a.name.clone())).collect();

        let mut peers: HashMap<i64, Vec<String>> = HashMap::new();
        for ids in by_fingerprint.values() {
            if ids.len() < 2 {
                continue;
            }
            for id in ids {
                let others = ids
                    .iter()
                    .filter(|other| *other != id)
                    .map(|other| names.get(other).cloned().unwrap_or_else(|| other.to_string()))
                    .collect();
                peers.insert(*id, others);
            }
        }
        peers
    }

    /// Delete snapshots past the retention horizon. Runs daily.
    pub fn cleanup_old_snapshots(&self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(SNAPSHOT_RETENTION_DAYS);
        match self.store.delete_snapshots_before(cutoff) {
            Ok(deleted) if deleted > 0 => {
                tracing::info!(deleted, "snapshot cleanup complete");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(err = %e, "snapshot cleanup failed"),
        }
    }
}

/// Rate between the oldest and newest snapshot of a window, per minute.
fn rate_over(windowed: &[&SnapshotRow], is_pct_only: bool) -> Option<f64> {
    if windowed.len() < 2 {
        return None;
    }
    let oldest = windowed.first()?;
    let newest = windowed.last()?;

    let delta = if is_pct_only {
        newest.percentage - oldest.percentage
    } else {
        newest.tokens_used as f64 - oldest.tokens_used as f64
    };

    let minutes = (newest.recorded_at - oldest.recorded_at).num_seconds() as f64 / 60.0;
    if minutes <= 0.0 {
        return Some(0.0);
    }
    // Reported per hour, rounded to one decimal.
    Some(((delta / minutes) * 60.0 * 10.0).round() / 10.0)
}

/// Human-readable ETA: `~45m`, `~3h 20m`, `~2d 4h`.
fn format_eta(minutes: f64) -> String {
    let m = minutes as i64;
    if m < 60 {
        format!("~{m}m")
    } else if m < 1440 {
        format!("~{}h {}m", m / 60, m % 60)
    } else {
        format!("~{}d {}h", m / 1440, (m % 1440) / 60)
    }
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
