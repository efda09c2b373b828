// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Admission scheduler: gates execution per account on rate-limit ETAs.
//!
//! Each account carries a `queued | running | stopped` state. Evaluation
//! after every monitor poll stops accounts that are at (or projected to
//! imminently hit) a limit; resume is hysteresis-damped so an ETA hovering
//! around the safety margin cannot flap the account.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::monitor::{Eta, WindowReport};
use crate::store::{SchedulerRow, Store};

/// Scheduler state for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedState {
    Queued,
    Running,
    Stopped,
}

impl SchedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

/// Why an account was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    AtLimit,
    ApproachingLimit,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AtLimit => "at_limit",
            Self::ApproachingLimit => "approaching_limit",
        }
    }
}

/// Result of an eligibility check inside the fallback loop.
#[derive(Debug, Clone, Serialize)]
pub struct Eligibility {
    pub eligible: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_estimate: Option<DateTime<Utc>>,
}

/// Per-account scheduler status for the API.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSchedStatus {
    pub account_id: i64,
    pub state: SchedState,
    pub stop_reason: Option<StopReason>,
    pub stop_window_type: Option<String>,
    pub stop_eta_minutes: Option<f64>,
    pub resume_estimate: Option<DateTime<Utc>>,
    pub consecutive_safe_polls: u32,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate counts across all tracked accounts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedSummary {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub stopped: usize,
}

#[derive(Debug, Clone)]
struct SchedEntry {
    state: SchedState,
    stop_reason: Option<StopReason>,
    stop_window_type: Option<String>,
    stop_eta_minutes: Option<f64>,
    resume_estimate: Option<DateTime<Utc>>,
    consecutive_safe_polls: u32,
    updated_at: DateTime<Utc>,
}

impl SchedEntry {
    fn queued(now: DateTime<Utc>) -> Self {
        Self {
            state: SchedState::Queued,
            stop_reason: None,
            stop_window_type: None,
            stop_eta_minutes: None,
            resume_estimate: None,
            consecutive_safe_polls: 0,
            updated_at: now,
        }
    }
}

/// Admission controller keyed by account id. State lives in memory and is
/// mirrored to the store (in-memory first, then persisted — never the
/// reverse) so a restart can reload it.
pub struct AdmissionScheduler {
    store: Arc<dyn Store>,
    states: Mutex<HashMap<i64, SchedEntry>>,
}

impl AdmissionScheduler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, states: Mutex::new(HashMap::new()) }
    }

    /// Load persisted scheduler rows into memory. Called once at boot.
    pub fn load_from_store(&self) {
        let rows = match self.store.scheduler_rows() {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(err = %e, "could not load scheduler state from store");
                return;
            }
        };
        let count = rows.len();
        let mut states = self.states.lock();
        states.clear();
        for row in rows {
            states.insert(
                row.account_id,
                SchedEntry {
                    state: row.state,
                    stop_reason: row.stop_reason,
                    stop_window_type: row.stop_window_type,
                    stop_eta_minutes: row.stop_eta_minutes,
                    resume_estimate: row.resume_estimate,
                    consecutive_safe_polls: row.consecutive_safe_polls,
                    updated_at: row.updated_at,
                },
            );
        }
        tracing::info!(accounts = count, "scheduler state loaded");
    }

    /// Admission check for a single account, called per entry inside the
    /// fallback chain loop (not as a blanket pre-check).
    pub fn check_eligibility(&self, account_id: i64) -> Eligibility {
        let states = self.states.lock();
        if let Some(entry) = states.get(&account_id) {
            if entry.state == SchedState::Stopped {
                let reason = entry.stop_reason.map(|r| r.as_str()).unwrap_or("unknown");
                return Eligibility {
                    eligible: false,
                    reason: "scheduler_paused".to_owned(),
                    message: Some(format!(
                        "Account {account_id} paused by scheduler: {reason}"
                    )),
                    resume_estimate: entry.resume_estimate,
                };
            }
        }
        Eligibility { eligible: true, reason: "ok".to_owned(), message: None, resume_estimate: None }
    }

    /// Evaluate every account against the monitor's window report.
    ///
    /// The most conservative ETA per account wins:
    /// `at_limit > projected (shorter minutes first) > safe > no_data`.
    pub fn evaluate_all(
        &self,
        windows: &[WindowReport],
        safety_margin_minutes: f64,
        hysteresis_polls: u32,
        now: DateTime<Utc>,
    ) {
        if windows.is_empty() {
            tracing::debug!("scheduler evaluate: no monitoring windows available");
            return;
        }

        let mut picks: HashMap<i64, &WindowReport> = HashMap::new();
        for window in windows {
            match picks.get(&window.account_id) {
                Some(existing) if !more_conservative(window, existing) => {}
                _ => {
                    picks.insert(window.account_id, window);
                }
            }
        }

        for (account_id, window) in &picks {
            match &window.eta {
                Eta::AtLimit { .. } => {
                    self.stop(
                        *account_id,
                        StopReason::AtLimit,
                        Some(window.window_type.clone()),
                        Some(0.0),
                        window.resets_at,
                        now,
                    );
                }
                Eta::Projected { minutes_remaining, .. }
                    if *minutes_remaining < safety_margin_minutes =>
                {
                    self.stop(
                        *account_id,
                        StopReason::ApproachingLimit,
                        Some(window.window_type.clone()),
                        Some(*minutes_remaining),
                        window.resets_at,
                        now,
                    );
                }
                // Safe, no-data, or projected with enough headroom.
                _ => self.maybe_resume(*account_id, hysteresis_polls, now),
            }
        }

        tracing::debug!(accounts = picks.len(), "scheduler evaluate complete");
    }

    fn stop(
        &self,
        account_id: i64,
        reason: StopReason,
        window_type: Option<String>,
        eta_minutes: Option<f64>,
        resets_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        // Resume estimate: provider reset time wins, then the projected ETA
        // (at least one minute out), then a conservative 5-minute bump.
        let resume_estimate = resets_at.or_else(|| {
            let minutes = eta_minutes.map(|m| m.max(1.0)).unwrap_or(5.0);
            Some(now + Duration::seconds((minutes * 60.0) as i64))
        });

        let entry = SchedEntry {
            state: SchedState::Stopped,
            stop_reason: Some(reason),
            stop_window_type: window_type,
            stop_eta_minutes: eta_minutes,
            resume_estimate,
            consecutive_safe_polls: 0,
            updated_at: now,
        };
        self.replace(account_id, entry, now);
    }

    /// Hysteresis-damped resume: increment the safe-poll counter, and only
    /// transition `stopped → queued` once it reaches the threshold.
    fn maybe_resume(&self, account_id: i64, hysteresis_polls: u32, now: DateTime<Utc>) {
        let updated = {
            let mut states = self.states.lock();
            let Some(entry) = states.get_mut(&account_id) else {
                return;
            };
            if entry.state != SchedState::Stopped {
                return;
            }

            let polls = entry.consecutive_safe_polls + 1;
            if polls >= hysteresis_polls {
                *entry = SchedEntry::queued(now);
                tracing::info!(
                    account_id,
                    hysteresis_polls,
                    "scheduler: account resumed (stopped -> queued)"
                );
            } else {
                entry.consecutive_safe_polls = polls;
                entry.updated_at = now;
                tracing::debug!(
                    account_id,
                    safe_polls = polls,
                    needed = hysteresis_polls,
                    "scheduler: account still stopped"
                );
            }
            entry.clone()
        };
        self.persist(account_id, &updated);
    }

    /// Lifecycle hook, called before execution starts on an account.
    /// `queued → running`; never overrides `stopped`.
    pub fn mark_running(&self, account_id: i64) {
        let now = Utc::now();
        {
            let states = self.states.lock();
            if let Some(entry) = states.get(&account_id) {
                if entry.state == SchedState::Stopped {
                    tracing::info!(
                        account_id,
                        "scheduler: mark_running on stopped account, keeping stopped state"
                    );
                    return;
                }
            }
        }
        let mut entry = SchedEntry::queued(now);
        entry.state = SchedState::Running;
        self.replace(account_id, entry, now);
        tracing::info!(account_id, "scheduler: account marked running");
    }

    /// Lifecycle hook, called after execution finishes (in a finally arm).
    /// `running → queued`; preserves `stopped` set mid-execution.
    pub fn mark_completed(&self, account_id: i64) {
        let now = Utc::now();
        let transition = {
            let states = self.states.lock();
            match states.get(&account_id) {
                None => None,
                Some(entry) if entry.state == SchedState::Stopped => {
                    tracing::info!(
                        account_id,
                        "scheduler: mark_completed on stopped account, preserving stopped state"
                    );
                    None
                }
                Some(entry) if entry.state == SchedState::Running => Some(()),
                Some(entry) => {
                    tracing::debug!(
                        account_id,
                        state = entry.state.as_str(),
                        "scheduler: mark_completed no-op"
                    );
                    None
                }
            }
        };
        if transition.is_some() {
            self.replace(account_id, SchedEntry::queued(now), now);
            tracing::info!(account_id, "scheduler: account marked completed -> queued");
        }
    }

    /// Per-account states plus an aggregate summary.
    pub fn status(&self) -> (Vec<AccountSchedStatus>, SchedSummary) {
        let states = self.states.lock();
        let mut sessions = Vec::with_capacity(states.len());
        let mut summary = SchedSummary::default();
        for (account_id, entry) in states.iter() {
            sessions.push(AccountSchedStatus {
                account_id: *account_id,
                state: entry.state,
                stop_reason: entry.stop_reason,
                stop_window_type: entry.stop_window_type.clone(),
                stop_eta_minutes: entry.stop_eta_minutes,
                resume_estimate: entry.resume_estimate,
                consecutive_safe_polls: entry.consecutive_safe_polls,
                updated_at: entry.updated_at,
            });
            summary.total += 1;
            match entry.state {
                SchedState::Queued => summary.queued += 1,
                SchedState::Running => summary.running += 1,
                SchedState::Stopped => summary.stopped += 1,
            }
        }
        sessions.sort_by_key(|s| s.account_id);
        (sessions, summary)
    }

    /// State for one account.
    pub fn account_state(&self, account_id: i64) -> Option<AccountSchedStatus> {
        let states = self.states.lock();
        states.get(&account_id).map(|entry| AccountSchedStatus {
            account_id,
            state: entry.state,
            stop_reason: entry.stop_reason,
            stop_window_type: entry.stop_window_type.clone(),
            stop_eta_minutes: entry.stop_eta_minutes,
            resume_estimate: entry.resume_estimate,
            consecutive_safe_polls: entry.consecutive_safe_polls,
            updated_at: entry.updated_at,
        })
    }

    fn replace(&self, account_id: i64, entry: SchedEntry, now: DateTime<Utc>) {
        let old_state = {
            let mut states = self.states.lock();
            let old = states.get(&account_id).map(|e| e.state);
            states.insert(account_id, entry.clone());
            old
        };
        if old_state != Some(entry.state) {
            tracing::info!(
                account_id,
                from = old_state.map(|s| s.as_str()).unwrap_or("none"),
                to = entry.state.as_str(),
                reason = ?entry.stop_reason,
                at = %now,
                "scheduler state change"
            );
        }
        self.persist(account_id, &entry);
    }

    // Updates flow in-memory first, then to the store.
    fn persist(&self, account_id: i64, entry: &SchedEntry) {
        let row = SchedulerRow {
            account_id,
            state: entry.state,
            stop_reason: entry.stop_reason,
            stop_window_type: entry.stop_window_type.clone(),
            stop_eta_minutes: entry.stop_eta_minutes,
            resume_estimate: entry.resume_estimate,
            consecutive_safe_polls: entry.consecutive_safe_polls,
            updated_at: entry.updated_at,
        };
        if let Err(e) = self.store.upsert_scheduler_row(row) {
            tracing::warn!(account_id, err = %e, "failed to persist scheduler state");
        }
    }
}

/// Whether `candidate` is a more conservative pick than `existing`.
fn more_conservative(candidate: &WindowReport, existing: &WindowReport) -> bool {
    let new_pri = eta_priority(&candidate.eta);
    let old_pri = eta_priority(&existing.eta);
    if new_pri != old_pri {
        return new_pri > old_pri;
    }
    if new_pri == 3 {
        // Both projected: shorter remaining time wins.
        match (candidate.eta.minutes_remaining(), existing.eta.minutes_remaining()) {
            (Some(new), Some(old)) => new < old,
            (Some(_), None) => true,
            _ => false,
        }
    } else {
        false
    }
}

fn eta_priority(eta: &Eta) -> u8 {
    match eta {
        Eta::AtLimit { .. } => 4,
        Eta::Projected { .. } => 3,
        Eta::Safe { .. } => 1,
        Eta::NoData { .. } => 0,
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
