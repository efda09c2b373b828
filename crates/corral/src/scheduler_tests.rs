// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use crate::monitor::{Eta, ThresholdLevel, WindowReport};
use crate::store::MemoryStore;

use super::*;

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap_or_default()
}

fn window(account_id: i64, window_type: &str, eta: Eta) -> WindowReport {
    WindowReport {
        account_id,
        account_name: format!("acct-{account_id}"),
        plan: String::new(),
        backend_type: "claude".to_owned(),
        window_type: window_type.to_owned(),
        tokens_used: 0,
        tokens_limit: 0,
        percentage: 50.0,
        threshold_level: ThresholdLevel::Info,
        resets_at: None,
        recorded_at: Some(t0()),
        consumption_rates: None,
        eta,
        shared_with: Vec::new(),
        no_data: false,
    }
}

fn projected(minutes: f64) -> Eta {
    Eta::Projected {
        eta: t0() + chrono::Duration::minutes(minutes as i64),
        minutes_remaining: minutes,
        message: format!("~{}m", minutes as i64),
    }
}

fn safe() -> Eta {
    Eta::Safe { message: "Usage declining".to_owned(), resets_at: None }
}

fn scheduler() -> (AdmissionScheduler, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (AdmissionScheduler::new(Arc::clone(&store) as Arc<dyn crate::store::Store>), store)
}

#[test]
fn at_limit_stops_account() {
    let (sched, _) = scheduler();
    let windows = vec![window(1, "five_hour", Eta::AtLimit { message: "x".to_owned() })];
    sched.evaluate_all(&windows, 5.0, 2, t0());

    let state = sched.account_state(1);
    assert_eq!(state.as_ref().map(|s| s.state), Some(SchedState::Stopped));
    assert_eq!(state.as_ref().and_then(|s| s.stop_reason), Some(StopReason::AtLimit));
    assert_eq!(state.as_ref().and_then(|s| s.stop_eta_minutes), Some(0.0));
    assert!(state.and_then(|s| s.resume_estimate).is_some());

    let check = sched.check_eligibility(1);
    assert!(!check.eligible);
    assert_eq!(check.reason, "scheduler_paused");
}

#[test]
fn projected_inside_safety_margin_stops() {
    let (sched, _) = scheduler();
    sched.evaluate_all(&[window(1, "five_hour", projected(3.0))], 5.0, 2, t0());
    let state = sched.account_state(1);
    assert_eq!(state.as_ref().map(|s| s.state), Some(SchedState::Stopped));
    assert_eq!(
        state.and_then(|s| s.stop_reason),
        Some(StopReason::ApproachingLimit)
    );
}

#[test]
fn projected_with_headroom_stays_eligible() {
    let (sched, _) = scheduler();
    sched.evaluate_all(&[window(1, "five_hour", projected(45.0))], 5.0, 2, t0());
    // No prior state and a safe ETA: account is simply untracked/eligible.
    assert!(sched.check_eligibility(1).eligible);
}

#[test]
fn most_conservative_window_wins() {
    let (sched, _) = scheduler();
    let windows = vec![
        window(1, "seven_day", safe()),
        window(1, "five_hour", projected(2.0)),
        window(1, "seven_day_sonnet", projected(30.0)),
    ];
    sched.evaluate_all(&windows, 5.0, 2, t0());

    let state = sched.account_state(1);
    assert_eq!(state.as_ref().map(|s| s.state), Some(SchedState::Stopped));
    // The shortest projected window drove the stop.
    assert_eq!(
        state.and_then(|s| s.stop_window_type),
        Some("five_hour".to_owned())
    );
}

#[test]
fn hysteresis_two_safe_polls_to_resume() {
    let (sched, _) = scheduler();
    let t = t0();

    sched.evaluate_all(&[window(1, "five_hour", Eta::AtLimit { message: "x".to_owned() })], 5.0, 2, t);
    assert_eq!(sched.account_state(1).map(|s| s.state), Some(SchedState::Stopped));

    // First safe poll: still stopped, counter at 1.
    sched.evaluate_all(&[window(1, "five_hour", safe())], 5.0, 2, t + chrono::Duration::minutes(5));
    let state = sched.account_state(1);
    assert_eq!(state.as_ref().map(|s| s.state), Some(SchedState::Stopped));
    assert_eq!(state.map(|s| s.consecutive_safe_polls), Some(1));

    // Second safe poll: resumed, counter reset.
    sched.evaluate_all(&[window(1, "five_hour", safe())], 5.0, 2, t + chrono::Duration::minutes(10));
    let state = sched.account_state(1);
    assert_eq!(state.as_ref().map(|s| s.state), Some(SchedState::Queued));
    assert_eq!(state.map(|s| s.consecutive_safe_polls), Some(0));
    assert!(sched.check_eligibility(1).eligible);
}

#[test]
fn unsafe_poll_resets_hysteresis_counter() {
    let (sched, _) = scheduler();
    let t = t0();

    sched.evaluate_all(&[window(1, "w", Eta::AtLimit { message: "x".to_owned() })], 5.0, 3, t);
    sched.evaluate_all(&[window(1, "w", safe())], 5.0, 3, t);
    assert_eq!(sched.account_state(1).map(|s| s.consecutive_safe_polls), Some(1));

    // A fresh stop zeroes the counter.
    sched.evaluate_all(&[window(1, "w", Eta::AtLimit { message: "x".to_owned() })], 5.0, 3, t);
    assert_eq!(sched.account_state(1).map(|s| s.consecutive_safe_polls), Some(0));
}

#[test]
fn lifecycle_hooks_roundtrip() {
    let (sched, _) = scheduler();
    sched.mark_running(1);
    assert_eq!(sched.account_state(1).map(|s| s.state), Some(SchedState::Running));
    sched.mark_completed(1);
    assert_eq!(sched.account_state(1).map(|s| s.state), Some(SchedState::Queued));
}

#[test]
fn lifecycle_hooks_never_override_stopped() {
    let (sched, _) = scheduler();
    sched.evaluate_all(&[window(1, "w", Eta::AtLimit { message: "x".to_owned() })], 5.0, 2, t0());

    sched.mark_running(1);
    assert_eq!(sched.account_state(1).map(|s| s.state), Some(SchedState::Stopped));

    sched.mark_completed(1);
    assert_eq!(sched.account_state(1).map(|s| s.state), Some(SchedState::Stopped));
}

#[test]
fn mark_completed_without_session_is_noop() {
    let (sched, _) = scheduler();
    sched.mark_completed(42);
    assert!(sched.account_state(42).is_none());
}

#[test]
fn state_persists_and_reloads() {
    let (sched, store) = scheduler();
    sched.evaluate_all(&[window(7, "w", Eta::AtLimit { message: "x".to_owned() })], 5.0, 2, t0());

    // A new scheduler instance over the same store sees the stopped state.
    let sched2 = AdmissionScheduler::new(store as Arc<dyn crate::store::Store>);
    sched2.load_from_store();
    assert_eq!(sched2.account_state(7).map(|s| s.state), Some(SchedState::Stopped));
    assert!(!sched2.check_eligibility(7).eligible);
}

#[test]
fn resume_estimate_prefers_reset_time() {
    let (sched, _) = scheduler();
    let resets = t0() + chrono::Duration::hours(2);
    let mut w = window(1, "w", Eta::AtLimit { message: "x".to_owned() });
    w.resets_at = Some(resets);
    sched.evaluate_all(&[w], 5.0, 2, t0());
    assert_eq!(sched.account_state(1).and_then(|s| s.resume_estimate), Some(resets));
}

#[test]
fn resume_estimate_floors_eta_at_one_minute() {
    let (sched, _) = scheduler();
    sched.evaluate_all(&[window(1, "w", projected(0.2))], 5.0, 2, t0());
    let estimate = sched.account_state(1).and_then(|s| s.resume_estimate);
    assert_eq!(estimate, Some(t0() + chrono::Duration::minutes(1)));
}

#[test]
fn summary_counts_states() {
    let (sched, _) = scheduler();
    sched.mark_running(1);
    sched.mark_running(2);
    sched.mark_completed(2);
    sched.evaluate_all(&[window(3, "w", Eta::AtLimit { message: "x".to_owned() })], 5.0, 2, t0());

    let (sessions, summary) = sched.status();
    assert_eq!(sessions.len(), 3);
    assert_eq!(summary.total, 3);
    assert_eq!(summary.running, 1);
    assert_eq!(summary.queued, 1);
    assert_eq!(summary.stopped, 1);
}
