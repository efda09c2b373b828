// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end flows across components: monitor report → scheduler
//! evaluation → orchestrator admission, and PTY sessions streaming to
//! subscribers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use corral::backend::{BackendKind, ExecutionKind, ExecutionMode, SessionStatus};
use corral::monitor::{RateLimitMonitor, ThresholdLevel};
use corral::orchestrator::{ExecutionOutcome, ExecutionRequest, Executor, Orchestrator};
use corral::provider::UsageClient;
use corral::scheduler::{AdmissionScheduler, SchedState};
use corral::session::{SessionManager, SessionOptions};
use corral::store::{AccountRow, ChainEntry, MemoryStore, SnapshotRow, Store};

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap_or_default()
}

fn account(id: i64, backend: BackendKind) -> AccountRow {
    AccountRow {
        id,
        backend,
        name: format!("acct-{id}"),
        email: None,
        config_path: None,
        api_key_env: None,
        is_default: id == 1,
        plan: None,
        rate_limited_until: None,
        rate_limit_reason: None,
        last_used_at: None,
        total_executions: 0,
    }
}

fn snapshot(account_id: i64, pct: f64, minutes_ago: i64) -> SnapshotRow {
    SnapshotRow {
        account_id,
        backend: BackendKind::Claude,
        window_type: "five_hour".to_owned(),
        tokens_used: 0,
        tokens_limit: 0,
        percentage: pct,
        threshold_level: ThresholdLevel::from_percentage(pct),
        resets_at: None,
        recorded_at: t0() - chrono::Duration::minutes(minutes_ago),
    }
}

struct CountingExecutor {
    calls: Mutex<Vec<Option<i64>>>,
}

impl Executor for CountingExecutor {
    fn run(
        &self,
        request: ExecutionRequest,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ExecutionOutcome> + Send + '_>> {
        Box::pin(async move {
            self.calls.lock().push(request.account_id);
            ExecutionOutcome {
                execution_id: Some(format!("exec-{}", request.account_id.unwrap_or(0))),
                rate_limited_cooldown: None,
            }
        })
    }
}

/// A hot account is stopped by the scheduler after a monitor report, the
/// orchestrator skips it, and two safe evaluations bring it back.
#[tokio::test]
async fn monitor_to_scheduler_to_orchestrator_pipeline() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.put_account(account(1, BackendKind::Claude));
    store.put_account(account(2, BackendKind::Claude));
    store.put_chain(
        "trig-1",
        vec![
            ChainEntry { backend: BackendKind::Claude, account_id: Some(1) },
            ChainEntry { backend: BackendKind::Claude, account_id: Some(2) },
        ],
    );

    // Account 1 climbs steeply toward its limit; account 2 is calm.
    for (pct, minutes_ago) in [(60.0, 20i64), (80.0, 10), (99.5, 0)] {
        store.insert_snapshot(snapshot(1, pct, minutes_ago))?;
    }
    store.insert_snapshot(snapshot(2, 5.0, 10))?;
    store.insert_snapshot(snapshot(2, 5.0, 0))?;

    let monitor =
        RateLimitMonitor::new(Arc::clone(&store) as Arc<dyn Store>, UsageClient::new());
    let scheduler =
        Arc::new(AdmissionScheduler::new(Arc::clone(&store) as Arc<dyn Store>));

    // One evaluation pass over the monitor's enriched report.
    let status = monitor.status(t0()).await;
    scheduler.evaluate_all(&status.windows, 5.0, 2, t0());
    assert_eq!(scheduler.account_state(1).map(|s| s.state), Some(SchedState::Stopped));

    // The orchestrator routes around the stopped account.
    let executor = Arc::new(CountingExecutor { calls: Mutex::new(Vec::new()) });
    let orchestrator = Orchestrator::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&scheduler),
        None,
        Arc::clone(&executor) as Arc<dyn Executor>,
    );
    let result = orchestrator
        .execute_with_fallback("trig-1", "hello", BackendKind::Claude)
        .await;
    assert_eq!(result.as_deref(), Some("exec-2"));
    assert_eq!(executor.calls.lock().as_slice(), &[Some(2)]);

    // Two safe polls later (usage dropped after the window reset) the
    // account is queued again.
    store.insert_snapshot(snapshot(1, 20.0, -5))?;
    let status = monitor.status(t0()).await;
    scheduler.evaluate_all(&status.windows, 5.0, 2, t0());
    scheduler.evaluate_all(&status.windows, 5.0, 2, t0());
    assert_eq!(scheduler.account_state(1).map(|s| s.state), Some(SchedState::Queued));
    Ok(())
}

/// A PTY session's lines reach a subscriber in push order with the
/// terminal complete event last.
#[tokio::test]
async fn session_stream_ordering() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(SessionManager::new(
        Arc::clone(&store) as Arc<dyn Store>,
        1000,
        Duration::from_secs(5),
    ));

    let id = manager.create(SessionOptions {
        project_id: "proj-1".to_owned(),
        command: vec![
            "sh".into(),
            "-c".into(),
            "for i in 1 2 3 4 5; do echo seq-$i; done".into(),
        ],
        cwd: std::env::temp_dir(),
        env: HashMap::new(),
        worktree_path: None,
        execution_type: ExecutionKind::Direct,
        execution_mode: ExecutionMode::Autonomous,
        idle_timeout: Duration::from_secs(3600),
        max_lifetime: Duration::from_secs(14_400),
    })?;

    let mut sub = manager.subscribe(&id);
    let mut seen = Vec::new();
    let mut complete_last = false;
    while let Some(block) = sub.next().await {
        if block.starts_with("event: output") {
            if let Some(n) = block.find("seq-") {
                seen.push(block[n + 4..n + 5].to_owned());
            }
            complete_last = false;
        }
        if block.starts_with("event: complete") {
            complete_last = true;
        }
    }

    assert_eq!(seen, vec!["1", "2", "3", "4", "5"]);
    assert!(complete_last, "complete must be the final event");

    // After completion no session output can follow; the persisted row is
    // terminal.
    let row = store.session(&id).ok_or_else(|| anyhow::anyhow!("missing row"))?;
    assert_eq!(row.status, SessionStatus::Completed);
    Ok(())
}
