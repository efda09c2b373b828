// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process wiring: construct every service, reconcile persisted state,
//! spawn the periodic jobs, and serve HTTP until shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::channel::StateChannel;
use crate::config::Config;
use crate::handlers::{
    DirectHandler, HandlerRegistry, LoopMonitor, RalphHandler, TeamHandler, TeamMonitor,
};
use crate::monitor::RateLimitMonitor;
use crate::provider::UsageClient;
use crate::scheduler::AdmissionScheduler;
use crate::session::SessionManager;
use crate::store::{MemoryStore, Store};
use crate::transport::{router, AppState};

/// Cadence of the resource-limit sweep.
const LIMIT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
/// Cadence of the monitor scheduling tick (the poll itself runs every
/// `polling_minutes`).
const MONITOR_TICK: Duration = Duration::from_secs(60);
/// Cadence of the snapshot retention cleanup.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Run the control plane until shutdown.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    // reqwest is built without a default TLS provider; install ring once.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let shutdown = CancellationToken::new();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

    let heartbeat = Duration::from_secs(config.heartbeat);
    let idle_timeout = Duration::from_secs(config.idle_timeout);
    let max_lifetime = Duration::from_secs(config.max_lifetime);

    let manager =
        Arc::new(SessionManager::new(Arc::clone(&store), config.ring_lines, heartbeat));
    let channel = Arc::new(StateChannel::new());
    let monitor = Arc::new(RateLimitMonitor::new(Arc::clone(&store), UsageClient::new()));
    let scheduler = Arc::new(AdmissionScheduler::new(Arc::clone(&store)));

    // Boot reconciliation: dead-PID sessions become failed, scheduler rows
    // and threshold levels reload. Timers restart from zero by design.
    manager.cleanup_dead_sessions();
    scheduler.load_from_store();
    monitor.seed_threshold_levels(Utc::now());

    let claude_dir = claude_home();
    let loop_monitor = Arc::new(LoopMonitor::new(Arc::clone(&manager)));
    let team_monitor = Arc::new(TeamMonitor::new(Arc::clone(&manager)));
    let registry = HandlerRegistry::new(
        Arc::new(DirectHandler::new(Arc::clone(&manager), idle_timeout, max_lifetime)),
        Arc::new(RalphHandler::new(
            Arc::clone(&manager),
            loop_monitor,
            idle_timeout,
            max_lifetime,
            claude_dir.join("settings.json"),
        )),
        Arc::new(TeamHandler::new(
            Arc::clone(&manager),
            team_monitor,
            idle_timeout,
            max_lifetime,
            claude_dir,
        )),
    );

    spawn_monitor_job(
        Arc::clone(&monitor),
        Arc::clone(&scheduler),
        Arc::clone(&store),
        shutdown.clone(),
    );
    spawn_cleanup_job(Arc::clone(&monitor), shutdown.clone());
    spawn_limit_job(Arc::clone(&manager), shutdown.clone());

    let state = Arc::new(AppState {
        manager,
        channel,
        monitor,
        scheduler,
        registry,
        store,
        heartbeat,
        shutdown: shutdown.clone(),
    });

    // Ctrl-C triggers the same graceful shutdown as POST /shutdown.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    let app = router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(addr = %addr, "corral listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("server error")?;

    tracing::info!("corral shut down");
    Ok(())
}

fn claude_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
        .join(".claude")
}

/// Monitor poll job: ticks every minute, polls when `polling_minutes` have
/// elapsed (so reconfiguration applies without re-registering the job),
/// then delegates to the scheduler evaluation.
fn spawn_monitor_job(
    monitor: Arc<RateLimitMonitor>,
    scheduler: Arc<AdmissionScheduler>,
    store: Arc<dyn Store>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MONITOR_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_poll: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let config = match store.monitor_config() {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(err = %e, "monitor job: config load failed");
                    continue;
                }
            };
            if !config.enabled {
                continue;
            }

            let due = last_poll
                .map(|t| t.elapsed() >= Duration::from_secs(config.polling_minutes as u64 * 60))
                .unwrap_or(true);
            if !due {
                continue;
            }
            last_poll = Some(tokio::time::Instant::now());

            let now = Utc::now();
            monitor.poll_once(now).await;

            let status = monitor.status(now).await;
            scheduler.evaluate_all(
                &status.windows,
                config.safety_margin_minutes,
                config.resume_hysteresis_polls,
                now,
            );
        }
    });
}

fn spawn_cleanup_job(monitor: Arc<RateLimitMonitor>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip the immediate first tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            monitor.cleanup_old_snapshots(Utc::now());
        }
    });
}

fn spawn_limit_job(manager: Arc<SessionManager>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LIMIT_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            manager.check_resource_limits().await;
        }
    });
}
