// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Autonomous-loop execution with a commit-tracking circuit breaker.
//!
//! ALL MONITOR STATE IS IN-MEMORY ONLY. A restart loses active monitors;
//! boot reconciliation does not resurrect them.
//!
//! The monitor polls every 30 s and compares the latest commit hash in the
//! session's working tree to the previously observed one. A new hash
//! advances the iteration counter; a stalled tree with no fresh output
//! increments a no-progress counter that trips the circuit breaker at the
//! configured threshold.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::backend::{ExecutionKind, ExecutionMode};
use crate::session::{SessionManager, SessionOptions};

use super::direct::session_report;
use super::{ExecutionHandler, HandlerConfig, MonitorReport, StartError, StartInfo};

/// Default poll cadence for the loop monitor.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Probe returning the latest commit hash of a working tree (empty string
/// when unavailable).
pub type CommitProbe = Arc<dyn Fn() -> String + Send + Sync>;

/// Loop configuration carried in the start request.
#[derive(Debug, Clone)]
pub struct RalphConfig {
    pub max_iterations: u32,
    pub completion_promise: String,
    pub task_description: String,
    pub no_progress_threshold: u32,
    /// Treat fresh PTY output as progress. A heuristic: CLIs that print
    /// periodic heartbeats can mask a true stall, so it can be disabled.
    pub count_output_as_progress: bool,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            completion_promise: "COMPLETE".to_owned(),
            task_description: "Complete the task.".to_owned(),
            no_progress_threshold: 3,
            count_output_as_progress: true,
        }
    }
}

#[derive(Debug, Clone)]
struct LoopState {
    iteration: u32,
    max_iterations: u32,
    last_commit_hash: String,
    last_output_lines: usize,
    no_progress_count: u32,
    triggered: bool,
    active: bool,
}

struct LoopEntry {
    state: Mutex<LoopState>,
    cancel: CancellationToken,
}

/// Tracks loop progress per session and trips the circuit breaker.
pub struct LoopMonitor {
    manager: Arc<SessionManager>,
    monitors: Mutex<HashMap<String, Arc<LoopEntry>>>,
    interval: Duration,
}

impl LoopMonitor {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self::with_interval(manager, MONITOR_INTERVAL)
    }

    /// Custom poll interval (tests use short ones).
    pub fn with_interval(manager: Arc<SessionManager>, interval: Duration) -> Self {
        Self { manager, monitors: Mutex::new(HashMap::new()), interval }
    }

    /// Start monitoring a loop session.
    pub fn start_monitoring(
        self: &Arc<Self>,
        session_id: &str,
        probe: CommitProbe,
        max_iterations: u32,
        no_progress_threshold: u32,
        count_output_as_progress: bool,
    ) {
        let entry = Arc::new(LoopEntry {
            state: Mutex::new(LoopState {
                iteration: 0,
                max_iterations,
                last_commit_hash: probe(),
                last_output_lines: 0,
                no_progress_count: 0,
                triggered: false,
                active: true,
            }),
            cancel: CancellationToken::new(),
        });
        self.monitors.lock().insert(session_id.to_owned(), Arc::clone(&entry));

        let monitor = Arc::clone(self);
        let task_session_id = session_id.to_owned();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so the first
            // real check happens one interval in.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = entry.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if !monitor
                    .tick(&task_session_id, &entry, &probe, no_progress_threshold, count_output_as_progress)
                    .await
                {
                    return;
                }
            }
        });

        tracing::info!(
            session_id,
            max_iterations,
            no_progress_threshold,
            "started loop monitor"
        );
    }

    /// One monitor cycle. Returns `false` when monitoring should end.
    async fn tick(
        &self,
        session_id: &str,
        entry: &LoopEntry,
        probe: &CommitProbe,
        threshold: u32,
        count_output_as_progress: bool,
    ) -> bool {
        let current_hash = probe();
        let info = self.manager.session_info(session_id);

        let triggered = {
            let mut state = entry.state.lock();
            if !state.active {
                return false;
            }

            if !current_hash.is_empty() && current_hash != state.last_commit_hash {
                // New commit: real progress.
                state.iteration += 1;
                state.last_commit_hash = current_hash;
                state.no_progress_count = 0;
                self.manager.broadcast(
                    session_id,
                    "ralph_iteration",
                    json!({
                        "iteration": state.iteration,
                        "max_iterations": state.max_iterations,
                    }),
                );
                tracing::debug!(session_id, iteration = state.iteration, "loop iteration");
            } else if let Some(info) =
                info.as_ref().filter(|i| i.status == crate::backend::SessionStatus::Active)
            {
                // No new commit: fresh PTY output since the last tick keeps
                // the session counted as working (unless disabled).
                let produced = info.output_lines > state.last_output_lines;
                state.last_output_lines = info.output_lines;
                if produced && count_output_as_progress {
                    state.no_progress_count = 0;
                } else {
                    state.no_progress_count += 1;
                }
            } else {
                state.active = false;
                return false;
            }

            if state.no_progress_count >= threshold {
                state.triggered = true;
                state.active = false;
                tracing::warn!(
                    session_id,
                    no_progress = state.no_progress_count,
                    "circuit breaker triggered"
                );
                self.manager.broadcast(
                    session_id,
                    "circuit_breaker",
                    json!({
                        "reason": "no_progress",
                        "iterations_without_progress": state.no_progress_count,
                    }),
                );
                true
            } else {
                false
            }
        };

        if triggered {
            // Stop outside the state lock.
            self.manager.stop(session_id).await;
            return false;
        }
        true
    }

    /// Stop monitoring and drop the entry.
    pub fn stop_monitoring(&self, session_id: &str) {
        if let Some(entry) = self.monitors.lock().remove(session_id) {
            entry.state.lock().active = false;
            entry.cancel.cancel();
            tracing::info!(session_id, "stopped loop monitor");
        }
    }

    /// Snapshot of the monitor state for a session.
    pub fn get_state(&self, session_id: &str) -> Option<Value> {
        let monitors = self.monitors.lock();
        let entry = monitors.get(session_id)?;
        let state = entry.state.lock();
        Some(json!({
            "iteration": state.iteration,
            "max_iterations": state.max_iterations,
            "last_commit_hash": state.last_commit_hash,
            "no_progress_count": state.no_progress_count,
            "triggered": state.triggered,
            "active": state.active,
        }))
    }
}

/// Probe the latest commit hash via `git log -1 --format=%H`.
pub fn git_commit_probe(cwd: &Path) -> CommitProbe {
    let cwd = cwd.to_path_buf();
    Arc::new(move || {
        std::process::Command::new("git")
            .args(["log", "-1", "--format=%H"])
            .current_dir(&cwd)
            .output()
            .ok()
            .filter(|out| out.status.success())
            .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_owned())
            .unwrap_or_default()
    })
}

/// Handler for autonomous-loop sessions.
pub struct RalphHandler {
    manager: Arc<SessionManager>,
    monitor: Arc<LoopMonitor>,
    idle_timeout: Duration,
    max_lifetime: Duration,
    /// Claude settings file consulted for the plugin prerequisite.
    settings_path: PathBuf,
}

impl RalphHandler {
    pub fn new(
        manager: Arc<SessionManager>,
        monitor: Arc<LoopMonitor>,
        idle_timeout: Duration,
        max_lifetime: Duration,
        settings_path: PathBuf,
    ) -> Self {
        Self { manager, monitor, idle_timeout, max_lifetime, settings_path }
    }

    pub fn monitor_state(&self, session_id: &str) -> Option<Value> {
        self.monitor.get_state(session_id)
    }

    /// The loop plugin must be enabled in the Claude settings before a
    /// loop session can start.
    fn check_plugin(&self) -> Result<(), StartError> {
        let missing = || {
            StartError::with_hint(
                "ralph-wiggum plugin not installed",
                "Run: claude plugin install ralph-wiggum@official --scope user",
            )
        };
        let contents = std::fs::read_to_string(&self.settings_path).map_err(|_| missing())?;
        let settings: Value = serde_json::from_str(&contents).map_err(|_| missing())?;
        let enabled = settings["enabledPlugins"].as_array().cloned().unwrap_or_default();
        let found = enabled
            .iter()
            .filter_map(Value::as_str)
            .any(|p| p.to_lowercase().contains("ralph-wiggum"));
        if found {
            Ok(())
        } else {
            Err(missing())
        }
    }
}

impl ExecutionHandler for RalphHandler {
    fn start(
        &self,
        config: HandlerConfig,
    ) -> Pin<Box<dyn Future<Output = Result<StartInfo, StartError>> + Send + '_>> {
        Box::pin(async move {
            self.check_plugin()?;

            let ralph = config.ralph.unwrap_or_default();
            let prompt = format!(
                "/ralph-loop \"{}\" --max-iterations {} --completion-promise \"{}\"",
                ralph.task_description, ralph.max_iterations, ralph.completion_promise
            );
            let command = vec![
                "claude".to_owned(),
                "-p".to_owned(),
                prompt,
                "--dangerously-skip-permissions".to_owned(),
            ];

            let session_id = self
                .manager
                .create(SessionOptions {
                    project_id: config.project_id,
                    command,
                    cwd: config.cwd.clone(),
                    env: HashMap::new(),
                    worktree_path: config.worktree_path,
                    execution_type: ExecutionKind::RalphLoop,
                    execution_mode: ExecutionMode::Autonomous,
                    idle_timeout: self.idle_timeout,
                    max_lifetime: self.max_lifetime,
                })
                .map_err(|e| StartError::new(format!("session start failed: {e}")))?;

            self.monitor.start_monitoring(
                &session_id,
                git_commit_probe(&config.cwd),
                ralph.max_iterations,
                ralph.no_progress_threshold,
                ralph.count_output_as_progress,
            );

            let pid = self.manager.session_info(&session_id).map(|i| i.pid).unwrap_or(0);
            Ok(StartInfo { session_id, pid, status: "active".to_owned(), team_name: None })
        })
    }

    fn monitor(&self, session_id: &str) -> MonitorReport {
        let mut report = session_report(&self.manager, session_id);
        if let Some(state) = self.monitor.get_state(session_id) {
            report.extra.insert("iteration".to_owned(), state["iteration"].clone());
            report
                .extra
                .insert("max_iterations".to_owned(), state["max_iterations"].clone());
            report
                .extra
                .insert("circuit_breaker_triggered".to_owned(), state["triggered"].clone());
        }
        report
    }

    fn stop(&self, session_id: &str) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let session_id = session_id.to_owned();
        Box::pin(async move {
            self.monitor.stop_monitoring(&session_id);
            self.manager.stop(&session_id).await
        })
    }

    fn get_output(&self, session_id: &str, last_n: usize) -> Vec<String> {
        self.manager.get_output(session_id, last_n)
    }
}

#[cfg(test)]
#[path = "ralph_tests.rs"]
mod tests;
