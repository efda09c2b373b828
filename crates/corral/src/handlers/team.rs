// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Team-spawn execution: a session with the experimental agent-teams
//! feature enabled, plus filesystem monitoring of the per-team config and
//! task directories.
//!
//! ALL MONITOR STATE IS IN-MEMORY ONLY. A restart loses active watchers.
//!
//! Uses `notify` watchers for real-time updates and a 5 s polling fallback
//! that catches events batched or dropped by the platform notifier.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::backend::{ExecutionKind, ExecutionMode};
use crate::session::{SessionManager, SessionOptions};

use super::direct::session_report;
use super::{ExecutionHandler, HandlerConfig, MonitorReport, StartError, StartInfo};

/// Polling fallback cadence.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

const TEAMS_ENV: &str = "CLAUDE_CODE_EXPERIMENTAL_AGENT_TEAMS";

/// Team configuration carried in the start request.
#[derive(Debug, Clone)]
pub struct TeamConfig {
    pub team_size: u32,
    pub task_description: String,
    pub roles: Vec<String>,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self { team_size: 3, task_description: String::new(), roles: Vec::new() }
    }
}

struct TeamEntry {
    team_name: String,
    teams_dir: PathBuf,
    tasks_dir: PathBuf,
    members: Mutex<Vec<Value>>,
    tasks: Mutex<Vec<Value>>,
    last_config_mtime: Mutex<Option<SystemTime>>,
    known_task_files: Mutex<HashMap<String, SystemTime>>,
    // Kept alive for the watcher thread; dropped on stop.
    watcher: Mutex<Option<RecommendedWatcher>>,
    cancel: CancellationToken,
}

/// Watches per-team directories and broadcasts `team_update` deltas on the
/// owning session's channel.
pub struct TeamMonitor {
    manager: Arc<SessionManager>,
    monitors: Mutex<HashMap<String, Arc<TeamEntry>>>,
    poll_interval: Duration,
}

impl TeamMonitor {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self::with_poll_interval(manager, POLL_INTERVAL)
    }

    pub fn with_poll_interval(manager: Arc<SessionManager>, poll_interval: Duration) -> Self {
        Self { manager, monitors: Mutex::new(HashMap::new()), poll_interval }
    }

    /// Start watching a team's directories under `claude_dir`
    /// (`<claude_dir>/teams/<team>` and `<claude_dir>/tasks/<team>`).
    pub fn start_monitoring(
        self: &Arc<Self>,
        session_id: &str,
        team_name: &str,
        claude_dir: &Path,
    ) {
        let teams_dir = claude_dir.join("teams").join(team_name);
        let tasks_dir = claude_dir.join("tasks").join(team_name);
        // The team may not exist yet; the CLI will populate these.
        let _ = std::fs::create_dir_all(&teams_dir);
        let _ = std::fs::create_dir_all(&tasks_dir);

        let entry = Arc::new(TeamEntry {
            team_name: team_name.to_owned(),
            teams_dir: teams_dir.clone(),
            tasks_dir: tasks_dir.clone(),
            members: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            last_config_mtime: Mutex::new(None),
            known_task_files: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        self.monitors.lock().insert(session_id.to_owned(), Arc::clone(&entry));

        // Real-time watcher. Failure is tolerable: the polling fallback
        // still covers the directories.
        let watch_monitor = Arc::clone(self);
        let watch_entry = Arc::clone(&entry);
        let watch_session = session_id.to_owned();
        let watcher = notify::recommended_watcher(
            move |event: Result<notify::Event, notify::Error>| match event {
                Ok(event)
                    if matches!(
                        event.kind,
                        notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                    ) =>
                {
                    for path in &event.paths {
                        watch_monitor.process_path(&watch_session, &watch_entry, path);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(err = %e, "team watcher error"),
            },
        );
        match watcher {
            Ok(mut watcher) => {
                let _ = watcher.watch(&teams_dir, RecursiveMode::Recursive);
                let _ = watcher.watch(&tasks_dir, RecursiveMode::Recursive);
                *entry.watcher.lock() = Some(watcher);
            }
            Err(e) => {
                tracing::warn!(session_id, err = %e, "team watcher setup failed, polling only");
            }
        }

        // Polling fallback for platforms that batch or drop events.
        let poll_monitor = Arc::clone(self);
        let poll_entry = Arc::clone(&entry);
        let poll_session = session_id.to_owned();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_monitor.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = poll_entry.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                poll_monitor.poll_tick(&poll_session, &poll_entry);
            }
        });

        tracing::info!(
            session_id,
            team_name,
            teams_dir = %teams_dir.display(),
            tasks_dir = %tasks_dir.display(),
            "started team monitor"
        );
    }

    /// Handle one changed path: team config or task file.
    fn process_path(&self, session_id: &str, entry: &TeamEntry, path: &Path) {
        let path_str = path.to_string_lossy();
        if !path_str.contains(&entry.team_name) {
            return;
        }
        if path_str.ends_with("config.json") {
            if let Some(team_data) = parse_team_config(path) {
                *entry.members.lock() =
                    team_data["members"].as_array().cloned().unwrap_or_default();
                self.manager.broadcast(
                    session_id,
                    "team_update",
                    json!({ "type": "config", "data": team_data }),
                );
            }
        } else if path_str.contains("/tasks/") {
            if let Some(task_data) = parse_task(path) {
                upsert_task(&mut entry.tasks.lock(), &task_data);
                self.manager.broadcast(
                    session_id,
                    "team_update",
                    json!({ "type": "task", "data": task_data }),
                );
            }
        }
    }

    /// Polling fallback: compare mtimes against the last seen ones.
    fn poll_tick(&self, session_id: &str, entry: &TeamEntry) {
        let config_path = entry.teams_dir.join("config.json");
        if let Ok(mtime) = std::fs::metadata(&config_path).and_then(|m| m.modified()) {
            let newer = {
                let mut last = entry.last_config_mtime.lock();
                let newer = last.map(|seen| mtime > seen).unwrap_or(true);
                if newer {
                    *last = Some(mtime);
                }
                newer
            };
            if newer {
                self.process_path(session_id, entry, &config_path);
            }
        }

        let Ok(dir) = std::fs::read_dir(&entry.tasks_dir) else {
            return;
        };
        for dirent in dir.flatten() {
            let path = dirent.path();
            if !path.is_file() {
                continue;
            }
            let Ok(mtime) = dirent.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            let name = dirent.file_name().to_string_lossy().into_owned();
            let newer = {
                let mut known = entry.known_task_files.lock();
                let newer = known.get(&name).map(|seen| mtime > *seen).unwrap_or(true);
                if newer {
                    known.insert(name, mtime);
                }
                newer
            };
            if newer {
                self.process_path(session_id, entry, &path);
            }
        }
    }

    /// Stop watching and drop the entry.
    pub fn stop_monitoring(&self, session_id: &str) {
        if let Some(entry) = self.monitors.lock().remove(session_id) {
            entry.cancel.cancel();
            // Dropping the watcher stops its thread.
            *entry.watcher.lock() = None;
            tracing::info!(session_id, "stopped team monitor");
        }
    }

    /// Current team state for a session.
    pub fn get_state(&self, session_id: &str) -> Option<Value> {
        let monitors = self.monitors.lock();
        let entry = monitors.get(session_id)?;
        Some(json!({
            "team_name": entry.team_name,
            "members": *entry.members.lock(),
            "tasks": *entry.tasks.lock(),
        }))
    }
}

fn parse_team_config(path: &Path) -> Option<Value> {
    let contents = std::fs::read_to_string(path).ok()?;
    let data: Value = serde_json::from_str(&contents).ok()?;
    let members = data["members"]
        .as_array()
        .or(data["teammates"].as_array())
        .cloned()
        .unwrap_or_default();
    Some(json!({
        "members": members,
        "name": data["name"].as_str().unwrap_or(""),
        "config": data,
    }))
}

fn parse_task(path: &Path) -> Option<Value> {
    let contents = std::fs::read_to_string(path).ok()?;
    let data: Value = serde_json::from_str(&contents).ok()?;
    Some(json!({
        "id": data["id"].as_str().unwrap_or(""),
        "status": data["status"].as_str().unwrap_or("unknown"),
        "assignee": data["assignee"].as_str().unwrap_or(""),
        "description": data["description"].as_str().unwrap_or(""),
        "file": path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default(),
    }))
}

/// Replace a task with a matching id/file, or append it.
fn upsert_task(tasks: &mut Vec<Value>, task: &Value) {
    let key = |t: &Value| {
        t["id"]
            .as_str()
            .filter(|id| !id.is_empty())
            .or(t["file"].as_str())
            .map(str::to_owned)
    };
    let task_key = key(task);
    for existing in tasks.iter_mut() {
        if key(existing) == task_key {
            *existing = task.clone();
            return;
        }
    }
    tasks.push(task.clone());
}

/// Handler for team-spawn sessions.
pub struct TeamHandler {
    manager: Arc<SessionManager>,
    monitor: Arc<TeamMonitor>,
    idle_timeout: Duration,
    max_lifetime: Duration,
    /// `~/.claude` in production; injected for tests.
    claude_dir: PathBuf,
}

impl TeamHandler {
    pub fn new(
        manager: Arc<SessionManager>,
        monitor: Arc<TeamMonitor>,
        idle_timeout: Duration,
        max_lifetime: Duration,
        claude_dir: PathBuf,
    ) -> Self {
        Self { manager, monitor, idle_timeout, max_lifetime, claude_dir }
    }

    /// The experimental agent-teams feature must be plausibly available:
    /// either the env var is already set, or the Claude settings file is
    /// present and parseable (the env var is then set in the child).
    fn check_feature(&self) -> Result<(), StartError> {
        if std::env::var(TEAMS_ENV).as_deref() == Ok("1") {
            return Ok(());
        }
        let settings = self.claude_dir.join("settings.json");
        let parseable = std::fs::read_to_string(&settings)
            .ok()
            .and_then(|c| serde_json::from_str::<Value>(&c).ok())
            .is_some();
        if parseable {
            return Ok(());
        }
        Err(StartError::with_hint(
            "Agent teams feature unavailable",
            format!(
                "{TEAMS_ENV}=1 is required. Ensure a Claude Code version with \
                 experimental agent teams is installed and {} exists.",
                settings.display()
            ),
        ))
    }
}

impl ExecutionHandler for TeamHandler {
    fn start(
        &self,
        config: HandlerConfig,
    ) -> Pin<Box<dyn Future<Output = Result<StartInfo, StartError>> + Send + '_>> {
        Box::pin(async move {
            self.check_feature()?;

            let team = config.team.unwrap_or_default();
            let short_id: String = config.project_id.chars().take(8).collect();
            let team_name = format!("hive-{short_id}");

            let roles_text = if team.roles.is_empty() {
                format!("Spawn {} teammates.", team.team_size)
            } else {
                let roles: Vec<String> =
                    team.roles.iter().map(|r| format!("one for {r}")).collect();
                format!("Spawn teammates: {}", roles.join(", "))
            };
            let prompt = format!(
                "Create an agent team named '{team_name}' to work on: {}. {roles_text} \
                 Coordinate work via the shared task list.",
                team.task_description
            );

            let command = vec![
                "claude".to_owned(),
                "-p".to_owned(),
                prompt,
                "--dangerously-skip-permissions".to_owned(),
            ];
            let mut env = HashMap::new();
            env.insert(TEAMS_ENV.to_owned(), "1".to_owned());

            let session_id = self
                .manager
                .create(SessionOptions {
                    project_id: config.project_id,
                    command,
                    cwd: config.cwd,
                    env,
                    worktree_path: config.worktree_path,
                    execution_type: ExecutionKind::TeamSpawn,
                    execution_mode: ExecutionMode::Autonomous,
                    idle_timeout: self.idle_timeout,
                    max_lifetime: self.max_lifetime,
                })
                .map_err(|e| StartError::new(format!("session start failed: {e}")))?;

            self.monitor.start_monitoring(&session_id, &team_name, &self.claude_dir);

            let pid = self.manager.session_info(&session_id).map(|i| i.pid).unwrap_or(0);
            Ok(StartInfo {
                session_id,
                pid,
                status: "active".to_owned(),
                team_name: Some(team_name),
            })
        })
    }

    fn monitor(&self, session_id: &str) -> MonitorReport {
        let mut report = session_report(&self.manager, session_id);
        if let Some(state) = self.monitor.get_state(session_id) {
            report.extra.insert("team_name".to_owned(), state["team_name"].clone());
            report.extra.insert("members".to_owned(), state["members"].clone());
            report.extra.insert("tasks".to_owned(), state["tasks"].clone());
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
#[path = "team_tests.rs"]
mod tests;
