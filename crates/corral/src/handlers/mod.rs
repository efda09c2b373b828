// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Execution-type handlers and their static registry.
//!
//! Each execution type (`direct`, `ralph_loop`, `team_spawn`) has a handler
//! managing the session lifecycle for that type. The registry is a fixed
//! table keyed by the closed [`ExecutionKind`] enum.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::backend::{ExecutionKind, ExecutionMode};

pub mod direct;
pub mod ralph;
pub mod team;

pub use direct::DirectHandler;
pub use ralph::{LoopMonitor, RalphConfig, RalphHandler};
pub use team::{TeamConfig, TeamHandler, TeamMonitor};

/// Configuration for starting an execution.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub project_id: String,
    /// Command for direct execution; loop/team handlers construct their own.
    pub cmd: Vec<String>,
    pub cwd: PathBuf,
    pub worktree_path: Option<String>,
    pub execution_mode: ExecutionMode,
    pub ralph: Option<RalphConfig>,
    pub team: Option<TeamConfig>,
}

/// Successful start: the session and its child process.
#[derive(Debug, Clone, Serialize)]
pub struct StartInfo {
    pub session_id: String,
    pub pid: i32,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
}

/// Start refused or failed, with an operator hint where one helps.
#[derive(Debug, Clone, Serialize)]
pub struct StartError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl StartError {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into(), hint: None }
    }

    pub fn with_hint(error: impl Into<String>, hint: impl Into<String>) -> Self {
        Self { error: error.into(), hint: Some(hint.into()) }
    }
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.error)
    }
}

impl std::error::Error for StartError {}

/// Execution status as seen by the monitor endpoint. Handler-specific
/// fields (loop iterations, team members) are flattened in.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub alive: bool,
    pub status: String,
    pub output_lines: usize,
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl MonitorReport {
    /// Report for a session the manager no longer knows.
    pub fn unknown() -> Self {
        Self {
            alive: false,
            status: "unknown".to_owned(),
            output_lines: 0,
            last_activity_at: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Interface implemented by each execution type.
pub trait ExecutionHandler: Send + Sync {
    /// Start execution; returns the session id, PID, and initial status.
    fn start(
        &self,
        config: HandlerConfig,
    ) -> Pin<Box<dyn Future<Output = Result<StartInfo, StartError>> + Send + '_>>;

    /// Check execution status.
    fn monitor(&self, session_id: &str) -> MonitorReport;

    /// Stop execution. `false` when the session is unknown.
    fn stop(&self, session_id: &str) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;

    /// Last `last_n` lines from the output buffer.
    fn get_output(&self, session_id: &str, last_n: usize) -> Vec<String>;
}

/// Static handler table. Built once at wiring time; contents never change
/// at runtime.
pub struct HandlerRegistry {
    handlers: HashMap<ExecutionKind, Arc<dyn ExecutionHandler>>,
}

impl HandlerRegistry {
    pub fn new(
        direct: Arc<dyn ExecutionHandler>,
        ralph: Arc<dyn ExecutionHandler>,
        team: Arc<dyn ExecutionHandler>,
    ) -> Self {
        let mut handlers: HashMap<ExecutionKind, Arc<dyn ExecutionHandler>> = HashMap::new();
        handlers.insert(ExecutionKind::Direct, direct);
        handlers.insert(ExecutionKind::RalphLoop, ralph);
        handlers.insert(ExecutionKind::TeamSpawn, team);
        Self { handlers }
    }

    pub fn get(&self, kind: ExecutionKind) -> Option<Arc<dyn ExecutionHandler>> {
        self.handlers.get(&kind).cloned()
    }
}
