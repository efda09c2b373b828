// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Direct execution: a single PTY session, passed straight through to the
//! session manager.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::ExecutionKind;
use crate::session::{SessionManager, SessionOptions};

use super::{ExecutionHandler, HandlerConfig, MonitorReport, StartError, StartInfo};

pub struct DirectHandler {
    manager: Arc<SessionManager>,
    idle_timeout: Duration,
    max_lifetime: Duration,
}

impl DirectHandler {
    pub fn new(manager: Arc<SessionManager>, idle_timeout: Duration, max_lifetime: Duration) -> Self {
        Self { manager, idle_timeout, max_lifetime }
    }
}

impl ExecutionHandler for DirectHandler {
    fn start(
        &self,
        config: HandlerConfig,
    ) -> Pin<Box<dyn Future<Output = Result<StartInfo, StartError>> + Send + '_>> {
        Box::pin(async move {
            if config.cmd.is_empty() {
                return Err(StartError::new("direct execution requires a command"));
            }
            let session_id = self
                .manager
                .create(SessionOptions {
                    project_id: config.project_id,
                    command: config.cmd,
                    cwd: config.cwd,
                    env: HashMap::new(),
                    worktree_path: config.worktree_path,
                    execution_type: ExecutionKind::Direct,
                    execution_mode: config.execution_mode,
                    idle_timeout: self.idle_timeout,
                    max_lifetime: self.max_lifetime,
                })
                .map_err(|e| StartError::new(format!("session start failed: {e}")))?;

            let pid = self.manager.session_info(&session_id).map(|i| i.pid).unwrap_or(0);
            Ok(StartInfo { session_id, pid, status: "active".to_owned(), team_name: None })
        })
    }

    fn monitor(&self, session_id: &str) -> MonitorReport {
        session_report(&self.manager, session_id)
    }

    fn stop(&self, session_id: &str) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let session_id = session_id.to_owned();
        Box::pin(async move { self.manager.stop(&session_id).await })
    }

    fn get_output(&self, session_id: &str, last_n: usize) -> Vec<String> {
        self.manager.get_output(session_id, last_n)
    }
}

/// Shared base report built from session-manager info.
pub(super) fn session_report(manager: &SessionManager, session_id: &str) -> MonitorReport {
    match manager.session_info(session_id) {
        Some(info) => MonitorReport {
            alive: info.status == crate::backend::SessionStatus::Active,
            status: info.status.as_str().to_owned(),
            output_lines: info.output_lines,
            last_activity_at: Some(info.last_activity_at),
            extra: serde_json::Map::new(),
        },
        None => MonitorReport::unknown(),
    }
}
