// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistent PTY sessions with ring-buffered output and SSE broadcasting.
//!
//! Each session runs one CLI command in its own PTY. A dedicated reader
//! task owns the master descriptor: it splits output into lines, strips
//! ANSI sequences, appends to the session's ring buffer, and broadcasts to
//! subscribers unless the session is paused. Session metadata is persisted
//! through the store so dead sessions can be reconciled after a crash.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

use crate::ansi::strip_ansi;
use crate::backend::{ExecutionKind, ExecutionMode, SessionStatus};
use crate::pty::{self, MasterFd, PtyChild, READ_CHUNK};
use crate::ring::LineRing;
use crate::sse::{self, SseSender, Subscription};
use crate::store::{SessionRow, Store};

/// Queue depth for input lines waiting to be written to the PTY.
const INPUT_QUEUE_CAP: usize = 64;

/// Options for creating a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub project_id: String,
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub worktree_path: Option<String>,
    pub execution_type: ExecutionKind,
    pub execution_mode: ExecutionMode,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

/// Summary info for a session, served over the API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub status: SessionStatus,
    pub pid: i32,
    pub pgid: i32,
    pub output_lines: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub worktree_path: Option<String>,
    pub execution_type: ExecutionKind,
    pub execution_mode: ExecutionMode,
    pub paused: bool,
}

/// Ring buffer and subscriber list, guarded together so catch-up replay and
/// subscriber registration are atomic with respect to the reader task.
struct SessionIo {
    ring: LineRing,
    subscribers: Vec<SseSender>,
}

struct SessionEntry {
    id: String,
    pid: Pid,
    pgid: Pid,
    input_tx: mpsc::Sender<String>,
    io: Mutex<SessionIo>,
    status: Mutex<SessionStatus>,
    paused: AtomicBool,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    worktree_path: Option<String>,
    execution_type: ExecutionKind,
    execution_mode: ExecutionMode,
    idle_timeout: Duration,
    max_lifetime: Duration,
}

/// Manager for all live PTY sessions in this process.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<SessionEntry>>>,
    store: Arc<dyn Store>,
    ring_lines: usize,
    heartbeat: Duration,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>, ring_lines: usize, heartbeat: Duration) -> Self {
        Self { sessions: Mutex::new(HashMap::new()), store, ring_lines, heartbeat }
    }

    /// Create a persistent PTY session and start its reader task.
    ///
    /// Returns the generated session id. The row is persisted before this
    /// returns so a crash cannot orphan the child invisibly.
    pub fn create(self: &Arc<Self>, opts: SessionOptions) -> anyhow::Result<String> {
        let session_id = self.unique_session_id();

        let child = PtyChild::spawn(&opts.command, Some(&opts.cwd), &opts.env)?;
        let PtyChild { master, pid, pgid } = child;

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAP);
        let now = Utc::now();

        let entry = Arc::new(SessionEntry {
            id: session_id.clone(),
            pid,
            pgid,
            input_tx,
            io: Mutex::new(SessionIo {
                ring: LineRing::new(self.ring_lines),
                subscribers: Vec::new(),
            }),
            status: Mutex::new(SessionStatus::Active),
            paused: AtomicBool::new(false),
            created_at: now,
            last_activity: Mutex::new(now),
            worktree_path: opts.worktree_path.clone(),
            execution_type: opts.execution_type,
            execution_mode: opts.execution_mode,
            idle_timeout: opts.idle_timeout,
            max_lifetime: opts.max_lifetime,
        });

        self.sessions.lock().insert(session_id.clone(), Arc::clone(&entry));

        // Persist for crash recovery. Losing the row is logged, not fatal:
        // the in-memory session still runs.
        let row = SessionRow {
            id: session_id.clone(),
            project_id: opts.project_id,
            pid: Some(pid.as_raw()),
            pgid: Some(pgid.as_raw()),
            status: SessionStatus::Active,
            execution_type: opts.execution_type,
            execution_mode: opts.execution_mode,
            worktree_path: opts.worktree_path,
            created_at: now,
            last_activity_at: now,
            ended_at: None,
        };
        if let Err(e) = self.store.insert_session(row) {
            tracing::warn!(session_id = %session_id, err = %e, "failed to persist session row");
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            reader_loop(manager, entry, master, input_rx).await;
        });

        tracing::info!(
            session_id = %session_id,
            pid = pid.as_raw(),
            pgid = pgid.as_raw(),
            execution_type = ?opts.execution_type,
            "created PTY session"
        );
        Ok(session_id)
    }

    fn unique_session_id(&self) -> String {
        use rand::Rng;
        let sessions = self.sessions.lock();
        loop {
            let suffix: String = rand::rng()
                .sample_iter(rand::distr::Alphanumeric)
                .take(6)
                .map(|c| (c as char).to_ascii_lowercase())
                .collect();
            let id = format!("psess-{suffix}");
            if !sessions.contains_key(&id) {
                return id;
            }
        }
    }

    fn entry(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Stop a session by terminating its whole process group
    /// (SIGTERM, up to 5 s, then SIGKILL). Returns `false` if unknown.
    pub async fn stop(&self, session_id: &str) -> bool {
        let Some(entry) = self.entry(session_id) else {
            return false;
        };

        pty::terminate(entry.pid, entry.pgid).await;

        {
            let mut status = entry.status.lock();
            if !status.is_terminal() {
                *status = SessionStatus::Completed;
            }
        }
        self.persist_status(&entry);
        tracing::info!(session_id, "stopped session");
        true
    }

    /// Suppress SSE broadcasting. Output keeps buffering in the ring.
    pub fn pause(&self, session_id: &str) -> bool {
        let Some(entry) = self.entry(session_id) else {
            return false;
        };
        entry.paused.store(true, Ordering::Release);
        {
            let mut status = entry.status.lock();
            if !status.is_terminal() {
                *status = SessionStatus::Paused;
            }
        }
        self.persist_status(&entry);
        tracing::info!(session_id, "paused session");
        true
    }

    /// Re-enable broadcasting for NEW output only. Buffered lines are not
    /// replayed; callers fetch history via [`SessionManager::get_output`].
    pub fn resume(&self, session_id: &str) -> bool {
        let Some(entry) = self.entry(session_id) else {
            return false;
        };
        entry.paused.store(false, Ordering::Release);
        {
            let mut status = entry.status.lock();
            if !status.is_terminal() {
                *status = SessionStatus::Active;
            }
        }
        self.persist_status(&entry);
        tracing::info!(session_id, "resumed session");
        true
    }

    /// Last `last_n` lines from the session's ring buffer.
    pub fn get_output(&self, session_id: &str, last_n: usize) -> Vec<String> {
        match self.entry(session_id) {
            Some(entry) => entry.io.lock().ring.last_n(last_n),
            None => Vec::new(),
        }
    }

    /// Queue input for the session's PTY (a newline is appended). The write
    /// itself happens on the reader task, outside any lock.
    pub fn send_input(&self, session_id: &str, text: &str) -> bool {
        let Some(entry) = self.entry(session_id) else {
            return false;
        };
        if entry.status.lock().is_terminal() {
            return false;
        }
        if entry.input_tx.try_send(format!("{text}\n")).is_err() {
            tracing::warn!(session_id, "input queue full or reader gone, dropping input");
            return false;
        }
        *entry.last_activity.lock() = Utc::now();
        true
    }

    /// Subscribe to a session's raw output stream.
    ///
    /// The subscriber is registered and the ring buffer snapshotted under
    /// the same lock, so no line can fall between catch-up and live
    /// delivery. Already-terminal sessions get the replay plus a final
    /// `complete` event; unknown sessions get a one-shot `error` event.
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let Some(entry) = self.entry(session_id) else {
            let block = sse::format_event("error", &json!({ "error": "Session not found" }));
            return Subscription::finished(vec![block]);
        };

        let status = *entry.status.lock();
        let mut io = entry.io.lock();

        let mut replay: Vec<String> = io
            .ring
            .snapshot()
            .into_iter()
            .map(|line| {
                sse::format_event(
                    "output",
                    &json!({ "line": line, "timestamp": Utc::now().to_rfc3339() }),
                )
            })
            .collect();

        if status.is_terminal() {
            replay.push(sse::format_event(
                "complete",
                &json!({ "status": status, "exit_code": null }),
            ));
            return Subscription::finished(replay);
        }

        let (tx, rx) = sse::queue();
        io.subscribers.push(tx);
        Subscription::live(replay, rx, self.heartbeat)
    }

    /// Broadcast an arbitrary event to a session's subscribers (used by the
    /// loop and team monitors).
    pub fn broadcast(&self, session_id: &str, event: &str, data: serde_json::Value) {
        if let Some(entry) = self.entry(session_id) {
            let block = sse::format_event(event, &data);
            sse::deliver(&mut entry.io.lock().subscribers, &block);
        }
    }

    /// Summary info for a session.
    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        let entry = self.entry(session_id)?;
        let info = SessionInfo {
            session_id: entry.id.clone(),
            status: *entry.status.lock(),
            pid: entry.pid.as_raw(),
            pgid: entry.pgid.as_raw(),
            output_lines: entry.io.lock().ring.len(),
            created_at: entry.created_at,
            last_activity_at: *entry.last_activity.lock(),
            worktree_path: entry.worktree_path.clone(),
            execution_type: entry.execution_type,
            execution_mode: entry.execution_mode,
            paused: entry.paused.load(Ordering::Acquire),
        };
        Some(info)
    }

    /// All live session ids.
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Boot-time reconciliation: mark persisted-active sessions whose PID
    /// no longer responds to signal 0 as failed.
    pub fn cleanup_dead_sessions(&self) {
        let rows = match self.store.active_sessions() {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(err = %e, "failed to query active sessions for cleanup");
                return;
            }
        };

        let mut cleaned = 0usize;
        for row in rows {
            let Some(pid) = row.pid else { continue };
            if pty::is_process_alive(pid) {
                continue;
            }
            if let Err(e) =
                self.store.update_session_status(&row.id, SessionStatus::Failed, Some(Utc::now()))
            {
                tracing::warn!(session_id = %row.id, err = %e, "failed to mark dead session");
                continue;
            }
            cleaned += 1;
            tracing::info!(session_id = %row.id, pid, "cleaned dead session");
        }
        if cleaned > 0 {
            tracing::info!(cleaned, "dead session cleanup complete");
        }
    }

    /// Stop sessions that exceeded their idle timeout or max lifetime.
    pub async fn check_resource_limits(&self) {
        let now = Utc::now();
        let mut to_stop = Vec::new();

        {
            let sessions = self.sessions.lock();
            for (id, entry) in sessions.iter() {
                if entry.status.lock().is_terminal() {
                    continue;
                }

                let idle = (now - *entry.last_activity.lock())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if idle > entry.idle_timeout {
                    to_stop.push((
                        id.clone(),
                        format!(
                            "idle timeout ({}s > {}s)",
                            idle.as_secs(),
                            entry.idle_timeout.as_secs()
                        ),
                    ));
                    continue;
                }

                let lifetime =
                    (now - entry.created_at).to_std().unwrap_or(Duration::ZERO);
                if lifetime > entry.max_lifetime {
                    to_stop.push((
                        id.clone(),
                        format!(
                            "max lifetime ({}s > {}s)",
                            lifetime.as_secs(),
                            entry.max_lifetime.as_secs()
                        ),
                    ));
                }
            }
        }

        for (session_id, reason) in to_stop {
            tracing::warn!(session_id = %session_id, reason = %reason, "stopping session over resource limit");
            self.stop(&session_id).await;
        }
    }

    fn persist_status(&self, entry: &SessionEntry) {
        let status = *entry.status.lock();
        let ended_at = status.is_terminal().then(Utc::now);
        if let Err(e) = self.store.update_session_status(&entry.id, status, ended_at) {
            tracing::warn!(session_id = %entry.id, err = %e, "failed to persist session status");
        }
    }
}

/// Reader task: owns the PTY master, drains output into lines, writes
/// queued input, and runs the exit handler on EOF.
async fn reader_loop(
    manager: Arc<SessionManager>,
    entry: Arc<SessionEntry>,
    master: AsyncFd<MasterFd>,
    mut input_rx: mpsc::Receiver<String>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();
    let mut input_closed = false;

    loop {
        if input_closed {
            match pty::read_chunk(&master, &mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    drain_lines(&entry, &mut pending);
                }
                // Linux PTYs raise EIO once the slave side is gone.
                Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => break,
                Err(e) => {
                    tracing::warn!(session_id = %entry.id, err = %e, "PTY read failed");
                    break;
                }
            }
            continue;
        }
        tokio::select! {
            read = pty::read_chunk(&master, &mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        drain_lines(&entry, &mut pending);
                    }
                    // Linux PTYs raise EIO once the slave side is gone.
                    Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => break,
                    Err(e) => {
                        tracing::warn!(session_id = %entry.id, err = %e, "PTY read failed");
                        break;
                    }
                }
            }
            input = input_rx.recv() => {
                match input {
                    Some(text) => {
                        if let Err(e) = pty::write_all(&master, text.as_bytes()).await {
                            tracing::warn!(session_id = %entry.id, err = %e, "PTY write failed");
                        }
                    }
                    None => input_closed = true,
                }
            }
        }
    }

    // Flush any partial line left in the buffer.
    if !pending.is_empty() {
        let line = strip_ansi(&String::from_utf8_lossy(&pending));
        let mut io = entry.io.lock();
        io.ring.push(line.clone());
        if !entry.paused.load(Ordering::Acquire) {
            broadcast_line(&mut io, &line);
        }
    }

    drop(master);
    handle_exit(&manager, &entry);
}

fn drain_lines(entry: &SessionEntry, pending: &mut Vec<u8>) {
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = pending.drain(..=pos).collect();
        let raw = &raw[..raw.len() - 1];
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = strip_ansi(&String::from_utf8_lossy(raw));

        let mut io = entry.io.lock();
        io.ring.push(line.clone());
        *entry.last_activity.lock() = Utc::now();
        if !entry.paused.load(Ordering::Acquire) {
            broadcast_line(&mut io, &line);
        }
    }
}

fn broadcast_line(io: &mut SessionIo, line: &str) {
    let block = sse::format_event(
        "output",
        &json!({ "line": line, "timestamp": Utc::now().to_rfc3339() }),
    );
    sse::deliver(&mut io.subscribers, &block);
}

/// Determine the terminal status, persist it, broadcast `complete`, and
/// poison all subscriber queues.
fn handle_exit(manager: &SessionManager, entry: &SessionEntry) {
    let reaped = pty::try_reap(entry.pid);
    let (status, exit_code) = match reaped {
        Some(exit) if exit.success() => (SessionStatus::Completed, Some(0)),
        Some(exit) => {
            let code = exit.code.or(exit.signal.map(|s| -s));
            (SessionStatus::Failed, code)
        }
        // Already reaped elsewhere (e.g. by stop): keep whatever terminal
        // status was recorded, defaulting to completed.
        None => (*entry.status.lock(), None),
    };

    let status = {
        let mut current = entry.status.lock();
        if !current.is_terminal() {
            *current = if status.is_terminal() { status } else { SessionStatus::Completed };
        }
        *current
    };

    if let Err(e) =
        manager.store.update_session_status(&entry.id, status, Some(Utc::now()))
    {
        tracing::warn!(session_id = %entry.id, err = %e, "failed to persist exit status");
    }

    {
        let mut io = entry.io.lock();
        let block = sse::format_event(
            "complete",
            &json!({ "status": status, "exit_code": exit_code }),
        );
        sse::deliver(&mut io.subscribers, &block);
        sse::poison(&mut io.subscribers);
    }

    tracing::info!(session_id = %entry.id, status = %status, ?exit_code, "session exited");
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
