// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Versioned per-session state channel with cursor-based SSE replay.
//!
//! Each chat session carries a monotonic sequence number, a capped event
//! log, and a list of subscriber queues. Reconnecting clients send their
//! last seen seq (`Last-Event-ID`); missed events are replayed from the
//! log, or a single `full_sync` event is emitted when the cursor has fallen
//! behind the retained window.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::sse::{self, SseSender, Subscription};

/// Maximum retained events per session; older events are trimmed from the
/// front.
pub const EVENT_LOG_MAX: usize = 1000;

struct ChannelSession {
    seq: u64,
    event_log: VecDeque<Value>,
    subscribers: Vec<SseSender>,
    status: String,
    created_at: DateTime<Utc>,
}

/// Versioned state snapshots for SSE delivery with cursor-based deltas.
pub struct StateChannel {
    sessions: Mutex<HashMap<String, ChannelSession>>,
    log_max: usize,
}

impl Default for StateChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl StateChannel {
    pub fn new() -> Self {
        Self::with_log_max(EVENT_LOG_MAX)
    }

    /// Construct with a custom event log cap (tests exercise trim
    /// boundaries with small caps).
    pub fn with_log_max(log_max: usize) -> Self {
        Self { sessions: Mutex::new(HashMap::new()), log_max }
    }

    /// Create the session entry if it does not exist. Idempotent: a second
    /// call neither resets the seq nor drops subscribers.
    pub fn init_session(&self, session_id: &str) {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(session_id) {
            return;
        }
        sessions.insert(
            session_id.to_owned(),
            ChannelSession {
                seq: 0,
                event_log: VecDeque::new(),
                subscribers: Vec::new(),
                status: "idle".to_owned(),
                created_at: Utc::now(),
            },
        );
        tracing::info!(session_id, "state channel: initialized session");
    }

    /// Drop the session and poison every subscriber queue so their streams
    /// end cleanly. A second call is a no-op.
    pub fn remove_session(&self, session_id: &str) {
        let mut sessions = self.sessions.lock();
        let Some(mut session) = sessions.remove(session_id) else {
            return;
        };
        sse::poison(&mut session.subscribers);
        tracing::info!(session_id, "state channel: removed session");
    }

    /// Push a delta to all subscribers: assign the next seq, append to the
    /// event log (trimming the front past the cap), and enqueue the
    /// formatted SSE block on every subscriber queue.
    pub fn push_delta(&self, session_id: &str, delta_type: &str, data: Value) {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            return;
        };

        session.seq += 1;
        let seq = session.seq;

        let mut event = json!({ "seq": seq, "type": delta_type });
        if let (Some(obj), Some(extra)) = (event.as_object_mut(), data.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }

        session.event_log.push_back(event.clone());
        while session.event_log.len() > self.log_max {
            session.event_log.pop_front();
        }

        let block = sse::format_delta(seq, "state_delta", &event);
        sse::deliver(&mut session.subscribers, &block);
    }

    /// Update the session status and push a `status_change` delta.
    pub fn push_status(&self, session_id: &str, status: &str) {
        {
            let mut sessions = self.sessions.lock();
            if let Some(session) = sessions.get_mut(session_id) {
                session.status = status.to_owned();
            }
        }
        // Pushed after releasing the lock; push_delta re-acquires it.
        self.push_delta(session_id, "status_change", json!({ "status": status }));
    }

    /// Subscribe to a session's deltas from a reconnect cursor.
    ///
    /// The replay set is computed and the subscriber registered under one
    /// lock acquisition so no delta can fall between catchup and live
    /// delivery. Replay blocks are yielded by the returned [`Subscription`]
    /// after the lock is released.
    pub fn subscribe(
        &self,
        session_id: &str,
        last_seq: u64,
        heartbeat: Duration,
    ) -> Subscription {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            let block =
                sse::format_event("error", &json!({ "error": "Session not found" }));
            return Subscription::finished(vec![block]);
        };

        let mut replay = Vec::new();
        if let Some(oldest) = session.event_log.front().and_then(|e| e["seq"].as_u64()) {
            if last_seq + 1 < oldest {
                // Cursor precedes the retained window: hand the client the
                // whole log once and let it resynchronize.
                let events: Vec<&Value> = session.event_log.iter().collect();
                let block = sse::format_event("full_sync", &json!({ "events": events }));
                replay.push(block);
            } else {
                for event in &session.event_log {
                    let seq = event["seq"].as_u64().unwrap_or(0);
                    if seq > last_seq {
                        replay.push(sse::format_delta(seq, "state_delta", event));
                    }
                }
            }
        }

        let (tx, rx) = sse::queue();
        session.subscribers.push(tx);
        Subscription::live(replay, rx, heartbeat)
    }

    /// Current status string for a session.
    pub fn session_status(&self, session_id: &str) -> Option<String> {
        self.sessions.lock().get(session_id).map(|s| s.status.clone())
    }

    /// Created-at timestamp for a session.
    pub fn session_created_at(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.sessions.lock().get(session_id).map(|s| s.created_at)
    }
}

#[cfg(test)]
#[path = "channel_tests.rs"]
mod tests;
