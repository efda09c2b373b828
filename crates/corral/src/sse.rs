// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SSE wire formatting and per-subscriber delivery queues.
//!
//! Every subscriber owns a bounded channel. Producers push formatted SSE
//! blocks under the session lock with `try_send` (never awaiting); a `None`
//! sentinel is the poison pill that ends the stream. Consumers drain their
//! queue in their own task and emit a heartbeat comment when no event
//! arrives within the heartbeat window.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

/// Queue depth per subscriber. A consumer that falls this far behind starts
/// losing events (delivered seqs remain strictly increasing).
pub const SUBSCRIBER_QUEUE_CAP: usize = 1024;

/// Keepalive comment sent when no event arrives within the heartbeat window.
pub const HEARTBEAT: &str = ": heartbeat\n\n";

/// Message on a subscriber queue: an SSE block, or `None` as poison pill.
pub type SseMessage = Option<String>;

pub type SseSender = mpsc::Sender<SseMessage>;
pub type SseReceiver = mpsc::Receiver<SseMessage>;

/// Create a subscriber queue pair.
pub fn queue() -> (SseSender, SseReceiver) {
    mpsc::channel(SUBSCRIBER_QUEUE_CAP)
}

/// Format an SSE block without an id line: `event: <name>\ndata: <json>\n\n`.
pub fn format_event(event: &str, data: &Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

/// Format an SSE block with a sequence id:
/// `id: <seq>\nevent: <name>\ndata: <json>\n\n`.
pub fn format_delta(seq: u64, event: &str, data: &Value) -> String {
    format!("id: {seq}\nevent: {event}\ndata: {data}\n\n")
}

/// Deliver a message to every live subscriber, pruning closed ones.
///
/// Called under the owning session lock; `try_send` never blocks. A full
/// queue drops the event for that subscriber only.
pub fn deliver(subscribers: &mut Vec<SseSender>, message: &str) {
    subscribers.retain(|tx| match tx.try_send(Some(message.to_owned())) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!("subscriber queue full, dropping event");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

/// Poison every subscriber queue so streams terminate cleanly.
pub fn poison(subscribers: &mut Vec<SseSender>) {
    for tx in subscribers.drain(..) {
        let _ = tx.try_send(None);
    }
}

/// A live subscription: replay events first, then queued events with
/// heartbeats on idle.
pub struct Subscription {
    replay: VecDeque<String>,
    rx: Option<SseReceiver>,
    heartbeat: Duration,
}

impl Subscription {
    /// A subscription that replays `replay` and then follows the queue.
    pub fn live(replay: Vec<String>, rx: SseReceiver, heartbeat: Duration) -> Self {
        Self { replay: replay.into(), rx: Some(rx), heartbeat }
    }

    /// A subscription that yields `replay` and then ends (already-terminal
    /// sessions, unknown sessions with a one-shot error event).
    pub fn finished(replay: Vec<String>) -> Self {
        Self { replay: replay.into(), rx: None, heartbeat: Duration::ZERO }
    }

    /// Next SSE block, or `None` once the stream is over.
    pub async fn next(&mut self) -> Option<String> {
        if let Some(block) = self.replay.pop_front() {
            return Some(block);
        }
        let rx = self.rx.as_mut()?;
        match tokio::time::timeout(self.heartbeat, rx.recv()).await {
            Ok(Some(Some(block))) => Some(block),
            // Poison pill or all senders gone: end of stream.
            Ok(Some(None)) | Ok(None) => {
                self.rx = None;
                None
            }
            Err(_) => Some(HEARTBEAT.to_owned()),
        }
    }

    /// Adapt into a `Stream` of SSE blocks for HTTP body streaming.
    pub fn into_stream(self) -> impl Stream<Item = String> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|block| (block, sub))
        })
    }
}

#[cfg(test)]
#[path = "sse_tests.rs"]
mod tests;
