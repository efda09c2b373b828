// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use serde_json::{json, Value};

use super::*;

const HB: Duration = Duration::from_secs(5);

fn data_json(block: &str) -> Value {
    let line = block
        .lines()
        .find(|l| l.starts_with("data: "))
        .map(|l| &l["data: ".len()..])
        .unwrap_or("{}");
    serde_json::from_str(line).unwrap_or(Value::Null)
}

#[tokio::test]
async fn replay_in_order_without_gaps() {
    let ch = StateChannel::new();
    ch.init_session("s");
    for i in 0..5 {
        ch.push_delta("s", "log", json!({ "n": i }));
    }

    let mut sub = ch.subscribe("s", 2, HB);
    let mut seqs = Vec::new();
    for _ in 0..3 {
        let block = sub.next().await.unwrap_or_default();
        seqs.push(data_json(&block)["seq"].as_u64().unwrap_or(0));
    }
    assert_eq!(seqs, vec![3, 4, 5]);
}

#[tokio::test]
async fn fresh_subscriber_replays_entire_log() {
    let ch = StateChannel::new();
    ch.init_session("s");
    ch.push_delta("s", "log", json!({}));
    ch.push_delta("s", "log", json!({}));

    let mut sub = ch.subscribe("s", 0, HB);
    let first = sub.next().await.unwrap_or_default();
    assert!(first.starts_with("id: 1\nevent: state_delta\n"));
    let second = sub.next().await.unwrap_or_default();
    assert!(second.starts_with("id: 2\nevent: state_delta\n"));
}

#[tokio::test]
async fn stale_cursor_gets_single_full_sync() {
    let ch = StateChannel::new();
    ch.init_session("s");
    for _ in 0..1500 {
        ch.push_delta("s", "log", json!({}));
    }

    let mut sub = ch.subscribe("s", 100, HB);
    let block = sub.next().await.unwrap_or_default();
    assert!(block.starts_with("event: full_sync\n"));

    let events = data_json(&block);
    let events = events["events"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    assert_eq!(events.len(), 1000);
    assert_eq!(events[0]["seq"], 501);
    assert_eq!(events[999]["seq"], 1500);

    // Live deltas follow the sync.
    ch.push_delta("s", "log", json!({}));
    let live = sub.next().await.unwrap_or_default();
    assert!(live.starts_with("id: 1501\n"));
}

#[tokio::test]
async fn log_cap_trims_exactly_excess() {
    let ch = StateChannel::with_log_max(10);
    ch.init_session("s");
    for _ in 0..10 {
        ch.push_delta("s", "log", json!({}));
    }
    // At the cap: one more push trims exactly one from the front.
    ch.push_delta("s", "log", json!({}));

    let mut sub = ch.subscribe("s", 0, HB);
    let block = sub.next().await.unwrap_or_default();
    assert!(block.starts_with("event: full_sync\n"), "oldest event trimmed, cursor 0 is stale");
    let events = data_json(&block);
    let events = events["events"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    assert_eq!(events.len(), 10);
    assert_eq!(events[0]["seq"], 2);
}

#[tokio::test]
async fn init_is_idempotent() {
    let ch = StateChannel::new();
    ch.init_session("s");
    ch.push_delta("s", "log", json!({}));
    ch.init_session("s");
    // Seq was not reset by the second init.
    ch.push_delta("s", "log", json!({}));

    let mut sub = ch.subscribe("s", 1, HB);
    let block = sub.next().await.unwrap_or_default();
    assert!(block.starts_with("id: 2\n"));
}

#[tokio::test]
async fn remove_poisons_subscribers_and_is_idempotent() {
    let ch = StateChannel::new();
    ch.init_session("s");
    let mut sub = ch.subscribe("s", 0, HB);

    ch.remove_session("s");
    ch.remove_session("s");

    assert_eq!(sub.next().await, None);
}

#[tokio::test]
async fn unknown_session_yields_error_event() {
    let ch = StateChannel::new();
    let mut sub = ch.subscribe("missing", 0, HB);
    let block = sub.next().await.unwrap_or_default();
    assert!(block.starts_with("event: error\n"));
    assert_eq!(sub.next().await, None);
}

#[tokio::test]
async fn push_status_updates_and_broadcasts() {
    let ch = StateChannel::new();
    ch.init_session("s");
    let mut sub = ch.subscribe("s", 0, HB);

    ch.push_status("s", "streaming");
    assert_eq!(ch.session_status("s").as_deref(), Some("streaming"));

    let block = sub.next().await.unwrap_or_default();
    let data = data_json(&block);
    assert_eq!(data["type"], "status_change");
    assert_eq!(data["status"], "streaming");
}

#[tokio::test]
async fn live_seqs_strictly_increase_across_subscribers() {
    let ch = StateChannel::new();
    ch.init_session("s");
    let mut a = ch.subscribe("s", 0, HB);
    let mut b = ch.subscribe("s", 0, HB);

    ch.push_delta("s", "log", json!({}));
    ch.push_delta("s", "log", json!({}));

    for sub in [&mut a, &mut b] {
        let first = data_json(&sub.next().await.unwrap_or_default());
        let second = data_json(&sub.next().await.unwrap_or_default());
        assert!(second["seq"].as_u64() > first["seq"].as_u64());
    }
}
