// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::backend::{ExecutionKind, ExecutionMode};
use crate::session::{SessionManager, SessionOptions};
use crate::store::MemoryStore;

use super::*;

fn manager() -> Arc<SessionManager> {
    Arc::new(SessionManager::new(
        Arc::new(MemoryStore::new()),
        1000,
        Duration::from_secs(5),
    ))
}

fn team_session(manager: &Arc<SessionManager>) -> anyhow::Result<String> {
    Ok(manager.create(SessionOptions {
        project_id: "proj-abcdef12".to_owned(),
        command: vec!["sh".into(), "-c".into(), "sleep 60".into()],
        cwd: std::env::temp_dir(),
        env: HashMap::new(),
        worktree_path: None,
        execution_type: ExecutionKind::TeamSpawn,
        execution_mode: ExecutionMode::Autonomous,
        idle_timeout: Duration::from_secs(3600),
        max_lifetime: Duration::from_secs(14_400),
    })?)
}

#[tokio::test]
async fn polling_picks_up_config_and_tasks() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mgr = manager();
    let id = team_session(&mgr)?;
    let mut sub = mgr.subscribe(&id);

    let monitor = Arc::new(TeamMonitor::with_poll_interval(
        Arc::clone(&mgr),
        Duration::from_millis(100),
    ));
    monitor.start_monitoring(&id, "hive-test", tmp.path());

    let teams_dir = tmp.path().join("teams").join("hive-test");
    let tasks_dir = tmp.path().join("tasks").join("hive-test");
    std::fs::write(
        teams_dir.join("config.json"),
        json!({ "name": "hive-test", "members": [{ "name": "builder" }] }).to_string(),
    )?;
    std::fs::write(
        tasks_dir.join("task-1.json"),
        json!({ "id": "t1", "status": "pending", "assignee": "builder", "description": "d" })
            .to_string(),
    )?;

    // Wait for the state to reflect both files (watcher or poll fallback).
    let mut ok = false;
    for _ in 0..50 {
        if let Some(state) = monitor.get_state(&id) {
            let members = state["members"].as_array().map(Vec::len).unwrap_or(0);
            let tasks = state["tasks"].as_array().map(Vec::len).unwrap_or(0);
            if members == 1 && tasks == 1 {
                ok = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(ok, "team state never converged: {:?}", monitor.get_state(&id));

    // team_update deltas reached the session channel.
    monitor.stop_monitoring(&id);
    mgr.stop(&id).await;
    let mut saw_config = false;
    let mut saw_task = false;
    while let Some(block) = sub.next().await {
        if block.starts_with("event: team_update") {
            if block.contains("\"type\":\"config\"") {
                saw_config = true;
            }
            if block.contains("\"type\":\"task\"") {
                saw_task = true;
            }
        }
    }
    assert!(saw_config, "no config team_update seen");
    assert!(saw_task, "no task team_update seen");
    Ok(())
}

#[tokio::test]
async fn task_updates_replace_not_duplicate() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mgr = manager();
    let id = team_session(&mgr)?;

    let monitor = Arc::new(TeamMonitor::with_poll_interval(
        Arc::clone(&mgr),
        Duration::from_millis(50),
    ));
    monitor.start_monitoring(&id, "hive-test", tmp.path());
    let tasks_dir = tmp.path().join("tasks").join("hive-test");

    let task_path = tasks_dir.join("task-1.json");
    std::fs::write(
        &task_path,
        json!({ "id": "t1", "status": "pending" }).to_string(),
    )?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    // Touch with a newer mtime and a changed status.
    std::fs::write(
        &task_path,
        json!({ "id": "t1", "status": "completed" }).to_string(),
    )?;

    let mut completed = false;
    for _ in 0..50 {
        if let Some(state) = monitor.get_state(&id) {
            let tasks = state["tasks"].as_array().cloned().unwrap_or_default();
            if tasks.len() == 1 && tasks[0]["status"] == "completed" {
                completed = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(completed, "task never updated in place: {:?}", monitor.get_state(&id));

    monitor.stop_monitoring(&id);
    mgr.stop(&id).await;
    Ok(())
}

#[test]
fn config_parsing_accepts_members_or_teammates() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("config.json");

    std::fs::write(&path, json!({ "members": [1, 2] }).to_string())?;
    let parsed = parse_team_config(&path).unwrap_or_default();
    assert_eq!(parsed["members"].as_array().map(Vec::len), Some(2));

    std::fs::write(&path, json!({ "teammates": [1] }).to_string())?;
    let parsed = parse_team_config(&path).unwrap_or_default();
    assert_eq!(parsed["members"].as_array().map(Vec::len), Some(1));

    std::fs::write(&path, "not json")?;
    assert!(parse_team_config(&path).is_none());
    Ok(())
}

#[test]
fn upsert_matches_by_id_then_file() {
    let mut tasks = Vec::new();
    upsert_task(&mut tasks, &json!({ "id": "a", "status": "pending", "file": "a.json" }));
    upsert_task(&mut tasks, &json!({ "id": "a", "status": "done", "file": "a.json" }));
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["status"], "done");

    // Tasks without ids key on their file name.
    upsert_task(&mut tasks, &json!({ "id": "", "status": "x", "file": "b.json" }));
    upsert_task(&mut tasks, &json!({ "id": "", "status": "y", "file": "b.json" }));
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[1]["status"], "y");
}

#[tokio::test]
async fn feature_check_gates_start() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    std::env::remove_var("CLAUDE_CODE_EXPERIMENTAL_AGENT_TEAMS");

    let mgr = manager();
    let monitor = Arc::new(TeamMonitor::new(Arc::clone(&mgr)));
    let handler = TeamHandler::new(
        Arc::clone(&mgr),
        monitor,
        Duration::from_secs(3600),
        Duration::from_secs(14_400),
        tmp.path().to_path_buf(),
    );

    let config = HandlerConfig {
        project_id: "proj-abcdef12".to_owned(),
        cmd: Vec::new(),
        cwd: std::env::temp_dir(),
        worktree_path: None,
        execution_mode: ExecutionMode::Autonomous,
        ralph: None,
        team: Some(TeamConfig::default()),
    };

    // No settings file and no env var: refused with a hint.
    let err = handler.start(config).await.err();
    let err = err.ok_or_else(|| anyhow::anyhow!("expected start refusal"))?;
    assert!(err.error.contains("Agent teams feature unavailable"));
    assert!(err.hint.is_some());
    Ok(())
}
