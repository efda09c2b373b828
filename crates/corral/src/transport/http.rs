// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Axum handlers for session SSE, the chat state channel, and status.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::backend::{ExecutionKind, ExecutionMode};
use crate::channel::StateChannel;
use crate::error::ErrorCode;
use crate::handlers::{HandlerConfig, HandlerRegistry, RalphConfig, TeamConfig};
use crate::monitor::RateLimitMonitor;
use crate::scheduler::AdmissionScheduler;
use crate::session::SessionManager;
use crate::sse::Subscription;
use crate::store::Store;

/// Shared application state passed to all handlers via axum `State`.
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub channel: Arc<StateChannel>,
    pub monitor: Arc<RateLimitMonitor>,
    pub scheduler: Arc<AdmissionScheduler>,
    pub registry: HandlerRegistry,
    pub store: Arc<dyn Store>,
    pub heartbeat: Duration,
    pub shutdown: CancellationToken,
}

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/sessions", post(create_session))
        .route("/api/v1/sessions/{id}", get(session_info))
        .route("/api/v1/sessions/{id}/stop", post(stop_session))
        .route("/api/v1/sessions/{id}/pause", post(pause_session))
        .route("/api/v1/sessions/{id}/resume", post(resume_session))
        .route("/api/v1/sessions/{id}/output", get(session_output))
        .route("/api/v1/sessions/{id}/input", post(session_input))
        .route("/api/v1/sessions/{id}/events", get(session_events))
        .route("/api/v1/chat/{id}/events", get(chat_events))
        .route("/api/v1/monitoring/status", get(monitoring_status))
        .route("/api/v1/scheduler/status", get(scheduler_status))
        .route("/api/v1/shutdown", post(shutdown))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

fn api_error(code: ErrorCode, message: &str) -> Response {
    let status = StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": message, "code": code.as_str() }))).into_response()
}

/// Wrap a subscription as an SSE response body.
fn sse_response(sub: Subscription) -> Response {
    let stream = sub
        .into_stream()
        .map(|block| Ok::<_, std::convert::Infallible>(bytes::Bytes::from(block)));
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// -- Lifecycle ----------------------------------------------------------------

async fn health(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "running",
        "sessions": s.manager.session_ids().len(),
        "pid": std::process::id(),
    }))
}

async fn shutdown(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    s.shutdown.cancel();
    Json(json!({ "accepted": true }))
}

// -- Sessions -----------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RalphConfigBody {
    max_iterations: Option<u32>,
    completion_promise: Option<String>,
    task_description: Option<String>,
    no_progress_threshold: Option<u32>,
    count_output_as_progress: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct TeamConfigBody {
    team_size: Option<u32>,
    task_description: Option<String>,
    roles: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    project_id: String,
    #[serde(default)]
    cmd: Vec<String>,
    cwd: String,
    #[serde(default)]
    execution_type: Option<String>,
    #[serde(default)]
    execution_mode: Option<String>,
    #[serde(default)]
    worktree_path: Option<String>,
    #[serde(default)]
    ralph_config: Option<RalphConfigBody>,
    #[serde(default)]
    team_config: Option<TeamConfigBody>,
}

async fn create_session(
    State(s): State<Arc<AppState>>,
    Json(body): Json<CreateSessionBody>,
) -> Response {
    // Configuration errors are rejected here, before any state mutates.
    let kind = match body.execution_type.as_deref() {
        None | Some("direct") => ExecutionKind::Direct,
        Some("ralph_loop") => ExecutionKind::RalphLoop,
        Some("team_spawn") => ExecutionKind::TeamSpawn,
        Some(other) => {
            return api_error(ErrorCode::BadRequest, &format!("unknown execution type '{other}'"));
        }
    };
    let mode = match body.execution_mode.as_deref() {
        None | Some("autonomous") => ExecutionMode::Autonomous,
        Some("interactive") => ExecutionMode::Interactive,
        Some(other) => {
            return api_error(ErrorCode::BadRequest, &format!("unknown execution mode '{other}'"));
        }
    };
    let Some(handler) = s.registry.get(kind) else {
        return api_error(ErrorCode::Internal, "no handler registered");
    };

    let defaults = RalphConfig::default;
    let ralph = body.ralph_config.map(|r| RalphConfig {
        max_iterations: r.max_iterations.unwrap_or(defaults().max_iterations),
        completion_promise: r.completion_promise.unwrap_or(defaults().completion_promise),
        task_description: r.task_description.unwrap_or(defaults().task_description),
        no_progress_threshold: r
            .no_progress_threshold
            .unwrap_or(defaults().no_progress_threshold),
        count_output_as_progress: r.count_output_as_progress.unwrap_or(true),
    });
    let team = body.team_config.map(|t| TeamConfig {
        team_size: t.team_size.unwrap_or(3),
        task_description: t.task_description.unwrap_or_default(),
        roles: t.roles.unwrap_or_default(),
    });

    let config = HandlerConfig {
        project_id: body.project_id,
        cmd: body.cmd,
        cwd: body.cwd.into(),
        worktree_path: body.worktree_path,
        execution_mode: mode,
        ralph,
        team,
    };

    match handler.start(config).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => (
            StatusCode::from_u16(ErrorCode::BadRequest.http_status())
                .unwrap_or(StatusCode::BAD_REQUEST),
            Json(e),
        )
            .into_response(),
    }
}

async fn session_info(State(s): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match s.manager.session_info(&id) {
        Some(info) => Json(info).into_response(),
        None => api_error(ErrorCode::NotFound, "Session not found"),
    }
}

async fn stop_session(State(s): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if s.manager.stop(&id).await {
        Json(json!({ "stopped": true })).into_response()
    } else {
        api_error(ErrorCode::NotFound, "Session not found")
    }
}

async fn pause_session(State(s): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if s.manager.pause(&id) {
        Json(json!({ "paused": true })).into_response()
    } else {
        api_error(ErrorCode::NotFound, "Session not found")
    }
}

async fn resume_session(State(s): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if s.manager.resume(&id) {
        Json(json!({ "resumed": true })).into_response()
    } else {
        api_error(ErrorCode::NotFound, "Session not found")
    }
}

#[derive(Debug, Deserialize)]
struct OutputQuery {
    #[serde(default = "default_last_n")]
    last_n: usize,
}

fn default_last_n() -> usize {
    100
}

async fn session_output(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<OutputQuery>,
) -> impl IntoResponse {
    Json(json!({ "lines": s.manager.get_output(&id, q.last_n) }))
}

#[derive(Debug, Deserialize)]
struct InputBody {
    text: String,
}

async fn session_input(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<InputBody>,
) -> Response {
    if s.manager.send_input(&id, &body.text) {
        Json(json!({ "sent": true })).into_response()
    } else {
        api_error(ErrorCode::NotFound, "Session not found or not active")
    }
}

/// `GET /api/v1/sessions/{id}/events` — raw PTY output stream.
async fn session_events(State(s): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    sse_response(s.manager.subscribe(&id))
}

// -- Chat state channel -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatEventsQuery {
    #[serde(default)]
    last_seq: Option<u64>,
}

/// `GET /api/v1/chat/{id}/events` — versioned state deltas with
/// `Last-Event-ID` replay.
async fn chat_events(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<ChatEventsQuery>,
    headers: HeaderMap,
) -> Response {
    let last_seq = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .or(q.last_seq)
        .unwrap_or(0);
    sse_response(s.channel.subscribe(&id, last_seq, s.heartbeat))
}

// -- Status -------------------------------------------------------------------

async fn monitoring_status(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    Json(s.monitor.status(Utc::now()).await)
}

async fn scheduler_status(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    let config = s.store.monitor_config().unwrap_or_default();
    let (sessions, summary) = s.scheduler.status();
    Json(json!({
        "enabled": config.enabled,
        "safety_margin_minutes": config.safety_margin_minutes,
        "resume_hysteresis_polls": config.resume_hysteresis_polls,
        "sessions": sessions,
        "global_summary": summary,
    }))
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
