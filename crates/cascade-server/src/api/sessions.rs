//! Interactive session management: create, steer, and observe sessions in
//! any of the three execution modes.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use cascade_core::models::ExecutionMode;
use cascade_core::{AppState, FlowError, LoopConfig, Session, SessionSpec};

use super::runs::sse_log_stream;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_sessions).post(create_session))
        .route("/{session_id}", get(get_session))
        .route("/{session_id}/input", post(send_input))
        .route("/{session_id}/pause", post(pause_session))
        .route("/{session_id}/resume", post(resume_session))
        .route("/{session_id}/stop", post(stop_session))
        .route("/{session_id}/stream", get(stream_session))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct LoopConfigRequest {
    task: Option<String>,
    continue_prompt: Option<String>,
    completion_promise: Option<String>,
    max_iterations: Option<u32>,
    no_progress_threshold: Option<u32>,
    iteration_timeout_secs: Option<u64>,
}

impl LoopConfigRequest {
    fn into_config(self) -> LoopConfig {
        let defaults = LoopConfig::default();
        LoopConfig {
            task: self.task.unwrap_or(defaults.task),
            continue_prompt: self.continue_prompt.unwrap_or(defaults.continue_prompt),
            completion_promise: self
                .completion_promise
                .unwrap_or(defaults.completion_promise),
            max_iterations: self.max_iterations.unwrap_or(defaults.max_iterations),
            no_progress_threshold: self
                .no_progress_threshold
                .unwrap_or(defaults.no_progress_threshold),
            iteration_timeout: self
                .iteration_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.iteration_timeout),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    /// `direct`, `autonomous_loop`, or `team_spawn`.
    execution_type: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    cwd: Option<String>,
    idle_timeout_secs: Option<u64>,
    /// Loop settings; only meaningful for `autonomous_loop`.
    config: Option<LoopConfigRequest>,
}

/// POST /api/sessions — Create and start a session.
async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<serde_json::Value>, FlowError> {
    let mode = ExecutionMode::parse(&body.execution_type).ok_or_else(|| {
        FlowError::BadRequest(format!(
            "Unknown execution type '{}' (expected direct, autonomous_loop, or team_spawn)",
            body.execution_type
        ))
    })?;
    if body.command.trim().is_empty() {
        return Err(FlowError::BadRequest("Command must not be empty".to_string()));
    }

    let mut spec = SessionSpec::direct(body.command)
        .with_mode(mode)
        .with_args(body.args);
    if let Some(cwd) = body.cwd {
        spec = spec.with_cwd(cwd);
    }
    if let Some(secs) = body.idle_timeout_secs {
        spec = spec.with_idle_timeout(Duration::from_secs(secs));
    }
    if mode == ExecutionMode::AutonomousLoop {
        spec = spec.with_loop_config(body.config.unwrap_or_default().into_config());
    }

    let session = state.orchestrator.start_session(spec).await?;
    tracing::info!("[API] Started {} session {}", mode.as_str(), session.id);
    Ok(Json(serde_json::json!({
        "sessionId": session.id,
        "status": session.status,
    })))
}

/// GET /api/sessions — List all sessions, oldest first.
async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.orchestrator.list_sessions();
    Json(serde_json::json!({ "sessions": sessions }))
}

/// GET /api/sessions/{session_id} — Session record plus mode-specific state.
async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, FlowError> {
    let session: Session = state.orchestrator.get_session(&session_id)?;
    let mut body = serde_json::json!({ "session": session });

    match session.mode {
        ExecutionMode::AutonomousLoop => {
            body["loopState"] = serde_json::to_value(state.orchestrator.loop_state(&session_id)?)
                .unwrap_or(serde_json::Value::Null);
        }
        ExecutionMode::TeamSpawn => {
            body["teamState"] = serde_json::to_value(state.orchestrator.team_state(&session_id)?)
                .unwrap_or(serde_json::Value::Null);
        }
        ExecutionMode::Direct => {}
    }
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct SendInputRequest {
    text: String,
}

/// POST /api/sessions/{session_id}/input — Feed a line to the process.
/// Rejected unless the session is active.
async fn send_input(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<SendInputRequest>,
) -> Result<Json<serde_json::Value>, FlowError> {
    state.orchestrator.send_input(&session_id, &body.text).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// POST /api/sessions/{session_id}/pause
async fn pause_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, FlowError> {
    let session = state.orchestrator.pause_session(&session_id).await?;
    Ok(Json(serde_json::json!({ "status": session.status })))
}

/// POST /api/sessions/{session_id}/resume
async fn resume_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, FlowError> {
    let session = state.orchestrator.resume_session(&session_id).await?;
    Ok(Json(serde_json::json!({ "status": session.status })))
}

/// POST /api/sessions/{session_id}/stop — Graceful stop; waits for the
/// session to reach a terminal status. Idempotent.
async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, FlowError> {
    let session = state.orchestrator.stop_session(&session_id).await?;
    Ok(Json(serde_json::json!({ "status": session.status })))
}

/// GET /api/sessions/{session_id}/stream — SSE stream of the session's log
/// lines: backlog first, then live output until the session closes.
async fn stream_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<
    Sse<std::pin::Pin<Box<dyn tokio_stream::Stream<Item = Result<Event, Infallible>> + Send>>>,
    FlowError,
> {
    // Surface a 404 for unknown IDs instead of an empty stream.
    state.orchestrator.get_session(&session_id)?;
    Ok(sse_log_stream(&state, &session_id))
}
