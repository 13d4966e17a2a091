//! Run control: start, inspect, cancel, and stream logs over SSE.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, Sse},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio_stream::StreamExt as _;

use cascade_core::{AppState, FlowError, GraphRun};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_runs).post(start_run))
        .route("/{run_id}", get(get_run))
        .route("/{run_id}/cancel", post(cancel_run))
        .route("/{run_id}/stream", get(stream_run))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRunRequest {
    graph_id: String,
    payload: Option<String>,
}

/// POST /api/runs — Start a run of a stored graph. Returns immediately with
/// the new run ID; progress is observed via GET or the SSE stream.
async fn start_run(
    State(state): State<AppState>,
    Json(body): Json<StartRunRequest>,
) -> Result<Json<serde_json::Value>, FlowError> {
    let graph = state
        .workflows
        .get(&body.graph_id)
        .await?
        .ok_or_else(|| FlowError::NotFound(format!("Graph '{}' not found", body.graph_id)))?;

    let run = state.engine.start(graph, body.payload).await?;
    tracing::info!("[API] Started run {} of graph '{}'", run.id, body.graph_id);
    Ok(Json(serde_json::json!({
        "runId": run.id,
        "status": run.status,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListRunsQuery {
    graph_id: String,
}

/// GET /api/runs?graphId=... — List runs of one graph, newest first.
async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<serde_json::Value>, FlowError> {
    let runs = state.runs.list_by_graph(&query.graph_id).await?;
    Ok(Json(serde_json::json!({ "runs": runs })))
}

/// GET /api/runs/{run_id} — Full run record including per-node results.
async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<GraphRun>, FlowError> {
    let run = state
        .runs
        .get(&run_id)
        .await?
        .ok_or_else(|| FlowError::NotFound(format!("Run '{}' not found", run_id)))?;
    Ok(Json(run))
}

/// POST /api/runs/{run_id}/cancel — Request cancellation. Idempotent on
/// already-terminal runs.
async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, FlowError> {
    state.engine.cancel(&run_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// GET /api/runs/{run_id}/stream — SSE stream of the run's log lines.
/// Replays the backlog, then follows live output until the run's stream is
/// closed. A comment heartbeat keeps proxies from dropping the connection.
async fn stream_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Sse<std::pin::Pin<Box<dyn tokio_stream::Stream<Item = Result<Event, Infallible>> + Send>>> {
    sse_log_stream(&state, &run_id)
}

/// Shared SSE plumbing for run and session log streams.
pub(crate) fn sse_log_stream(
    state: &AppState,
    key: &str,
) -> Sse<std::pin::Pin<Box<dyn tokio_stream::Stream<Item = Result<Event, Infallible>> + Send>>> {
    let lines = state.logs.stream(key);

    let events = async_stream::stream! {
        tokio::pin!(lines);
        while let Some(line) = lines.next().await {
            let data = serde_json::to_string(&line)
                .unwrap_or_else(|_| "{}".to_string());
            yield Ok::<_, Infallible>(Event::default().data(data));
        }
    };

    let heartbeat = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(
        std::time::Duration::from_secs(15),
    ))
    .map(|_| Ok(Event::default().comment("heartbeat")));

    type SseStream =
        std::pin::Pin<Box<dyn tokio_stream::Stream<Item = Result<Event, Infallible>> + Send>>;

    let stream: SseStream = Box::pin(tokio_stream::StreamExt::merge(events, heartbeat));
    Sse::new(stream)
}
