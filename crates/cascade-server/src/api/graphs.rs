//! Workflow graph CRUD and validation.
//!
//! Definitions are accepted as YAML or JSON in the raw request body (JSON is
//! a YAML subset, so both parse through the same path). Saving validates
//! first: a definition that fails validation is never persisted.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

use cascade_core::{validate, AppState, FlowError, WorkflowGraph};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_graphs).post(create_graph))
        .route("/validate", post(validate_graph))
        .route(
            "/{graph_id}",
            get(get_graph).put(update_graph).delete(delete_graph),
        )
}

fn parse_definition(body: &str) -> Result<WorkflowGraph, FlowError> {
    WorkflowGraph::from_yaml(body).map_err(FlowError::BadRequest)
}

/// GET /api/graphs — List stored workflow graphs.
async fn list_graphs(State(state): State<AppState>) -> Result<Json<serde_json::Value>, FlowError> {
    let graphs = state.workflows.list().await?;
    let summaries: Vec<serde_json::Value> = graphs
        .iter()
        .map(|g| {
            serde_json::json!({
                "id": g.id,
                "name": g.name,
                "nodeCount": g.nodes.len(),
                "edgeCount": g.edges.len(),
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "graphs": summaries })))
}

/// POST /api/graphs — Validate and store a workflow graph definition.
async fn create_graph(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<serde_json::Value>, FlowError> {
    let graph = parse_definition(&body)?;
    let validated = validate(graph)?;
    state.workflows.save(&validated.graph).await?;
    tracing::info!("[API] Stored graph '{}'", validated.graph.id);
    Ok(Json(serde_json::json!({ "graphId": validated.graph.id })))
}

/// POST /api/graphs/validate — Validate a definition without storing it.
/// Always 200; the body reports every violation found.
async fn validate_graph(body: String) -> Result<Json<serde_json::Value>, FlowError> {
    let graph = parse_definition(&body)?;
    match validate(graph) {
        Ok(_) => Ok(Json(serde_json::json!({ "valid": true, "violations": [] }))),
        Err(FlowError::Validation(violations)) => Ok(Json(serde_json::json!({
            "valid": false,
            "violations": violations,
        }))),
        Err(other) => Err(other),
    }
}

/// GET /api/graphs/{graph_id} — Fetch a stored definition.
async fn get_graph(
    State(state): State<AppState>,
    Path(graph_id): Path<String>,
) -> Result<Json<WorkflowGraph>, FlowError> {
    let graph = state
        .workflows
        .get(&graph_id)
        .await?
        .ok_or_else(|| FlowError::NotFound(format!("Graph '{}' not found", graph_id)))?;
    Ok(Json(graph))
}

/// PUT /api/graphs/{graph_id} — Replace a stored definition. The body's ID
/// must match the path.
async fn update_graph(
    State(state): State<AppState>,
    Path(graph_id): Path<String>,
    body: String,
) -> Result<Json<serde_json::Value>, FlowError> {
    let graph = parse_definition(&body)?;
    if graph.id != graph_id {
        return Err(FlowError::BadRequest(format!(
            "Definition ID '{}' does not match path '{}'",
            graph.id, graph_id
        )));
    }
    if state.workflows.get(&graph_id).await?.is_none() {
        return Err(FlowError::NotFound(format!(
            "Graph '{}' not found",
            graph_id
        )));
    }
    let validated = validate(graph)?;
    state.workflows.save(&validated.graph).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// DELETE /api/graphs/{graph_id} — Remove a stored definition.
async fn delete_graph(
    State(state): State<AppState>,
    Path(graph_id): Path<String>,
) -> Result<Json<serde_json::Value>, FlowError> {
    let removed = state.workflows.delete(&graph_id).await?;
    if !removed {
        return Err(FlowError::NotFound(format!(
            "Graph '{}' not found",
            graph_id
        )));
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}
