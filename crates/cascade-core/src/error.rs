//! Core error type for the Cascade platform.
//!
//! `FlowError` is used throughout the core domain (stores, engine,
//! orchestrator). When the `axum` feature is enabled, it also implements
//! `IntoResponse` so it can be used directly as an axum handler error type.
//! Every terminal failure carries a human-readable reason plus a structured
//! `kind` string so callers never have to parse messages.

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// The graph failed validation. Carries every violation found, not
    /// just the first, so the caller can fix all problems in one pass.
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Execution error: {0}")]
    Execution(String),

    /// The autonomous loop's safety stop. Deliberately distinct from
    /// `Execution` — it signals a policy, not a process crash.
    #[error("Circuit breaker triggered: {0}")]
    CircuitBreaker(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl FlowError {
    /// Stable machine-readable kind, serialized alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Validation(_) => "validation",
            FlowError::Spawn(_) => "spawn",
            FlowError::InvalidState(_) => "invalid_state",
            FlowError::Execution(_) => "execution",
            FlowError::CircuitBreaker(_) => "circuit_breaker",
            FlowError::Timeout(_) => "timeout",
            FlowError::Database(_) => "database",
            FlowError::NotFound(_) => "not_found",
            FlowError::BadRequest(_) => "bad_request",
        }
    }
}

// ---------------------------------------------------------------------------
// axum integration (opt-in via feature flag)
// ---------------------------------------------------------------------------

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for FlowError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            FlowError::Validation(_) | FlowError::BadRequest(_) => StatusCode::BAD_REQUEST,
            FlowError::NotFound(_) => StatusCode::NOT_FOUND,
            FlowError::InvalidState(_) => StatusCode::CONFLICT,
            FlowError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            FlowError::Spawn(_)
            | FlowError::Execution(_)
            | FlowError::CircuitBreaker(_)
            | FlowError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self {
            FlowError::Validation(violations) => serde_json::json!({
                "error": self.to_string(),
                "kind": self.kind(),
                "violations": violations,
            }),
            _ => serde_json::json!({
                "error": self.to_string(),
                "kind": self.kind(),
            }),
        };

        (status, axum::Json(body)).into_response()
    }
}
