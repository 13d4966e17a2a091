//! Cascade HTTP server.
//!
//! A thin axum adapter over `cascade-core`: workflow CRUD, run control with
//! SSE log streaming, and interactive session management. The core stays
//! transport-agnostic; everything HTTP-shaped lives here.

pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use cascade_core::{AppState, AppStateInner, CoreConfig, Database};

/// Configuration for the Cascade backend server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    pub core: CoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3440,
            db_path: "cascade.db".to_string(),
            core: CoreConfig::default(),
        }
    }
}

/// Create a shared `AppState` from a database path.
///
/// Runs startup reconciliation: graph runs left `running` by a previous
/// process are marked failed so the stored history never shows a run that
/// no live engine owns.
pub async fn create_app_state(db_path: &str, core: CoreConfig) -> Result<AppState, String> {
    let db = Database::open(db_path).map_err(|e| format!("Failed to open database: {}", e))?;

    let state: AppState = Arc::new(AppStateInner::new(db, core));

    let reconciled = state
        .runs
        .reconcile_interrupted()
        .await
        .map_err(|e| format!("Failed to reconcile interrupted runs: {}", e))?;
    if reconciled > 0 {
        tracing::warn!("[Server] Marked {} interrupted run(s) as failed", reconciled);
    }

    Ok(state)
}

/// Build the full router over a pre-built state.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api::api_router())
        .route("/api/health", axum::routing::get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the backend server. Returns the actual address it listens on.
pub async fn start_server(config: ServerConfig) -> Result<SocketAddr, String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cascade_server=info,cascade_core=info,tower_http=info".into()),
        )
        .init();

    tracing::info!(
        "Starting Cascade backend server on {}:{}",
        config.host,
        config.port
    );

    let state = create_app_state(&config.db_path, config.core.clone()).await?;
    start_server_with_state(config, state).await
}

/// Start the HTTP server with a pre-built `AppState`. Useful when the state
/// is shared with another consumer (e.g. an embedded scheduler).
pub async fn start_server_with_state(
    config: ServerConfig,
    state: AppState,
) -> Result<SocketAddr, String> {
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| format!("Invalid address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", addr, e))?;

    let local_addr = listener
        .local_addr()
        .map_err(|e| format!("Failed to get local address: {}", e))?;

    tracing::info!("Cascade backend server listening on {}", local_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok(local_addr)
}

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "server": "cascade-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
