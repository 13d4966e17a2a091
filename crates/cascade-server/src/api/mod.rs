pub mod graphs;
pub mod runs;
pub mod sessions;

use axum::Router;

use cascade_core::AppState;

/// Build the complete API router with all sub-routes.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/api/graphs", graphs::router())
        .nest("/api/runs", runs::router())
        .nest("/api/sessions", sessions::router())
}
