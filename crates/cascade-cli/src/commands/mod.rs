//! CLI command implementations.
//!
//! Graph commands assemble the core directly through `AppState`; session
//! commands go through the HTTP API of a running server.

pub mod graph;
pub mod server;
pub mod session;

use cascade_core::{AppState, AppStateInner, CoreConfig, Database};
use std::sync::Arc;

/// Initialize a shared `AppState` from the given SQLite database path.
///
/// This mirrors `cascade_server::create_app_state` but avoids pulling in
/// the HTTP server for local commands.
pub async fn init_state(db_path: &str, config: CoreConfig) -> AppState {
    let db = Database::open(db_path).unwrap_or_else(|e| {
        eprintln!("Failed to open database '{}': {}", db_path, e);
        std::process::exit(1);
    });

    let state: AppState = Arc::new(AppStateInner::new(db, config));

    if let Err(e) = state.runs.reconcile_interrupted().await {
        eprintln!("Failed to reconcile interrupted runs: {}", e);
        std::process::exit(1);
    }

    state
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}
