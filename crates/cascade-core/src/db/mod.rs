//! SQLite database layer for Cascade.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::FlowError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, FlowError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| FlowError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| FlowError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, FlowError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| FlowError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| FlowError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, FlowError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FlowError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| FlowError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, FlowError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| FlowError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), FlowError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflows (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    definition      TEXT NOT NULL,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS graph_runs (
                    id              TEXT PRIMARY KEY,
                    graph_id        TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'running',
                    error           TEXT,
                    diagnostics     TEXT NOT NULL DEFAULT '[]',
                    started_at      INTEGER NOT NULL,
                    finished_at     INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_graph_runs_graph ON graph_runs(graph_id);
                CREATE INDEX IF NOT EXISTS idx_graph_runs_status ON graph_runs(status);

                CREATE TABLE IF NOT EXISTS node_runs (
                    run_id          TEXT NOT NULL REFERENCES graph_runs(id) ON DELETE CASCADE,
                    node_id         TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'pending',
                    attempts        INTEGER NOT NULL DEFAULT 0,
                    output          TEXT,
                    last_error      TEXT,
                    started_at      INTEGER,
                    finished_at     INTEGER,
                    PRIMARY KEY (run_id, node_id)
                );
                CREATE INDEX IF NOT EXISTS idx_node_runs_run ON node_runs(run_id);
                ",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_creates_tables() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
                     AND name IN ('workflows', 'graph_runs', 'node_runs')",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_with_conn_async_round_trip() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn_async(|conn| {
            conn.execute(
                "INSERT INTO workflows (id, name, definition, created_at, updated_at)
                 VALUES ('w1', 'demo', '{}', 0, 0)",
                [],
            )
        })
        .await
        .unwrap();

        let name: String = db
            .with_conn_async(|conn| {
                conn.query_row("SELECT name FROM workflows WHERE id = 'w1'", [], |row| {
                    row.get(0)
                })
            })
            .await
            .unwrap();
        assert_eq!(name, "demo");
    }
}
