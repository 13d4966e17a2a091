use chrono::{DateTime, TimeZone, Utc};
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::FlowError;
use crate::models::{GraphRun, NodeRun, NodeRunStatus, RunStatus};

/// Durable storage for run records. The engine persists every status
/// transition as it happens, so a crash leaves an accurate trail; leftover
/// `running` rows are reconciled to `failed` at startup.
#[derive(Clone)]
pub struct RunStore {
    db: Database,
}

impl RunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a freshly created run along with its pending node rows.
    pub async fn create(&self, run: &GraphRun) -> Result<(), FlowError> {
        let run = run.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO graph_runs (id, graph_id, status, error, diagnostics, started_at, finished_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        run.id,
                        run.graph_id,
                        run.status.as_str(),
                        run.error,
                        serde_json::to_string(&run.diagnostics).unwrap_or_else(|_| "[]".into()),
                        run.started_at.timestamp_millis(),
                        run.finished_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                for nr in &run.node_runs {
                    conn.execute(
                        "INSERT INTO node_runs (run_id, node_id, status, attempts, output, last_error, started_at, finished_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        rusqlite::params![
                            run.id,
                            nr.node_id,
                            nr.status.as_str(),
                            nr.attempts,
                            nr.output,
                            nr.last_error,
                            nr.started_at.map(|t| t.timestamp_millis()),
                            nr.finished_at.map(|t| t.timestamp_millis()),
                        ],
                    )?;
                }
                Ok(())
            })
            .await
    }

    /// Persist one node's current state.
    pub async fn save_node_run(&self, run_id: &str, node_run: &NodeRun) -> Result<(), FlowError> {
        let run_id = run_id.to_string();
        let nr = node_run.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO node_runs (run_id, node_id, status, attempts, output, last_error, started_at, finished_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                     ON CONFLICT(run_id, node_id) DO UPDATE SET \
                       status=?3, attempts=?4, output=?5, last_error=?6, started_at=?7, finished_at=?8",
                    rusqlite::params![
                        run_id,
                        nr.node_id,
                        nr.status.as_str(),
                        nr.attempts,
                        nr.output,
                        nr.last_error,
                        nr.started_at.map(|t| t.timestamp_millis()),
                        nr.finished_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Persist the run's top-level status, error, and diagnostics.
    pub async fn save_run(&self, run: &GraphRun) -> Result<(), FlowError> {
        let run = run.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE graph_runs SET status=?2, error=?3, diagnostics=?4, finished_at=?5 WHERE id=?1",
                    rusqlite::params![
                        run.id,
                        run.status.as_str(),
                        run.error,
                        serde_json::to_string(&run.diagnostics).unwrap_or_else(|_| "[]".into()),
                        run.finished_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<GraphRun>, FlowError> {
        let run_id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let run = conn
                    .query_row(
                        "SELECT id, graph_id, status, error, diagnostics, started_at, finished_at \
                         FROM graph_runs WHERE id = ?1",
                        rusqlite::params![run_id],
                        row_to_run,
                    )
                    .optional()?;
                let Some(mut run) = run else {
                    return Ok(None);
                };

                let mut stmt = conn.prepare(
                    "SELECT node_id, status, attempts, output, last_error, started_at, finished_at \
                     FROM node_runs WHERE run_id = ?1",
                )?;
                run.node_runs = stmt
                    .query_map(rusqlite::params![run.id], row_to_node_run)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(run))
            })
            .await
    }

    /// Runs for one graph, newest first, without their node rows.
    pub async fn list_by_graph(&self, graph_id: &str) -> Result<Vec<GraphRun>, FlowError> {
        let graph_id = graph_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, graph_id, status, error, diagnostics, started_at, finished_at \
                     FROM graph_runs WHERE graph_id = ?1 ORDER BY started_at DESC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![graph_id], row_to_run)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Mark every `running` run (and its `running`/`pending` nodes) left
    /// over from a previous process as failed. Called once at startup; a
    /// run's in-memory state dies with the process, so these can never
    /// complete. Returns the number of runs reconciled.
    pub async fn reconcile_interrupted(&self) -> Result<usize, FlowError> {
        let now = Utc::now().timestamp_millis();
        let count = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE node_runs SET status='failed', last_error='Interrupted by restart', finished_at=?1 \
                     WHERE status IN ('running', 'pending') \
                       AND run_id IN (SELECT id FROM graph_runs WHERE status='running')",
                    rusqlite::params![now],
                )?;
                conn.execute(
                    "UPDATE graph_runs SET status='failed', error='Interrupted by restart', finished_at=?1 \
                     WHERE status='running'",
                    rusqlite::params![now],
                )
            })
            .await?;
        if count > 0 {
            tracing::warn!("[RunStore] Reconciled {} interrupted run(s)", count);
        }
        Ok(count)
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<GraphRun, rusqlite::Error> {
    let status: String = row.get(2)?;
    let diagnostics: String = row.get(4)?;
    Ok(GraphRun {
        id: row.get(0)?,
        graph_id: row.get(1)?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        error: row.get(3)?,
        diagnostics: serde_json::from_str(&diagnostics).unwrap_or_default(),
        started_at: millis_to_datetime(row.get(5)?),
        finished_at: row.get::<_, Option<i64>>(6)?.map(millis_to_datetime),
        node_runs: Vec::new(),
    })
}

fn row_to_node_run(row: &rusqlite::Row<'_>) -> Result<NodeRun, rusqlite::Error> {
    let status: String = row.get(1)?;
    Ok(NodeRun {
        node_id: row.get(0)?,
        status: NodeRunStatus::parse(&status).unwrap_or(NodeRunStatus::Failed),
        attempts: row.get(2)?,
        output: row.get(3)?,
        last_error: row.get(4)?,
        started_at: row.get::<_, Option<i64>>(5)?.map(millis_to_datetime),
        finished_at: row.get::<_, Option<i64>>(6)?.map(millis_to_datetime),
    })
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RunStore {
        RunStore::new(Database::open_in_memory().unwrap())
    }

    fn run_with_nodes(graph_id: &str) -> GraphRun {
        let mut run = GraphRun::new(graph_id);
        run.node_runs.push(NodeRun::pending("start"));
        run.node_runs.push(NodeRun::pending("build"));
        run
    }

    #[tokio::test]
    async fn test_create_and_get_with_node_runs() {
        let store = store();
        let run = run_with_nodes("g1");
        store.create(&run).await.unwrap();

        let loaded = store.get(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.graph_id, "g1");
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.node_runs.len(), 2);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_node_run_transitions_are_persisted() {
        let store = store();
        let run = run_with_nodes("g1");
        store.create(&run).await.unwrap();

        let mut nr = run.node_runs[1].clone();
        nr.status = NodeRunStatus::Succeeded;
        nr.attempts = 2;
        nr.output = Some("done".to_string());
        nr.finished_at = Some(Utc::now());
        store.save_node_run(&run.id, &nr).await.unwrap();

        let loaded = store.get(&run.id).await.unwrap().unwrap();
        let loaded_nr = loaded.node_run("build").unwrap();
        assert_eq!(loaded_nr.status, NodeRunStatus::Succeeded);
        assert_eq!(loaded_nr.attempts, 2);
        assert_eq!(loaded_nr.output.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_save_run_updates_status_and_diagnostics() {
        let store = store();
        let mut run = run_with_nodes("g1");
        store.create(&run).await.unwrap();

        run.status = RunStatus::Completed;
        run.finished_at = Some(Utc::now());
        run.diagnostics.push("node 'x' failed but continued".to_string());
        store.save_run(&run).await.unwrap();

        let loaded = store.get(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.diagnostics.len(), 1);
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_reconcile_interrupted_marks_running_failed() {
        let store = store();
        let stale = run_with_nodes("g1");
        store.create(&stale).await.unwrap();

        let mut finished = run_with_nodes("g1");
        finished.status = RunStatus::Completed;
        store.create(&finished).await.unwrap();
        store.save_run(&finished).await.unwrap();

        let reconciled = store.reconcile_interrupted().await.unwrap();
        assert_eq!(reconciled, 1);

        let loaded = store.get(&stale.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("Interrupted by restart"));
        assert!(loaded
            .node_runs
            .iter()
            .all(|nr| nr.status == NodeRunStatus::Failed));

        let untouched = store.get(&finished.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, RunStatus::Completed);
    }
}
