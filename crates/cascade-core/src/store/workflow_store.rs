use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::FlowError;
use crate::models::WorkflowGraph;

/// Durable storage for authored graph definitions. The definition is stored
/// whole as JSON; the relational columns exist for listing and lookup.
#[derive(Clone)]
pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace a graph definition, keyed by the graph's own ID.
    pub async fn save(&self, graph: &WorkflowGraph) -> Result<(), FlowError> {
        let id = graph.id.clone();
        let name = graph.name.clone().unwrap_or_else(|| graph.id.clone());
        let definition = serde_json::to_string(graph)
            .map_err(|e| FlowError::BadRequest(format!("Unserializable graph: {}", e)))?;
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflows (id, name, definition, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?4) \
                     ON CONFLICT(id) DO UPDATE SET name=?2, definition=?3, updated_at=?4",
                    rusqlite::params![id, name, definition, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkflowGraph>, FlowError> {
        let id = id.to_string();
        let definition: Option<String> = self
            .db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT definition FROM workflows WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        match definition {
            Some(json) => {
                let graph = serde_json::from_str(&json).map_err(|e| {
                    FlowError::Database(format!("Corrupt graph definition: {}", e))
                })?;
                Ok(Some(graph))
            }
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<WorkflowGraph>, FlowError> {
        let definitions: Vec<String> = self
            .db
            .with_conn_async(|conn| {
                let mut stmt =
                    conn.prepare("SELECT definition FROM workflows ORDER BY created_at DESC")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        definitions
            .iter()
            .map(|json| {
                serde_json::from_str(json)
                    .map_err(|e| FlowError::Database(format!("Corrupt graph definition: {}", e)))
            })
            .collect()
    }

    /// Delete a definition. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> Result<bool, FlowError> {
        let id = id.to_string();
        let affected = self
            .db
            .with_conn_async(move |conn| {
                conn.execute("DELETE FROM workflows WHERE id = ?1", rusqlite::params![id])
            })
            .await?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph(id: &str) -> WorkflowGraph {
        WorkflowGraph::from_yaml(&format!(
            r#"
id: "{}"
name: "Sample"
nodes:
  - id: start
    type: trigger
  - id: run
    type: command
    config: {{ command: "true" }}
edges:
  - {{ source: start, target: run }}
"#,
            id
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_get_roundtrip() {
        let store = WorkflowStore::new(Database::open_in_memory().unwrap());
        store.save(&sample_graph("g1")).await.unwrap();

        let loaded = store.get("g1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "g1");
        assert_eq!(loaded.nodes.len(), 2);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_is_upsert() {
        let store = WorkflowStore::new(Database::open_in_memory().unwrap());
        store.save(&sample_graph("g1")).await.unwrap();

        let mut updated = sample_graph("g1");
        updated.name = Some("Renamed".to_string());
        store.save(&updated).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name.as_deref(), Some("Renamed"));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = WorkflowStore::new(Database::open_in_memory().unwrap());
        store.save(&sample_graph("g1")).await.unwrap();
        assert!(store.delete("g1").await.unwrap());
        assert!(!store.delete("g1").await.unwrap());
    }
}
