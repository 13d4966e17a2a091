//! Durable execution records: one `GraphRun` per graph execution, one
//! `NodeRun` per visited node. A `GraphRun` is immutable history once it
//! reaches a terminal status; only the engine that owns it mutates it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal and in-flight status of a whole graph run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Status of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRunStatus::Pending => "pending",
            NodeRunStatus::Running => "running",
            NodeRunStatus::Succeeded => "succeeded",
            NodeRunStatus::Failed => "failed",
            NodeRunStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeRunStatus::Succeeded | NodeRunStatus::Failed | NodeRunStatus::Skipped
        )
    }
}

/// Execution record for one node. Created when the engine dispatches the
/// node, finalized when its executor returns or exhausts retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRun {
    pub node_id: String,
    pub status: NodeRunStatus,
    /// Total attempts made (never exceeds retry_max + 1)
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeRun {
    pub fn pending(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: NodeRunStatus::Pending,
            attempts: 0,
            output: None,
            last_error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Execution record for a whole graph run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRun {
    pub id: String,
    pub graph_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Human-readable reason for a failed/cancelled run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Non-fatal errors surfaced by `continue_with_error` nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
    pub node_runs: Vec<NodeRun>,
}

impl GraphRun {
    pub fn new(graph_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            graph_id: graph_id.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            diagnostics: Vec::new(),
            node_runs: Vec::new(),
        }
    }

    pub fn node_run(&self, node_id: &str) -> Option<&NodeRun> {
        self.node_runs.iter().find(|nr| nr.node_id == node_id)
    }
}
