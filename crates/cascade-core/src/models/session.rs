//! Session records and mode-specific state.
//!
//! A `Session` is one managed lifetime of an interactive external process.
//! It is owned exclusively by the `SessionOrchestrator`; node runs reference
//! sessions by ID but never own them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a session executes its underlying process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Spawn once, stream until exit; exit code decides the terminal status.
    Direct,
    /// Re-invoke the process each iteration until a completion promise,
    /// the iteration cap, or the no-progress circuit breaker.
    AutonomousLoop,
    /// Spawn once in team mode; structured team/task events are parsed out
    /// of the output stream.
    TeamSpawn,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Direct => "direct",
            ExecutionMode::AutonomousLoop => "autonomous_loop",
            ExecutionMode::TeamSpawn => "team_spawn",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "autonomous_loop" => Some(Self::AutonomousLoop),
            "team_spawn" => Some(Self::TeamSpawn),
            _ => None,
        }
    }
}

/// Session lifecycle: `starting -> active -> (paused <-> active) ->
/// (completed | failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Active,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

/// Public record of a managed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub mode: ExecutionMode,
    pub status: SessionStatus,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: String,
    /// Graph run this session belongs to, if any. Standalone interactive
    /// sessions have no run ID and outlive any single node run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Human-readable reason for a failed session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when an autonomous loop ended via the safety stop rather than
    /// an ordinary failure.
    #[serde(default)]
    pub circuit_breaker_triggered: bool,
}

/// Mutable per-iteration state of an autonomous-loop session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomousLoopState {
    pub iteration: u32,
    pub max_iterations: u32,
    /// Substring whose appearance in output means the task is done
    pub completion_promise: String,
    pub no_progress_count: u32,
    pub no_progress_threshold: u32,
    pub circuit_breaker_triggered: bool,
}

/// Status of a tracked team task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamTaskStatus {
    Pending,
    InProgress,
    Completed,
}

/// A cooperating sub-agent announced by a team-mode process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    pub name: String,
    pub agent_id: String,
    pub agent_type: String,
}

/// A task announced by a team-mode process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamTask {
    pub id: String,
    pub subject: String,
    pub status: TeamTaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Incrementally populated state of a `team_spawn` session. Read-only to
/// everything except the orchestrator's event parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamState {
    /// Null until the underlying process announces it
    pub team_name: Option<String>,
    pub members: Vec<TeamMember>,
    pub tasks: Vec<TeamTask>,
}
