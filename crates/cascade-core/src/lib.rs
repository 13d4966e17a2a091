//! Cascade core — workflow DAG execution and interactive session
//! orchestration.
//!
//! The crate is transport-agnostic: the HTTP layer lives in
//! `cascade-server`, the CLI in `cascade-cli`. Enable the `axum` feature to
//! get an `IntoResponse` impl on [`error::FlowError`].

pub mod db;
pub mod error;
pub mod graph;
pub mod logs;
pub mod models;
pub mod runners;
pub mod session;
pub mod state;
pub mod store;

pub use db::Database;
pub use error::FlowError;
pub use graph::{validate, Dispatcher, EngineConfig, GraphEngine, NodeOutcome, ValidatedGraph};
pub use logs::{LogBroadcaster, LogLine, LogSource};
pub use models::{
    ExecutionMode, GraphRun, Node, NodeKind, NodeRun, NodeRunStatus, NodeType, RunStatus, Session,
    SessionStatus, WorkflowGraph,
};
pub use session::{autonomous::LoopConfig, SessionOrchestrator, SessionSpec};
pub use state::{AppState, AppStateInner, CoreConfig};
pub use store::{RunStore, WorkflowStore};
