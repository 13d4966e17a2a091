//! Core data model: workflow graphs, run records, and sessions.

pub mod graph;
pub mod run;
pub mod session;

pub use graph::{
    ConditionType, Edge, ErrorMode, Node, NodeKind, NodeType, TransformOp, TriggerKind,
    WorkflowGraph, BRANCH_FALSE, BRANCH_TRUE,
};
pub use run::{GraphRun, NodeRun, NodeRunStatus, RunStatus};
pub use session::{
    AutonomousLoopState, ExecutionMode, Session, SessionStatus, TeamMember, TeamState, TeamTask,
    TeamTaskStatus,
};
