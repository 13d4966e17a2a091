//! Workflow graph validation and execution.

pub mod context;
pub mod engine;
pub mod executors;
pub mod validate;

pub use context::ExecutionContext;
pub use engine::{EngineConfig, GraphEngine};
pub use executors::{builtin_presets, AgentPreset, Dispatcher, NodeOutcome};
pub use validate::{validate, ValidatedGraph};
