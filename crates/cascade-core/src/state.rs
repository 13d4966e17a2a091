//! Shared application state wired up once at startup and cloned into every
//! handler and background task.

use std::path::PathBuf;
use std::sync::Arc;

use crate::db::Database;
use crate::error::FlowError;
use crate::graph::{Dispatcher, EngineConfig, GraphEngine};
use crate::logs::LogBroadcaster;
use crate::runners::{ScriptSkillRunner, ShellCommandRunner};
use crate::session::SessionOrchestrator;
use crate::store::{RunStore, WorkflowStore};

/// Knobs for assembling the core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Directory of skill scripts (`<name>.sh`).
    pub skills_dir: PathBuf,
    /// Working directory for nodes that don't specify one.
    pub default_cwd: String,
    /// Per-run concurrency limit; `None` means unlimited.
    pub max_concurrency: Option<usize>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            skills_dir: PathBuf::from("skills"),
            default_cwd: ".".to_string(),
            max_concurrency: None,
        }
    }
}

/// The assembled core: stores, broadcaster, orchestrator, and engine.
pub struct AppStateInner {
    pub db: Database,
    pub workflows: WorkflowStore,
    pub runs: RunStore,
    pub logs: LogBroadcaster,
    pub orchestrator: SessionOrchestrator,
    pub engine: GraphEngine,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn new(db: Database, config: CoreConfig) -> Self {
        let logs = LogBroadcaster::new();
        let orchestrator = SessionOrchestrator::new(logs.clone());
        let runs = RunStore::new(db.clone());
        let dispatcher = Arc::new(
            Dispatcher::new(
                Arc::new(ScriptSkillRunner::new(config.skills_dir.clone())),
                Arc::new(ShellCommandRunner),
                orchestrator.clone(),
            )
            .with_default_cwd(config.default_cwd.clone()),
        );
        let engine = GraphEngine::new(
            dispatcher,
            runs.clone(),
            orchestrator.clone(),
            logs.clone(),
            EngineConfig {
                max_concurrency: config.max_concurrency,
            },
        );
        Self {
            workflows: WorkflowStore::new(db.clone()),
            runs,
            logs,
            orchestrator,
            engine,
            db,
        }
    }

    /// In-memory state for tests.
    pub fn in_memory() -> Result<AppState, FlowError> {
        Ok(Arc::new(Self::new(
            Database::open_in_memory()?,
            CoreConfig::default(),
        )))
    }
}
