//! Graph Execution Engine.
//!
//! One engine task owns one `GraphRun` from dispatch to terminal status.
//! Scheduling is Kahn-style: a node becomes ready once every parent has a
//! terminal node run; it executes if at least one incoming edge is active,
//! otherwise it is skipped without executing. Independent ready nodes run
//! concurrently in a `JoinSet`, optionally bounded by a semaphore. Every
//! node-run transition is persisted through the run store as it happens.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::error::FlowError;
use crate::graph::context::ExecutionContext;
use crate::graph::executors::{Dispatcher, NodeOutcome};
use crate::graph::validate::{validate, ValidatedGraph};
use crate::logs::{LogBroadcaster, LogLine};
use crate::models::{
    ErrorMode, Node, NodeKind, NodeRun, NodeRunStatus, NodeType, RunStatus, TransformOp,
    WorkflowGraph,
};
use crate::session::SessionOrchestrator;
use crate::store::RunStore;

/// Engine-wide settings.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Upper bound on nodes executing concurrently within one run.
    /// `None` means unlimited.
    pub max_concurrency: Option<usize>,
}

#[derive(Clone)]
pub struct GraphEngine {
    dispatcher: Arc<Dispatcher>,
    run_store: RunStore,
    orchestrator: SessionOrchestrator,
    logs: LogBroadcaster,
    config: EngineConfig,
    /// Cancel signal per live run.
    cancels: Arc<std::sync::Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl GraphEngine {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        run_store: RunStore,
        orchestrator: SessionOrchestrator,
        logs: LogBroadcaster,
        config: EngineConfig,
    ) -> Self {
        Self {
            dispatcher,
            run_store,
            orchestrator,
            logs,
            config,
            cancels: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Validate, persist, and start a run in a background task. Returns the
    /// initial run record; validation failures surface before any side
    /// effect.
    pub async fn start(
        &self,
        graph: WorkflowGraph,
        payload: Option<String>,
    ) -> Result<crate::models::GraphRun, FlowError> {
        let (validated, run) = self.prepare(graph, payload.clone()).await?;
        let engine = self.clone();
        let snapshot = run.clone();
        tokio::spawn(async move {
            engine.drive(validated, run, payload).await;
        });
        Ok(snapshot)
    }

    /// Validate, persist, and run to completion. Used by the CLI and tests.
    pub async fn execute(
        &self,
        graph: WorkflowGraph,
        payload: Option<String>,
    ) -> Result<crate::models::GraphRun, FlowError> {
        let (validated, run) = self.prepare(graph, payload.clone()).await?;
        let run_id = run.id.clone();
        self.drive(validated, run, payload).await;
        self.run_store
            .get(&run_id)
            .await?
            .ok_or_else(|| FlowError::Database("Run vanished during execution".to_string()))
    }

    /// Request cancellation of a live run. In-flight sessions tagged with
    /// the run are stopped; non-terminal nodes become skipped.
    pub async fn cancel(&self, run_id: &str) -> Result<(), FlowError> {
        let tx = {
            let map = self.cancels.lock().expect("cancel registry poisoned");
            map.get(run_id).cloned()
        };
        let Some(tx) = tx else {
            // Not live: either unknown or already terminal.
            let run = self
                .run_store
                .get(run_id)
                .await?
                .ok_or_else(|| FlowError::NotFound(format!("Run '{}' not found", run_id)))?;
            if run.status.is_terminal() {
                return Ok(());
            }
            return Err(FlowError::InvalidState(format!(
                "Run '{}' is not owned by this engine",
                run_id
            )));
        };
        let _ = tx.send(true);
        self.orchestrator.stop_run_sessions(run_id).await;
        Ok(())
    }

    async fn prepare(
        &self,
        graph: WorkflowGraph,
        _payload: Option<String>,
    ) -> Result<(ValidatedGraph, crate::models::GraphRun), FlowError> {
        let validated = validate(graph)?;
        let mut run = crate::models::GraphRun::new(&validated.graph.id);
        for node in &validated.graph.nodes {
            run.node_runs.push(NodeRun::pending(&node.id));
        }
        self.run_store.create(&run).await?;

        let (tx, _) = watch::channel(false);
        self.cancels
            .lock()
            .expect("cancel registry poisoned")
            .insert(run.id.clone(), tx);
        Ok((validated, run))
    }

    async fn drive(
        &self,
        validated: ValidatedGraph,
        mut run: crate::models::GraphRun,
        payload: Option<String>,
    ) {
        let run_id = run.id.clone();
        tracing::info!(
            "[Engine] Run {} started for graph '{}'",
            run_id,
            validated.graph.id
        );
        self.logs
            .publish(&run_id, LogLine::system(format!("[run] started ({})", validated.graph.id)));

        let outcome = self.schedule(&validated, &mut run, payload).await;

        run.finished_at = Some(Utc::now());
        match outcome {
            Ok(status) => {
                run.status = status;
            }
            Err(e) => {
                run.status = RunStatus::Failed;
                run.error = Some(e.to_string());
            }
        }
        if let Err(e) = self.run_store.save_run(&run).await {
            tracing::error!("[Engine] Failed to persist run {}: {}", run_id, e);
        }
        self.logs.publish(
            &run_id,
            LogLine::system(format!("[run] finished: {}", run.status.as_str())),
        );
        self.logs.close(&run_id);
        self.cancels
            .lock()
            .expect("cancel registry poisoned")
            .remove(&run_id);
        tracing::info!("[Engine] Run {} finished: {}", run_id, run.status.as_str());
    }

    async fn schedule(
        &self,
        validated: &ValidatedGraph,
        run: &mut crate::models::GraphRun,
        payload: Option<String>,
    ) -> Result<RunStatus, FlowError> {
        let graph = &validated.graph;
        let run_id = run.id.clone();
        let ctx = Arc::new(std::sync::Mutex::new(ExecutionContext::new(
            graph,
            payload.clone(),
        )));

        let incoming: HashMap<&str, Vec<&crate::models::Edge>> = {
            let mut map: HashMap<&str, Vec<&crate::models::Edge>> = HashMap::new();
            for edge in &graph.edges {
                map.entry(edge.target.as_str()).or_default().push(edge);
            }
            map
        };

        let semaphore = self
            .config
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n)));

        let mut cancel_rx = {
            let map = self.cancels.lock().expect("cancel registry poisoned");
            map.get(&run_id)
                .map(|tx| tx.subscribe())
                .unwrap_or_else(|| watch::channel(false).1)
        };

        let mut in_flight: HashSet<String> = HashSet::new();
        let mut tasks: JoinSet<(String, u32, Result<NodeOutcome, FlowError>)> = JoinSet::new();
        // Set once a stop-mode failure halts dispatch of new nodes.
        let mut halted: Option<String> = None;
        let mut cancelled = false;

        loop {
            if *cancel_rx.borrow_and_update() {
                cancelled = true;
            }

            if !cancelled && halted.is_none() {
                // Dispatch every ready node.
                let ready: Vec<&Node> = graph
                    .nodes
                    .iter()
                    .filter(|n| {
                        node_status(run, &n.id) == NodeRunStatus::Pending
                            && !in_flight.contains(&n.id)
                            && incoming
                                .get(n.id.as_str())
                                .map(|edges| {
                                    edges
                                        .iter()
                                        .all(|e| node_status(run, &e.source).is_terminal())
                                })
                                .unwrap_or(true)
                    })
                    .collect();

                for node in ready {
                    let active = match incoming.get(node.id.as_str()) {
                        None => true, // entry point (trigger)
                        Some(edges) => edges.iter().any(|e| self.edge_active(graph, run, &ctx, e)),
                    };

                    if !active {
                        self.finish_node(
                            run,
                            &node.id,
                            NodeRunStatus::Skipped,
                            0,
                            None,
                            None,
                        )
                        .await;
                        self.logs.publish(
                            &run_id,
                            LogLine::system(format!("[run] node '{}' skipped", node.id)),
                        );
                        continue;
                    }

                    // Trigger nodes pass the payload through without
                    // touching an executor.
                    if node.node_type == NodeType::Trigger {
                        let output = payload.clone().unwrap_or_default();
                        if let Ok(mut c) = ctx.lock() {
                            c.record_output(&node.id, output.clone());
                        }
                        self.finish_node(
                            run,
                            &node.id,
                            NodeRunStatus::Succeeded,
                            1,
                            Some(output),
                            None,
                        )
                        .await;
                        continue;
                    }

                    let rendered = {
                        let c = ctx.lock().expect("context poisoned");
                        let default_input = default_input(&incoming, &c, &node.id);
                        render_kind(validated.kind(&node.id), &c, &default_input)
                    };

                    self.mark_running(run, &node.id).await;
                    let node_started_at = run.node_run(&node.id).and_then(|nr| nr.started_at);
                    self.logs.publish(
                        &run_id,
                        LogLine::system(format!("[run] node '{}' started", node.id)),
                    );
                    in_flight.insert(node.id.clone());

                    let dispatcher = self.dispatcher.clone();
                    let run_store = self.run_store.clone();
                    let semaphore = semaphore.clone();
                    let node = node.clone();
                    let rid = run_id.clone();
                    tasks.spawn(async move {
                        let _permit = match &semaphore {
                            Some(s) => s.clone().acquire_owned().await.ok(),
                            None => None,
                        };
                        let mut attempts = 0u32;
                        loop {
                            attempts += 1;
                            let deadline = Duration::from_secs(node.timeout_secs);
                            let result = match tokio::time::timeout(
                                deadline,
                                dispatcher.execute(&node, &rendered, &rid),
                            )
                            .await
                            {
                                Ok(r) => r,
                                Err(_) => Err(FlowError::Timeout(format!(
                                    "Node '{}' attempt {} exceeded {}s",
                                    node.id, attempts, node.timeout_secs
                                ))),
                            };

                            match result {
                                Ok(outcome) => return (node.id.clone(), attempts, Ok(outcome)),
                                Err(e) if attempts <= node.retry_max => {
                                    tracing::warn!(
                                        "[Engine] Node '{}' attempt {} failed: {} (retrying)",
                                        node.id,
                                        attempts,
                                        e
                                    );
                                    // Keep the persisted attempt count live;
                                    // the start timestamp stays the first
                                    // attempt's.
                                    let mut nr = NodeRun::pending(&node.id);
                                    nr.status = NodeRunStatus::Running;
                                    nr.attempts = attempts;
                                    nr.last_error = Some(e.to_string());
                                    nr.started_at = node_started_at;
                                    let _ = run_store.save_node_run(&rid, &nr).await;
                                    tokio::time::sleep(Duration::from_secs(
                                        node.retry_backoff_seconds,
                                    ))
                                    .await;
                                }
                                Err(e) => return (node.id.clone(), attempts, Err(e)),
                            }
                        }
                    });
                }
            }

            if tasks.is_empty() {
                let has_pending = run
                    .node_runs
                    .iter()
                    .any(|nr| nr.status == NodeRunStatus::Pending);
                if !has_pending {
                    break;
                }
                if cancelled || halted.is_some() {
                    // Nothing in flight and dispatch is off: skip the rest.
                    let pending: Vec<String> = run
                        .node_runs
                        .iter()
                        .filter(|nr| nr.status == NodeRunStatus::Pending)
                        .map(|nr| nr.node_id.clone())
                        .collect();
                    for node_id in pending {
                        self.finish_node(run, &node_id, NodeRunStatus::Skipped, 0, None, None)
                            .await;
                    }
                    break;
                }
                // Pending nodes but nothing ready or in flight: every one of
                // them sits behind an inactive edge and the dispatch pass
                // above will skip them next round. Loop again.
                continue;
            }

            // Wait for one node to finish, staying responsive to cancel.
            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                _ = cancel_rx.changed() => continue,
            };
            let Some(joined) = joined else { continue };
            let (node_id, attempts, result) = match joined {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!("[Engine] Node task panicked: {}", e);
                    continue;
                }
            };
            in_flight.remove(&node_id);
            let Some(node) = graph.node(&node_id) else {
                continue;
            };

            match result {
                Ok(outcome) => {
                    let output = outcome.output().to_string();
                    if let Ok(mut c) = ctx.lock() {
                        c.record_output(&node_id, output.clone());
                        if let NodeOutcome::Branch { branch, .. } = &outcome {
                            c.record_branch(&node_id, branch);
                        }
                    }
                    self.finish_node(
                        run,
                        &node_id,
                        NodeRunStatus::Succeeded,
                        attempts,
                        Some(output),
                        None,
                    )
                    .await;
                    self.logs.publish(
                        &run_id,
                        LogLine::system(format!("[run] node '{}' succeeded", node_id)),
                    );
                }
                Err(e) => {
                    self.finish_node(
                        run,
                        &node_id,
                        NodeRunStatus::Failed,
                        attempts,
                        None,
                        Some(e.to_string()),
                    )
                    .await;
                    self.logs.publish(
                        &run_id,
                        LogLine::system(format!("[run] node '{}' failed: {}", node_id, e)),
                    );
                    match node.error_mode {
                        ErrorMode::Stop => {
                            halted = Some(format!("Node '{}' failed: {}", node_id, e));
                        }
                        ErrorMode::Continue => {
                            if let Ok(mut c) = ctx.lock() {
                                c.record_output(&node_id, String::new());
                            }
                        }
                        ErrorMode::ContinueWithError => {
                            run.diagnostics.push(format!("node '{}': {}", node_id, e));
                            if let Ok(mut c) = ctx.lock() {
                                c.record_output(&node_id, String::new());
                            }
                        }
                    }
                }
            }
        }

        if cancelled {
            run.error = Some("Cancelled".to_string());
            return Ok(RunStatus::Cancelled);
        }
        if let Some(reason) = halted {
            run.error = Some(reason);
            return Ok(RunStatus::Failed);
        }
        // Error modes only control whether dependents still dispatch. A run
        // completes when every node succeeded or was skipped by a branch;
        // any failed node fails the run.
        let failed: Vec<&str> = run
            .node_runs
            .iter()
            .filter(|nr| nr.status == NodeRunStatus::Failed)
            .map(|nr| nr.node_id.as_str())
            .collect();
        if !failed.is_empty() {
            run.error = Some(format!(
                "{} node(s) failed: {}",
                failed.len(),
                failed.join(", ")
            ));
            return Ok(RunStatus::Failed);
        }
        Ok(RunStatus::Completed)
    }

    /// Whether an edge delivers control from its finished source node.
    fn edge_active(
        &self,
        graph: &WorkflowGraph,
        run: &crate::models::GraphRun,
        ctx: &Arc<std::sync::Mutex<ExecutionContext>>,
        edge: &crate::models::Edge,
    ) -> bool {
        let source_status = node_status(run, &edge.source);
        let source = graph.node(&edge.source);
        let source_continues = source
            .map(|n| {
                matches!(
                    n.error_mode,
                    ErrorMode::Continue | ErrorMode::ContinueWithError
                )
            })
            .unwrap_or(false);

        let delivered = match source_status {
            NodeRunStatus::Succeeded => true,
            NodeRunStatus::Failed => source_continues,
            _ => false,
        };
        if !delivered {
            return false;
        }

        // Conditional sources only deliver along the taken branch.
        if let Some(label) = &edge.label {
            let taken = ctx
                .lock()
                .ok()
                .and_then(|c| c.branch(&edge.source).map(|b| b.to_string()));
            return taken.as_deref() == Some(label.as_str());
        }
        true
    }

    async fn mark_running(&self, run: &mut crate::models::GraphRun, node_id: &str) {
        if let Some(nr) = run.node_runs.iter_mut().find(|nr| nr.node_id == node_id) {
            nr.status = NodeRunStatus::Running;
            nr.started_at = Some(Utc::now());
            let snapshot = nr.clone();
            if let Err(e) = self.run_store.save_node_run(&run.id, &snapshot).await {
                tracing::error!("[Engine] Failed to persist node '{}': {}", node_id, e);
            }
        }
    }

    async fn finish_node(
        &self,
        run: &mut crate::models::GraphRun,
        node_id: &str,
        status: NodeRunStatus,
        attempts: u32,
        output: Option<String>,
        error: Option<String>,
    ) {
        if let Some(nr) = run.node_runs.iter_mut().find(|nr| nr.node_id == node_id) {
            nr.status = status;
            nr.attempts = attempts;
            nr.output = output;
            nr.last_error = error;
            if nr.started_at.is_none() {
                nr.started_at = Some(Utc::now());
            }
            nr.finished_at = Some(Utc::now());
            let snapshot = nr.clone();
            if let Err(e) = self.run_store.save_node_run(&run.id, &snapshot).await {
                tracing::error!("[Engine] Failed to persist node '{}': {}", node_id, e);
            }
        }
    }
}

fn node_status(run: &crate::models::GraphRun, node_id: &str) -> NodeRunStatus {
    run.node_run(node_id)
        .map(|nr| nr.status)
        .unwrap_or(NodeRunStatus::Pending)
}

/// Input a node sees when its config has no explicit `input` template: the
/// outputs of its succeeded parents, joined by newlines.
fn default_input(
    incoming: &HashMap<&str, Vec<&crate::models::Edge>>,
    ctx: &ExecutionContext,
    node_id: &str,
) -> String {
    let Some(edges) = incoming.get(node_id) else {
        return String::new();
    };
    edges
        .iter()
        .filter_map(|e| ctx.output(&e.source))
        .filter(|o| !o.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Produce the execution-ready form of a node's config: all string fields
/// rendered against the context, and the effective input filled in.
fn render_kind(kind: &NodeKind, ctx: &ExecutionContext, default_input: &str) -> NodeKind {
    let render = |s: &str| ctx.resolve_template(s);
    let render_input = |input: &Option<String>| {
        Some(match input {
            Some(template) => render(template),
            None => default_input.to_string(),
        })
    };

    match kind {
        NodeKind::Trigger(t) => NodeKind::Trigger(t.clone()),
        NodeKind::Skill { skill_name, input } => NodeKind::Skill {
            skill_name: skill_name.clone(),
            input: render_input(input),
        },
        NodeKind::Command {
            command,
            working_dir,
        } => NodeKind::Command {
            command: render(command),
            working_dir: working_dir.as_deref().map(render),
        },
        NodeKind::Agent { agent_id, prompt } => NodeKind::Agent {
            agent_id: agent_id.clone(),
            prompt: Some(match prompt {
                Some(p) => render(p),
                None => default_input.to_string(),
            }),
        },
        NodeKind::Script {
            script,
            long_running,
        } => NodeKind::Script {
            script: render(script),
            long_running: *long_running,
        },
        NodeKind::Conditional {
            condition_type,
            condition_value,
            input,
        } => NodeKind::Conditional {
            condition_type: *condition_type,
            condition_value: condition_value.as_deref().map(render),
            input: render_input(input),
        },
        NodeKind::Transform { op, input } => NodeKind::Transform {
            op: match op {
                TransformOp::Template { template } => TransformOp::Template {
                    template: render(template),
                },
                TransformOp::ExtractField {
                    field_path,
                    default,
                } => TransformOp::ExtractField {
                    field_path: field_path.clone(),
                    default: default.clone(),
                },
                other => other.clone(),
            },
            input: render_input(input),
        },
    }
}
