//! Node executors — one adapter per node type.
//!
//! The engine resolves templates and picks the effective input before
//! dispatch, so executors receive fully rendered configuration and never
//! touch the execution context. Skill and command nodes delegate to the
//! runner traits; agent nodes and long-running scripts delegate to the
//! session orchestrator and mirror the session's terminal status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::logs::LogSource;
use crate::models::{
    ConditionType, Node, NodeKind, SessionStatus, TransformOp, BRANCH_FALSE, BRANCH_TRUE,
};
use crate::runners::{CommandRunner, SkillRunner};
use crate::session::{SessionOrchestrator, SessionSpec};

/// What a node produced.
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    Success { output: String },
    /// Conditional nodes: which branch was taken. The output is the
    /// evaluated input, passed through for downstream reference.
    Branch { branch: &'static str, output: String },
}

impl NodeOutcome {
    pub fn output(&self) -> &str {
        match self {
            NodeOutcome::Success { output } => output,
            NodeOutcome::Branch { output, .. } => output,
        }
    }
}

/// Preset mapping an agent ID to the command that launches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPreset {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub description: String,
}

/// Built-in presets for known interactive coding agents.
pub fn builtin_presets() -> Vec<AgentPreset> {
    vec![
        AgentPreset {
            id: "claude".to_string(),
            command: "claude".to_string(),
            args: vec!["--print".to_string()],
            description: "Anthropic Claude Code CLI".to_string(),
        },
        AgentPreset {
            id: "gemini".to_string(),
            command: "gemini".to_string(),
            args: vec![],
            description: "Google Gemini CLI".to_string(),
        },
        AgentPreset {
            id: "opencode".to_string(),
            command: "opencode".to_string(),
            args: vec!["run".to_string()],
            description: "OpenCode AI coding agent".to_string(),
        },
        AgentPreset {
            id: "codex".to_string(),
            command: "codex".to_string(),
            args: vec!["exec".to_string()],
            description: "OpenAI Codex CLI".to_string(),
        },
    ]
}

/// Routes rendered node configs to the right backend.
pub struct Dispatcher {
    skill_runner: Arc<dyn SkillRunner>,
    command_runner: Arc<dyn CommandRunner>,
    orchestrator: SessionOrchestrator,
    presets: HashMap<String, AgentPreset>,
    /// Working directory for nodes that don't specify one.
    default_cwd: String,
}

impl Dispatcher {
    pub fn new(
        skill_runner: Arc<dyn SkillRunner>,
        command_runner: Arc<dyn CommandRunner>,
        orchestrator: SessionOrchestrator,
    ) -> Self {
        let presets = builtin_presets()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        Self {
            skill_runner,
            command_runner,
            orchestrator,
            presets,
            default_cwd: ".".to_string(),
        }
    }

    pub fn with_default_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.default_cwd = cwd.into();
        self
    }

    pub fn register_preset(&mut self, preset: AgentPreset) {
        self.presets.insert(preset.id.clone(), preset);
    }

    /// Execute one node. `kind` has all templates rendered and the
    /// effective input filled in; `run_id` tags spawned sessions so run
    /// cancellation can stop them.
    pub async fn execute(
        &self,
        node: &Node,
        kind: &NodeKind,
        run_id: &str,
    ) -> Result<NodeOutcome, FlowError> {
        let timeout = Duration::from_secs(node.timeout_secs);
        match kind {
            NodeKind::Trigger(_) => {
                // Entry point: passes the trigger payload through.
                Ok(NodeOutcome::Success {
                    output: String::new(),
                })
            }
            NodeKind::Skill { skill_name, input } => {
                let out = self
                    .skill_runner
                    .run(
                        skill_name,
                        input.as_deref().unwrap_or(""),
                        &self.default_cwd,
                        timeout,
                    )
                    .await?;
                if out.success() {
                    Ok(NodeOutcome::Success { output: out.stdout })
                } else {
                    Err(FlowError::Execution(format!(
                        "Skill '{}' exited with code {}: {}",
                        skill_name,
                        out.exit_code,
                        out.stderr.trim()
                    )))
                }
            }
            NodeKind::Command {
                command,
                working_dir,
            } => {
                let cwd = working_dir.as_deref().unwrap_or(&self.default_cwd);
                let out = self.command_runner.run(command, cwd, timeout).await?;
                if out.success() {
                    Ok(NodeOutcome::Success { output: out.stdout })
                } else {
                    Err(FlowError::Execution(format!(
                        "Command exited with code {}: {}",
                        out.exit_code,
                        out.stderr.trim()
                    )))
                }
            }
            NodeKind::Agent { agent_id, prompt } => {
                let preset = self.presets.get(agent_id).ok_or_else(|| {
                    FlowError::BadRequest(format!(
                        "Unknown agent '{}'. Known agents: {:?}",
                        agent_id,
                        self.presets.keys().collect::<Vec<_>>()
                    ))
                })?;
                self.run_session_node(
                    &preset.command.clone(),
                    preset.args.clone(),
                    prompt.as_deref(),
                    run_id,
                    timeout,
                )
                .await
            }
            NodeKind::Script {
                script,
                long_running,
            } => {
                if *long_running {
                    self.run_session_node(
                        "sh",
                        vec!["-c".to_string(), script.clone()],
                        None,
                        run_id,
                        timeout,
                    )
                    .await
                } else {
                    let out = self
                        .command_runner
                        .run(script, &self.default_cwd, timeout)
                        .await?;
                    if out.success() {
                        Ok(NodeOutcome::Success { output: out.stdout })
                    } else {
                        Err(FlowError::Execution(format!(
                            "Script exited with code {}: {}",
                            out.exit_code,
                            out.stderr.trim()
                        )))
                    }
                }
            }
            NodeKind::Conditional {
                condition_type,
                condition_value,
                input,
            } => {
                let input = input.as_deref().unwrap_or("");
                let value = condition_value.as_deref().unwrap_or("");
                let holds = match condition_type {
                    ConditionType::Contains => input.contains(value),
                    ConditionType::NotContains => !input.contains(value),
                    ConditionType::Equals => input == value,
                    ConditionType::IsEmpty => input.trim().is_empty(),
                    ConditionType::NotEmpty => !input.trim().is_empty(),
                };
                Ok(NodeOutcome::Branch {
                    branch: if holds { BRANCH_TRUE } else { BRANCH_FALSE },
                    output: input.to_string(),
                })
            }
            NodeKind::Transform { op, input } => {
                let input = input.as_deref().unwrap_or("");
                let output = apply_transform(op, input)?;
                Ok(NodeOutcome::Success { output })
            }
        }
    }

    /// Run a node through a direct-mode session and mirror its terminal
    /// status: completed session -> node success with the session's stdout,
    /// failed session -> execution failure.
    async fn run_session_node(
        &self,
        command: &str,
        args: Vec<String>,
        prompt: Option<&str>,
        run_id: &str,
        timeout: Duration,
    ) -> Result<NodeOutcome, FlowError> {
        let spec = SessionSpec::direct(command)
            .with_args(args)
            .with_cwd(self.default_cwd.clone())
            .with_run_id(run_id);
        let session = self.orchestrator.start_session(spec).await?;

        // Mirror the process output onto the run's stream so a run viewer
        // sees what the node prints as it happens. Ends when the session's
        // own stream closes.
        let forward = {
            let logs = self.orchestrator.logs().clone();
            let run_key = run_id.to_string();
            let (backlog, mut rx) = logs.subscribe(&session.id);
            tokio::spawn(async move {
                let mirror = |line: crate::logs::LogLine| {
                    if line.source != LogSource::System {
                        logs.publish(&run_key, line);
                    }
                };
                for line in backlog {
                    mirror(line);
                }
                loop {
                    match rx.recv().await {
                        Ok(line) => mirror(line),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        if let Some(prompt) = prompt {
            self.orchestrator.send_input(&session.id, prompt).await?;
        }

        let finished = match tokio::time::timeout(timeout, self.orchestrator.wait(&session.id))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                // Deadline expiry goes down the same path as an explicit stop.
                let _ = self.orchestrator.stop_session(&session.id).await;
                let _ = forward.await;
                return Err(FlowError::Timeout(format!(
                    "Session exceeded {}s",
                    timeout.as_secs()
                )));
            }
        };
        let _ = forward.await;

        // Exit observation implies the readers drained, so this is the
        // session's complete stdout.
        let stdout = self.orchestrator.session_output(&session.id).await?;

        match finished.status {
            SessionStatus::Completed => Ok(NodeOutcome::Success {
                output: stdout.join("\n"),
            }),
            _ => Err(FlowError::Execution(
                finished
                    .error
                    .unwrap_or_else(|| "Session failed".to_string()),
            )),
        }
    }
}

fn apply_transform(op: &TransformOp, input: &str) -> Result<String, FlowError> {
    match op {
        TransformOp::ExtractField {
            field_path,
            default,
        } => {
            let value: serde_json::Value = serde_json::from_str(input).map_err(|e| {
                FlowError::Execution(format!("extract_field input is not JSON: {}", e))
            })?;
            let mut current = &value;
            for segment in field_path.split('.') {
                match current.get(segment) {
                    Some(next) => current = next,
                    None => {
                        return default.clone().ok_or_else(|| {
                            FlowError::Execution(format!(
                                "Field '{}' not found and no default given",
                                field_path
                            ))
                        });
                    }
                }
            }
            Ok(match current {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        }
        // The engine already rendered the template; it is the output.
        TransformOp::Template { template } => Ok(template.clone()),
        TransformOp::ParseJson => {
            let value: serde_json::Value = serde_json::from_str(input).map_err(|e| {
                FlowError::Execution(format!("parse_json input is not JSON: {}", e))
            })?;
            serde_json::to_string(&value)
                .map_err(|e| FlowError::Execution(format!("Failed to re-serialize JSON: {}", e)))
        }
        TransformOp::Uppercase => Ok(input.to_uppercase()),
        TransformOp::Lowercase => Ok(input.to_lowercase()),
    }
}
