//! Workflow graph definition types.
//!
//! A graph definition is authored externally (UI or YAML file) and consumed
//! read-only by the engine. A minimal YAML definition:
//!
//! ```yaml
//! id: "nightly-sync"
//! name: "Nightly Sync"
//!
//! variables:
//!   repo_dir: "${HOME}/work/repo"
//!
//! nodes:
//!   - id: start
//!     type: trigger
//!   - id: pull
//!     type: command
//!     config:
//!       command: "git -C ${repo_dir} pull"
//!     retry_max: 2
//!     retry_backoff_seconds: 5
//!   - id: check
//!     type: conditional
//!     config:
//!       condition_type: contains
//!       condition_value: "Already up to date"
//!   - id: notify
//!     type: skill
//!     config:
//!       skill_name: "notify-team"
//!   - id: summarize
//!     type: transform
//!     config:
//!       operation: template
//!       template: "no changes in ${nodes.pull.output}"
//!
//! edges:
//!   - { source: start, target: pull }
//!   - { source: pull, target: check }
//!   - { source: check, target: notify, label: "false" }
//!   - { source: check, target: summarize, label: "true" }
//! ```
//!
//! Node `config` is a loose key/value map on the wire; it is parsed into the
//! typed [`NodeKind`] during validation so the engine never touches an
//! untyped map at execution time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Branch labels on edges leaving a conditional node.
pub const BRANCH_TRUE: &str = "true";
pub const BRANCH_FALSE: &str = "false";

/// The seven node types a graph may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Trigger,
    Skill,
    Command,
    Agent,
    Script,
    Conditional,
    Transform,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Trigger => "trigger",
            NodeType::Skill => "skill",
            NodeType::Command => "command",
            NodeType::Agent => "agent",
            NodeType::Script => "script",
            NodeType::Conditional => "conditional",
            NodeType::Transform => "transform",
        }
    }
}

/// What to do when a node exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Halt the entire run (default). Unreached nodes become `skipped`.
    #[default]
    Stop,
    /// Mark the node failed and proceed to dependents with empty output.
    Continue,
    /// Like `continue`, but the error is attached to the run's diagnostics.
    ContinueWithError,
}

/// A single typed step in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Node ID (unique within the graph, used for edges and output references)
    pub id: String,

    /// Node type
    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// Human-readable label (defaults to the ID)
    #[serde(default)]
    pub label: Option<String>,

    /// Type-specific configuration; required keys vary by type
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,

    /// What to do if this node fails after retries
    #[serde(default)]
    pub error_mode: ErrorMode,

    /// Maximum retries after the first attempt
    #[serde(default)]
    pub retry_max: u32,

    /// Delay between attempts, in seconds (fixed, not exponential)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_seconds: u64,

    /// Deadline for a single attempt, in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_retry_backoff() -> u64 {
    1
}

fn default_timeout() -> u64 {
    300
}

impl Node {
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }

    /// Fetch a required string config key.
    fn config_str(&self, key: &str) -> Option<String> {
        self.config
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .filter(|s| !s.is_empty())
    }

    fn config_bool(&self, key: &str) -> bool {
        self.config
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// A dependency edge between two nodes. The label is only meaningful on
/// edges leaving a conditional node (`"true"` / `"false"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// Top-level workflow graph definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Variable substitution map (supports `${ENV_VAR}` references)
    #[serde(default)]
    pub variables: HashMap<String, String>,

    pub nodes: Vec<Node>,

    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowGraph {
    /// Parse a graph definition from a YAML string (JSON is a YAML subset,
    /// so JSON definitions parse through the same path).
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse graph definition: {}", e))
    }

    /// Load a graph definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read graph file '{}': {}", path, e))?;
        Self::from_yaml(&content)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn trigger_ids(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Trigger)
            .map(|n| n.id.as_str())
            .collect()
    }
}

// ─── Typed node configuration ───────────────────────────────────────────

/// Trigger subtype. `cron` requires a cron expression; the expression is
/// carried for the external scheduler, the engine itself treats every
/// trigger as an entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Webhook,
    Cron { expr: String },
}

/// Condition evaluated by a conditional node against its rendered input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    Contains,
    NotContains,
    Equals,
    IsEmpty,
    NotEmpty,
}

impl ConditionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "contains" => Some(Self::Contains),
            "not_contains" => Some(Self::NotContains),
            "equals" => Some(Self::Equals),
            "is_empty" => Some(Self::IsEmpty),
            "not_empty" => Some(Self::NotEmpty),
            _ => None,
        }
    }

    /// Whether this condition requires a `condition_value`.
    pub fn needs_value(&self) -> bool {
        matches!(self, Self::Contains | Self::NotContains | Self::Equals)
    }
}

/// Operation applied by a transform node to its rendered input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformOp {
    /// Dot-path field extraction from JSON input, with an optional default
    /// when the path is missing.
    ExtractField {
        field_path: String,
        default: Option<String>,
    },
    /// Render a template against the execution context.
    Template { template: String },
    /// Parse the input as JSON and re-emit it normalized.
    ParseJson,
    Uppercase,
    Lowercase,
}

/// A node's configuration parsed into its typed form. Produced by the
/// validator; the engine and executors only ever see this, never the raw map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Trigger(TriggerKind),
    Skill {
        skill_name: String,
        input: Option<String>,
    },
    Command {
        command: String,
        working_dir: Option<String>,
    },
    Agent {
        agent_id: String,
        prompt: Option<String>,
    },
    Script {
        script: String,
        long_running: bool,
    },
    Conditional {
        condition_type: ConditionType,
        condition_value: Option<String>,
        input: Option<String>,
    },
    Transform {
        op: TransformOp,
        input: Option<String>,
    },
}

impl NodeKind {
    /// Parse a node's raw config map into its typed form, collecting every
    /// missing/invalid key rather than stopping at the first.
    pub fn parse(node: &Node) -> Result<Self, Vec<String>> {
        let mut problems: Vec<String> = Vec::new();
        let missing = |key: &str| format!("node '{}' is missing required config '{}'", node.id, key);

        let kind = match node.node_type {
            NodeType::Trigger => {
                let subtype = node
                    .config_str("subtype")
                    .unwrap_or_else(|| "manual".to_string());
                match subtype.as_str() {
                    "manual" => Some(NodeKind::Trigger(TriggerKind::Manual)),
                    "webhook" => Some(NodeKind::Trigger(TriggerKind::Webhook)),
                    "cron" => match node.config_str("cron") {
                        Some(expr) => Some(NodeKind::Trigger(TriggerKind::Cron { expr })),
                        None => {
                            problems.push(missing("cron"));
                            None
                        }
                    },
                    other => {
                        problems.push(format!(
                            "node '{}' has unknown trigger subtype '{}'",
                            node.id, other
                        ));
                        None
                    }
                }
            }
            NodeType::Skill => match node.config_str("skill_name") {
                Some(skill_name) => Some(NodeKind::Skill {
                    skill_name,
                    input: node.config_str("input"),
                }),
                None => {
                    problems.push(missing("skill_name"));
                    None
                }
            },
            NodeType::Command => match node.config_str("command") {
                Some(command) => Some(NodeKind::Command {
                    command,
                    working_dir: node.config_str("working_dir"),
                }),
                None => {
                    problems.push(missing("command"));
                    None
                }
            },
            NodeType::Agent => match node.config_str("agent_id") {
                Some(agent_id) => Some(NodeKind::Agent {
                    agent_id,
                    prompt: node.config_str("prompt"),
                }),
                None => {
                    problems.push(missing("agent_id"));
                    None
                }
            },
            NodeType::Script => match node.config_str("script") {
                Some(script) => Some(NodeKind::Script {
                    script,
                    long_running: node.config_bool("long_running"),
                }),
                None => {
                    problems.push(missing("script"));
                    None
                }
            },
            NodeType::Conditional => {
                let condition_type = match node.config_str("condition_type") {
                    Some(raw) => match ConditionType::parse(&raw) {
                        Some(ct) => Some(ct),
                        None => {
                            problems.push(format!(
                                "node '{}' has unknown condition_type '{}'",
                                node.id, raw
                            ));
                            None
                        }
                    },
                    None => {
                        problems.push(missing("condition_type"));
                        None
                    }
                };
                let condition_value = node.config_str("condition_value");
                if let Some(ct) = condition_type {
                    if ct.needs_value() && condition_value.is_none() {
                        problems.push(missing("condition_value"));
                        None
                    } else {
                        Some(NodeKind::Conditional {
                            condition_type: ct,
                            condition_value,
                            input: node.config_str("input"),
                        })
                    }
                } else {
                    None
                }
            }
            NodeType::Transform => {
                let op = match node.config_str("operation").as_deref() {
                    Some("extract_field") => match node.config_str("field_path") {
                        Some(field_path) => Some(TransformOp::ExtractField {
                            field_path,
                            default: node.config_str("default"),
                        }),
                        None => {
                            problems.push(missing("field_path"));
                            None
                        }
                    },
                    Some("template") => match node.config_str("template") {
                        Some(template) => Some(TransformOp::Template { template }),
                        None => {
                            problems.push(missing("template"));
                            None
                        }
                    },
                    Some("parse_json") => Some(TransformOp::ParseJson),
                    Some("uppercase") => Some(TransformOp::Uppercase),
                    Some("lowercase") => Some(TransformOp::Lowercase),
                    Some(other) => {
                        problems.push(format!(
                            "node '{}' has unknown transform operation '{}'",
                            node.id, other
                        ));
                        None
                    }
                    None => {
                        problems.push(missing("operation"));
                        None
                    }
                };
                op.map(|op| NodeKind::Transform {
                    op,
                    input: node.config_str("input"),
                })
            }
        };

        match kind {
            Some(k) if problems.is_empty() => Ok(k),
            _ => Err(problems),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(node_type: NodeType, config: serde_json::Value) -> Node {
        Node {
            id: "n1".to_string(),
            node_type,
            label: None,
            config: serde_json::from_value(config).unwrap(),
            error_mode: ErrorMode::default(),
            retry_max: 0,
            retry_backoff_seconds: 1,
            timeout_secs: 300,
        }
    }

    #[test]
    fn test_parse_minimal_graph_yaml() {
        let yaml = r#"
id: "demo"
nodes:
  - id: start
    type: trigger
  - id: hello
    type: command
    config:
      command: "echo ok"
edges:
  - { source: start, target: hello }
"#;
        let graph = WorkflowGraph::from_yaml(yaml).unwrap();
        assert_eq!(graph.id, "demo");
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.nodes[1].node_type, NodeType::Command);
        assert_eq!(graph.trigger_ids(), vec!["start"]);
        assert_eq!(graph.nodes[1].error_mode, ErrorMode::Stop);
        assert_eq!(graph.nodes[1].timeout_secs, 300);
    }

    #[test]
    fn test_parse_command_kind() {
        let n = node(
            NodeType::Command,
            serde_json::json!({ "command": "echo hi", "working_dir": "/tmp" }),
        );
        let kind = NodeKind::parse(&n).unwrap();
        assert_eq!(
            kind,
            NodeKind::Command {
                command: "echo hi".to_string(),
                working_dir: Some("/tmp".to_string()),
            }
        );
    }

    #[test]
    fn test_missing_required_key_is_collected() {
        let n = node(NodeType::Skill, serde_json::json!({}));
        let errs = NodeKind::parse(&n).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(errs[0].contains("skill_name"));
    }

    #[test]
    fn test_conditional_contains_requires_value() {
        let n = node(
            NodeType::Conditional,
            serde_json::json!({ "condition_type": "contains" }),
        );
        let errs = NodeKind::parse(&n).unwrap_err();
        assert!(errs[0].contains("condition_value"));

        let n = node(
            NodeType::Conditional,
            serde_json::json!({ "condition_type": "is_empty" }),
        );
        assert!(NodeKind::parse(&n).is_ok());
    }

    #[test]
    fn test_transform_extract_field_requires_path() {
        let n = node(
            NodeType::Transform,
            serde_json::json!({ "operation": "extract_field" }),
        );
        let errs = NodeKind::parse(&n).unwrap_err();
        assert!(errs[0].contains("field_path"));
    }

    #[test]
    fn test_cron_trigger_requires_expression() {
        let n = node(NodeType::Trigger, serde_json::json!({ "subtype": "cron" }));
        assert!(NodeKind::parse(&n).is_err());

        let n = node(
            NodeType::Trigger,
            serde_json::json!({ "subtype": "cron", "cron": "0 3 * * *" }),
        );
        assert_eq!(
            NodeKind::parse(&n).unwrap(),
            NodeKind::Trigger(TriggerKind::Cron {
                expr: "0 3 * * *".to_string()
            })
        );
    }
}
