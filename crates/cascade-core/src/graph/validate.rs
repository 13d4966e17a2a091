//! Graph validation.
//!
//! `validate` walks the whole definition and reports every violation it can
//! find in one pass, so an author fixes all problems at once instead of
//! replaying submit-fix-submit. A graph that passes comes back as a
//! `ValidatedGraph` carrying the typed `NodeKind` for each node; the engine
//! only ever executes validated graphs.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::FlowError;
use crate::models::{NodeKind, NodeType, WorkflowGraph, BRANCH_FALSE, BRANCH_TRUE};

/// A graph that passed validation, with each node's config parsed into its
/// typed form.
#[derive(Debug)]
pub struct ValidatedGraph {
    pub graph: WorkflowGraph,
    pub kinds: HashMap<String, NodeKind>,
}

impl ValidatedGraph {
    pub fn kind(&self, node_id: &str) -> &NodeKind {
        // Every node ID present in the graph has an entry; validation
        // guarantees it.
        &self.kinds[node_id]
    }
}

/// Validate a graph definition, collecting every violation.
pub fn validate(graph: WorkflowGraph) -> Result<ValidatedGraph, FlowError> {
    let mut violations: Vec<String> = Vec::new();

    // Unique node IDs.
    let mut ids: HashSet<&str> = HashSet::new();
    for node in &graph.nodes {
        if node.id.is_empty() {
            violations.push("a node has an empty id".to_string());
        }
        if !ids.insert(node.id.as_str()) {
            violations.push(format!("duplicate node id '{}'", node.id));
        }
    }

    // Per-node config parsing; collect all problems.
    let mut kinds: HashMap<String, NodeKind> = HashMap::new();
    for node in &graph.nodes {
        match NodeKind::parse(node) {
            Ok(kind) => {
                kinds.insert(node.id.clone(), kind);
            }
            Err(mut problems) => violations.append(&mut problems),
        }
        if node.retry_backoff_seconds == 0 {
            violations.push(format!(
                "node '{}': retry_backoff_seconds must be at least 1",
                node.id
            ));
        }
    }

    // Edges must reference existing nodes, and labels only mean something
    // on edges leaving a conditional: any other labeled edge would never
    // deliver.
    for edge in &graph.edges {
        if !ids.contains(edge.source.as_str()) {
            violations.push(format!(
                "edge references unknown source node '{}'",
                edge.source
            ));
        }
        if !ids.contains(edge.target.as_str()) {
            violations.push(format!(
                "edge references unknown target node '{}'",
                edge.target
            ));
        }
        if let Some(label) = &edge.label {
            let source_is_conditional = graph
                .nodes
                .iter()
                .any(|n| n.id == edge.source && n.node_type == NodeType::Conditional);
            if ids.contains(edge.source.as_str()) && !source_is_conditional {
                violations.push(format!(
                    "edge '{}' -> '{}' is labeled '{}' but its source is not a conditional node",
                    edge.source, edge.target, label
                ));
            }
        }
    }

    // At least one trigger; triggers are the only entry points.
    if graph.trigger_ids().is_empty() {
        violations.push("graph has no trigger node".to_string());
    }

    // Every non-trigger node needs at least one incoming edge.
    let mut incoming: HashMap<&str, usize> = HashMap::new();
    for edge in &graph.edges {
        *incoming.entry(edge.target.as_str()).or_default() += 1;
    }
    for node in &graph.nodes {
        if node.node_type != NodeType::Trigger && incoming.get(node.id.as_str()).is_none() {
            violations.push(format!(
                "node '{}' is unreachable: no incoming edge",
                node.id
            ));
        }
        if node.node_type == NodeType::Trigger && incoming.contains_key(node.id.as_str()) {
            violations.push(format!(
                "trigger node '{}' must not have incoming edges",
                node.id
            ));
        }
    }

    // A conditional node needs exactly one `true` and one `false` edge.
    for node in &graph.nodes {
        if node.node_type != NodeType::Conditional {
            continue;
        }
        let mut true_edges = 0usize;
        let mut false_edges = 0usize;
        for edge in graph.edges.iter().filter(|e| e.source == node.id) {
            match edge.label.as_deref() {
                Some(BRANCH_TRUE) => true_edges += 1,
                Some(BRANCH_FALSE) => false_edges += 1,
                other => violations.push(format!(
                    "edge from conditional '{}' must be labeled 'true' or 'false', got {:?}",
                    node.id, other
                )),
            }
        }
        if true_edges != 1 || false_edges != 1 {
            violations.push(format!(
                "conditional '{}' needs exactly one 'true' and one 'false' edge (found {} true, {} false)",
                node.id, true_edges, false_edges
            ));
        }
    }

    // Cycle detection via Kahn's algorithm over the known-node subgraph.
    if has_cycle(&graph, &ids) {
        violations.push("graph contains a cycle; workflow graphs must be acyclic".to_string());
    }

    if violations.is_empty() {
        Ok(ValidatedGraph { graph, kinds })
    } else {
        Err(FlowError::Validation(violations))
    }
}

fn has_cycle(graph: &WorkflowGraph, ids: &HashSet<&str>) -> bool {
    let mut in_degree: HashMap<&str, usize> = graph.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &graph.edges {
        // Dangling edges are reported separately; skip them here.
        if !ids.contains(edge.source.as_str()) || !ids.contains(edge.target.as_str()) {
            continue;
        }
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
        *in_degree.entry(edge.target.as_str()).or_default() += 1;
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;

    while let Some(id) = queue.pop_front() {
        visited += 1;
        if let Some(targets) = adjacency.get(id) {
            for target in targets {
                let d = in_degree.get_mut(target).unwrap();
                *d -= 1;
                if *d == 0 {
                    queue.push_back(target);
                }
            }
        }
    }

    visited != graph.nodes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(yaml: &str) -> WorkflowGraph {
        WorkflowGraph::from_yaml(yaml).unwrap()
    }

    #[test]
    fn test_valid_graph_passes_with_typed_kinds() {
        let g = graph(
            r#"
id: demo
nodes:
  - id: start
    type: trigger
  - id: build
    type: command
    config: { command: "make" }
edges:
  - { source: start, target: build }
"#,
        );
        let validated = validate(g).unwrap();
        assert!(matches!(
            validated.kind("build"),
            NodeKind::Command { .. }
        ));
    }

    #[test]
    fn test_all_violations_reported_at_once() {
        // Four distinct problems: missing skill_name, dangling edge,
        // unreachable node, no trigger.
        let g = graph(
            r#"
id: broken
nodes:
  - id: a
    type: skill
    config: {}
  - id: b
    type: command
    config: { command: "true" }
edges:
  - { source: a, target: ghost }
"#,
        );
        let err = validate(g).unwrap_err();
        let FlowError::Validation(violations) = err else {
            panic!("expected validation error");
        };
        assert!(violations.iter().any(|v| v.contains("skill_name")));
        assert!(violations.iter().any(|v| v.contains("ghost")));
        assert!(violations.iter().any(|v| v.contains("unreachable")));
        assert!(violations.iter().any(|v| v.contains("no trigger")));
        assert!(violations.len() >= 4);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let g = graph(
            r#"
id: looped
nodes:
  - id: start
    type: trigger
  - id: a
    type: command
    config: { command: "true" }
  - id: b
    type: command
    config: { command: "true" }
edges:
  - { source: start, target: a }
  - { source: a, target: b }
  - { source: b, target: a }
"#,
        );
        let err = validate(g).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_conditional_needs_both_branches() {
        let g = graph(
            r#"
id: cond
nodes:
  - id: start
    type: trigger
  - id: check
    type: conditional
    config: { condition_type: not_empty }
  - id: yes_path
    type: command
    config: { command: "true" }
edges:
  - { source: start, target: check }
  - { source: check, target: yes_path, label: "true" }
"#,
        );
        let err = validate(g).unwrap_err();
        assert!(err
            .to_string()
            .contains("exactly one 'true' and one 'false'"));
    }

    #[test]
    fn test_conditional_edge_labels_must_be_branch_names() {
        let g = graph(
            r#"
id: cond
nodes:
  - id: start
    type: trigger
  - id: check
    type: conditional
    config: { condition_type: not_empty }
  - id: a
    type: command
    config: { command: "true" }
  - id: b
    type: command
    config: { command: "true" }
edges:
  - { source: start, target: check }
  - { source: check, target: a, label: "yes" }
  - { source: check, target: b, label: "false" }
"#,
        );
        let FlowError::Validation(violations) = validate(g).unwrap_err() else {
            panic!("expected validation error");
        };
        assert!(violations.iter().any(|v| v.contains("'yes'") || v.contains("\"yes\"")));
    }

    #[test]
    fn test_label_on_non_conditional_edge_rejected() {
        let g = graph(
            r#"
id: stray-label
nodes:
  - id: start
    type: trigger
  - id: a
    type: command
    config: { command: "true" }
  - id: b
    type: command
    config: { command: "true" }
edges:
  - { source: start, target: a }
  - { source: a, target: b, label: "true" }
"#,
        );
        let FlowError::Validation(violations) = validate(g).unwrap_err() else {
            panic!("expected validation error");
        };
        assert!(violations
            .iter()
            .any(|v| v.contains("not a conditional node")));
    }

    #[test]
    fn test_zero_retry_backoff_rejected() {
        let g = graph(
            r#"
id: zero-backoff
nodes:
  - id: start
    type: trigger
  - id: a
    type: command
    config: { command: "true" }
    retry_max: 2
    retry_backoff_seconds: 0
edges:
  - { source: start, target: a }
"#,
        );
        let err = validate(g).unwrap_err();
        assert!(err
            .to_string()
            .contains("retry_backoff_seconds must be at least 1"));
    }

    #[test]
    fn test_trigger_with_incoming_edge_rejected() {
        let g = graph(
            r#"
id: bad-trigger
nodes:
  - id: start
    type: trigger
  - id: a
    type: command
    config: { command: "true" }
  - id: late
    type: trigger
edges:
  - { source: start, target: a }
  - { source: a, target: late }
"#,
        );
        let err = validate(g).unwrap_err();
        assert!(err.to_string().contains("must not have incoming edges"));
    }
}
