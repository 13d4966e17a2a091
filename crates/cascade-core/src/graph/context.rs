//! Per-run execution context: prior node outputs, resolved variables, the
//! trigger payload, and conditional branch outcomes. The engine owns one
//! context per run and is the only writer; executors read it through
//! template rendering.

use std::collections::HashMap;

use crate::models::WorkflowGraph;
use crate::runners::TemplateEngine;

#[derive(Debug, Default)]
pub struct ExecutionContext {
    /// Workflow-level variables with `${ENV_VAR}` references expanded.
    variables: HashMap<String, String>,
    /// Node outputs indexed by node ID.
    outputs: HashMap<String, String>,
    /// Branch taken by each finished conditional node ("true" / "false").
    branches: HashMap<String, String>,
    trigger_payload: Option<String>,
}

impl ExecutionContext {
    pub fn new(graph: &WorkflowGraph, trigger_payload: Option<String>) -> Self {
        let variables = graph
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), resolve_env_vars(v)))
            .collect();
        Self {
            variables,
            outputs: HashMap::new(),
            branches: HashMap::new(),
            trigger_payload,
        }
    }

    pub fn record_output(&mut self, node_id: &str, output: String) {
        self.outputs.insert(node_id.to_string(), output);
    }

    pub fn record_branch(&mut self, node_id: &str, branch: &str) {
        self.branches.insert(node_id.to_string(), branch.to_string());
    }

    pub fn output(&self, node_id: &str) -> Option<&str> {
        self.outputs.get(node_id).map(|s| s.as_str())
    }

    pub fn branch(&self, node_id: &str) -> Option<&str> {
        self.branches.get(node_id).map(|s| s.as_str())
    }

    /// Resolve template variables in a string.
    ///
    /// Supported patterns:
    /// - `${trigger.payload}` — the trigger payload
    /// - `${nodes.<id>.output}` — output from an upstream node
    /// - `${variables.<key>}` or `${<key>}` — from the variables block
    /// - `${ENV_VAR}` — from environment
    ///
    /// Unresolvable references are left verbatim so they are visible in
    /// output rather than silently blanked.
    pub fn resolve_template(&self, template: &str) -> String {
        let mut result = template.to_string();

        if let Some(ref payload) = self.trigger_payload {
            result = result.replace("${trigger.payload}", payload);
        }

        let node_re = regex::Regex::new(r"\$\{nodes\.([^.]+)\.output\}").unwrap();
        result = node_re
            .replace_all(&result, |caps: &regex::Captures| {
                let node_id = &caps[1];
                self.outputs
                    .get(node_id)
                    .cloned()
                    .unwrap_or_else(|| format!("${{nodes.{}.output}}", node_id))
            })
            .to_string();

        let var_re = regex::Regex::new(r"\$\{variables\.([^}]+)\}").unwrap();
        result = var_re
            .replace_all(&result, |caps: &regex::Captures| {
                let key = &caps[1];
                self.variables
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| format!("${{variables.{}}}", key))
            })
            .to_string();

        // Remaining ${...}: variables, then node outputs, then env vars.
        let generic_re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
        result = generic_re
            .replace_all(&result, |caps: &regex::Captures| {
                let key = &caps[1];
                self.variables
                    .get(key)
                    .cloned()
                    .or_else(|| self.outputs.get(key).cloned())
                    .or_else(|| std::env::var(key).ok())
                    .unwrap_or_else(|| format!("${{{}}}", key))
            })
            .to_string();

        result
    }
}

impl TemplateEngine for ExecutionContext {
    fn render(&self, template: &str) -> String {
        self.resolve_template(template)
    }
}

/// Expand `${ENV_VAR}` references in a variable value.
fn resolve_env_vars(value: &str) -> String {
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
    re.replace_all(value, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| format!("${{{}}}", &caps[1]))
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_var(key: &str, value: &str) -> WorkflowGraph {
        WorkflowGraph::from_yaml(&format!(
            r#"
id: demo
variables:
  {}: "{}"
nodes:
  - id: start
    type: trigger
"#,
            key, value
        ))
        .unwrap()
    }

    #[test]
    fn test_resolve_node_output_and_variables() {
        let graph = graph_with_var("env", "staging");
        let mut ctx = ExecutionContext::new(&graph, Some("issue body".to_string()));
        ctx.record_output("fetch", "fetched data".to_string());

        assert_eq!(
            ctx.resolve_template("prev: ${nodes.fetch.output}"),
            "prev: fetched data"
        );
        assert_eq!(ctx.resolve_template("env: ${variables.env}"), "env: staging");
        assert_eq!(ctx.resolve_template("env: ${env}"), "env: staging");
        assert_eq!(
            ctx.resolve_template("payload: ${trigger.payload}"),
            "payload: issue body"
        );
    }

    #[test]
    fn test_unresolved_reference_left_verbatim() {
        let graph = WorkflowGraph::from_yaml("id: x\nnodes: [{id: t, type: trigger}]").unwrap();
        let ctx = ExecutionContext::new(&graph, None);
        assert_eq!(
            ctx.resolve_template("${nodes.never.output}"),
            "${nodes.never.output}"
        );
    }

    #[test]
    fn test_variables_expand_env_references() {
        std::env::set_var("CASCADE_TEST_HOME", "/srv/cascade");
        let graph = graph_with_var("root", "${CASCADE_TEST_HOME}/work");
        let ctx = ExecutionContext::new(&graph, None);
        assert_eq!(ctx.resolve_template("${root}"), "/srv/cascade/work");
    }
}
