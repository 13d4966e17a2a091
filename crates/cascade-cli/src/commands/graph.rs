//! `cascade validate` / `cascade run` — Work with graph definition files.

use cascade_core::{CoreConfig, FlowError, NodeRunStatus, RunStatus, WorkflowGraph};

/// Validate a graph definition file; print every violation found.
pub fn validate(file: &str) -> Result<(), String> {
    let graph = WorkflowGraph::from_file(file)?;
    let node_count = graph.nodes.len();

    match cascade_core::validate(graph) {
        Ok(validated) => {
            println!(
                "✓ '{}' is valid ({} node(s), {} edge(s))",
                validated.graph.id,
                node_count,
                validated.graph.edges.len()
            );
            Ok(())
        }
        Err(FlowError::Validation(violations)) => {
            eprintln!("Found {} problem(s):", violations.len());
            for v in &violations {
                eprintln!("  - {}", v);
            }
            Err("Graph definition is invalid".to_string())
        }
        Err(other) => Err(other.to_string()),
    }
}

/// Execute a graph definition file to completion and print per-node results.
pub async fn run(
    db_path: &str,
    file: &str,
    payload: Option<String>,
    skills_dir: &str,
) -> Result<(), String> {
    let graph = WorkflowGraph::from_file(file)?;

    println!(
        "📄 Loaded graph: {} ({})",
        graph.name.as_deref().unwrap_or(&graph.id),
        file
    );
    println!("   {} node(s), {} edge(s)", graph.nodes.len(), graph.edges.len());
    println!();

    let config = CoreConfig {
        skills_dir: skills_dir.into(),
        ..CoreConfig::default()
    };
    let state = super::init_state(db_path, config).await;

    let run = state
        .engine
        .execute(graph, payload)
        .await
        .map_err(|e| e.to_string())?;

    println!("┌──────────────────────┬───────────┬──────────┐");
    println!("│ Node                 │ Status    │ Attempts │");
    println!("├──────────────────────┼───────────┼──────────┤");
    for nr in &run.node_runs {
        println!(
            "│ {:<20} │ {:<9} │ {:>8} │",
            truncate(&nr.node_id, 20),
            nr.status.as_str(),
            nr.attempts
        );
    }
    println!("└──────────────────────┴───────────┴──────────┘");

    for nr in &run.node_runs {
        if nr.status == NodeRunStatus::Failed {
            if let Some(err) = &nr.last_error {
                eprintln!("  {} failed: {}", nr.node_id, err);
            }
        }
    }
    for diag in &run.diagnostics {
        println!("  diagnostic: {}", diag);
    }

    match run.status {
        RunStatus::Completed => {
            println!("\n🎉 Run {} completed", run.id);
            Ok(())
        }
        status => Err(format!(
            "Run {} ended {}{}",
            run.id,
            status.as_str(),
            run.error
                .as_deref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        )),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
