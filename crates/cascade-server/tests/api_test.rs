//! Integration test: start the Cascade server and verify API endpoints.

use std::time::Duration;

use cascade_core::AppStateInner;

async fn boot() -> (String, reqwest::Client) {
    let state = AppStateInner::in_memory().unwrap();
    let app = cascade_server::create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{}", addr);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give server a moment to start
    tokio::time::sleep(Duration::from_millis(100)).await;

    (base_url, reqwest::Client::new())
}

const DEMO_GRAPH: &str = r#"
id: "demo"
name: "Demo"
nodes:
  - id: start
    type: trigger
  - id: hello
    type: command
    config:
      command: "printf hello"
edges:
  - { source: start, target: hello }
"#;

#[tokio::test]
async fn test_health_and_graph_crud() {
    let (base_url, client) = boot().await;

    // ── Health ─────────────────────────────────────────────────────
    let resp = client
        .get(format!("{}/api/health", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    // ── Create graph from YAML body ────────────────────────────────
    let resp = client
        .post(format!("{}/api/graphs", base_url))
        .body(DEMO_GRAPH)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["graphId"], "demo");

    // ── List ───────────────────────────────────────────────────────
    let resp = client
        .get(format!("{}/api/graphs", base_url))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    let graphs = body["graphs"].as_array().unwrap();
    assert_eq!(graphs.len(), 1);
    assert_eq!(graphs[0]["id"], "demo");
    assert_eq!(graphs[0]["nodeCount"], 2);

    // ── Get ────────────────────────────────────────────────────────
    let resp = client
        .get(format!("{}/api/graphs/demo", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["id"], "demo");
    assert_eq!(body["nodes"].as_array().unwrap().len(), 2);

    // ── Unknown graph is a 404 ─────────────────────────────────────
    let resp = client
        .get(format!("{}/api/graphs/nope", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // ── Delete ─────────────────────────────────────────────────────
    let resp = client
        .delete(format!("{}/api/graphs/demo", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client
        .get(format!("{}/api/graphs/demo", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_invalid_graph_is_rejected_with_all_violations() {
    let (base_url, client) = boot().await;

    // Two problems: no trigger, dangling edge target.
    let bad = r#"
id: "bad"
nodes:
  - id: a
    type: command
    config: { command: "true" }
edges:
  - { source: a, target: ghost }
"#;

    // Saving an invalid graph is a 400 and persists nothing.
    let resp = client
        .post(format!("{}/api/graphs", base_url))
        .body(bad)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["kind"], "validation");
    assert!(body["violations"].as_array().unwrap().len() >= 2);

    let resp = client
        .get(format!("{}/api/graphs/bad", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // The validate endpoint reports the same violations with a 200.
    let resp = client
        .post(format!("{}/api/graphs/validate", base_url))
        .body(bad)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["valid"], false);
    assert!(body["violations"].as_array().unwrap().len() >= 2);
}

#[tokio::test]
async fn test_run_lifecycle_over_http() {
    let (base_url, client) = boot().await;

    client
        .post(format!("{}/api/graphs", base_url))
        .body(DEMO_GRAPH)
        .send()
        .await
        .unwrap();

    // Start a run.
    let resp = client
        .post(format!("{}/api/runs", base_url))
        .json(&serde_json::json!({ "graphId": "demo" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let run_id = body["runId"].as_str().unwrap().to_string();

    // Poll until terminal.
    let mut run = serde_json::Value::Null;
    for _ in 0..50 {
        let resp = client
            .get(format!("{}/api/runs/{}", base_url, run_id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        run = resp.json().await.unwrap();
        if run["status"] != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(run["status"], "completed");
    let node_runs = run["node_runs"].as_array().unwrap();
    let hello = node_runs
        .iter()
        .find(|nr| nr["node_id"] == "hello")
        .unwrap();
    assert_eq!(hello["status"], "succeeded");
    assert_eq!(hello["output"], "hello");

    // Runs list includes it.
    let resp = client
        .get(format!("{}/api/runs?graphId=demo", base_url))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["runs"].as_array().unwrap().len(), 1);

    // Cancelling a finished run is a no-op 200.
    let resp = client
        .post(format!("{}/api/runs/{}/cancel", base_url, run_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Unknown run IDs are 404s.
    let resp = client
        .get(format!("{}/api/runs/nope", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let resp = client
        .post(format!("{}/api/runs/nope/cancel", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Starting a run of an unknown graph is a 404.
    let resp = client
        .post(format!("{}/api/runs", base_url))
        .json(&serde_json::json!({ "graphId": "ghost" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_session_lifecycle_over_http() {
    let (base_url, client) = boot().await;

    // `cat` echoes stdin back, so input delivery is observable.
    let resp = client
        .post(format!("{}/api/sessions", base_url))
        .json(&serde_json::json!({
            "executionType": "direct",
            "command": "cat"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let session_id = body["sessionId"].as_str().unwrap().to_string();

    // Listed and fetchable.
    let resp = client
        .get(format!("{}/api/sessions", base_url))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["sessions"].as_array().unwrap().len(), 1);

    let resp = client
        .get(format!("{}/api/sessions/{}", base_url, session_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["session"]["status"], "active");
    assert_eq!(body["session"]["mode"], "direct");

    // Input while active is accepted.
    let resp = client
        .post(format!("{}/api/sessions/{}/input", base_url, session_id))
        .json(&serde_json::json!({ "text": "ping" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Pause gates input with a 409.
    let resp = client
        .post(format!("{}/api/sessions/{}/pause", base_url, session_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client
        .post(format!("{}/api/sessions/{}/input", base_url, session_id))
        .json(&serde_json::json!({ "text": "blocked" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    // Resume, then stop. `cat` exits on stdin EOF, so the graceful stop
    // resolves quickly and the session completes.
    let resp = client
        .post(format!("{}/api/sessions/{}/resume", base_url, session_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client
        .post(format!("{}/api/sessions/{}/stop", base_url, session_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "completed");

    // Unknown execution type is a 400.
    let resp = client
        .post(format!("{}/api/sessions", base_url))
        .json(&serde_json::json!({
            "executionType": "mystery",
            "command": "cat"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}
