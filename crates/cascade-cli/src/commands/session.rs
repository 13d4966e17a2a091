//! `cascade session` — Steer interactive sessions on a running server.

use super::print_json;

pub struct SessionClient {
    base_url: String,
    client: reqwest::Client,
}

impl SessionClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn handle(&self, resp: reqwest::Response) -> Result<serde_json::Value, String> {
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| format!("Invalid response from server: {}", e))?;
        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("Unknown server error");
            return Err(format!("{} ({})", message, status));
        }
        Ok(body)
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value, String> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| format!("Cannot reach server at {}: {}", self.base_url, e))?;
        self.handle(resp).await
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("Cannot reach server at {}: {}", self.base_url, e))?;
        self.handle(resp).await
    }

    pub async fn list(&self) -> Result<(), String> {
        let body = self.get("/api/sessions").await?;
        print_json(&body);
        Ok(())
    }

    pub async fn start(
        &self,
        command: &str,
        args: Vec<String>,
        mode: &str,
        cwd: Option<String>,
        task: Option<String>,
        max_iterations: Option<u32>,
    ) -> Result<(), String> {
        let mut request = serde_json::json!({
            "executionType": mode,
            "command": command,
            "args": args,
        });
        if let Some(cwd) = cwd {
            request["cwd"] = serde_json::json!(cwd);
        }
        if task.is_some() || max_iterations.is_some() {
            request["config"] = serde_json::json!({
                "task": task,
                "maxIterations": max_iterations,
            });
        }

        let body = self.post("/api/sessions", request).await?;
        println!(
            "Started session {}",
            body["sessionId"].as_str().unwrap_or("?")
        );
        Ok(())
    }

    pub async fn status(&self, session_id: &str) -> Result<(), String> {
        let body = self.get(&format!("/api/sessions/{}", session_id)).await?;
        print_json(&body);
        Ok(())
    }

    pub async fn send(&self, session_id: &str, text: &str) -> Result<(), String> {
        self.post(
            &format!("/api/sessions/{}/input", session_id),
            serde_json::json!({ "text": text }),
        )
        .await?;
        println!("Sent.");
        Ok(())
    }

    pub async fn pause(&self, session_id: &str) -> Result<(), String> {
        let body = self
            .post(
                &format!("/api/sessions/{}/pause", session_id),
                serde_json::json!({}),
            )
            .await?;
        println!("Session is {}", body["status"].as_str().unwrap_or("?"));
        Ok(())
    }

    pub async fn resume(&self, session_id: &str) -> Result<(), String> {
        let body = self
            .post(
                &format!("/api/sessions/{}/resume", session_id),
                serde_json::json!({}),
            )
            .await?;
        println!("Session is {}", body["status"].as_str().unwrap_or("?"));
        Ok(())
    }

    pub async fn stop(&self, session_id: &str) -> Result<(), String> {
        let body = self
            .post(
                &format!("/api/sessions/{}/stop", session_id),
                serde_json::json!({}),
            )
            .await?;
        println!("Session is {}", body["status"].as_str().unwrap_or("?"));
        Ok(())
    }
}
