//! HTTP client for the orchestrator API.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;

/// Task shape as served by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskView {
    pub id: String,
    pub repo: String,
    pub branch: String,
    pub prompt: String,
    pub status: String,
    pub ci_run_id: Option<i64>,
    pub attempts: u32,
    pub summary: String,
    pub branch_url: Option<String>,
    pub pr_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatedTask {
    pub id: String,
    pub branch: String,
}

#[derive(Debug, Deserialize)]
pub struct TaskList {
    pub tasks: Vec<TaskView>,
    pub total: i64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base_url)
    }

    pub async fn create(&self, repo: &str, prompt: &str) -> Result<CreatedTask> {
        let response = self
            .http
            .post(self.url("/tasks"))
            .json(&json!({ "repo": repo, "prompt": prompt }))
            .send()
            .await
            .context("send create request")?;
        Self::parse(response).await
    }

    pub async fn list(
        &self,
        status: Option<&str>,
        repo: Option<&str>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<TaskList> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(status) = status {
            query.push(("status", status.to_string()));
        }
        if let Some(repo) = repo {
            query.push(("repo", repo.to_string()));
        }
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }
        let response = self
            .http
            .get(self.url("/tasks"))
            .query(&query)
            .send()
            .await
            .context("send list request")?;
        Self::parse(response).await
    }

    pub async fn get(&self, id: &str) -> Result<TaskView> {
        let response = self
            .http
            .get(self.url(&format!("/tasks/{id}")))
            .send()
            .await
            .context("send get request")?;
        Self::parse(response).await
    }

    pub async fn update(&self, id: &str, action: &str, prompt: Option<&str>) -> Result<()> {
        let mut body = json!({ "action": action });
        if let Some(prompt) = prompt {
            body["prompt"] = json!(prompt);
        }
        let response = self
            .http
            .patch(self.url(&format!("/tasks/{id}")))
            .json(&body)
            .send()
            .await
            .context("send update request")?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::error_from(response).await)
    }

    /// Stream the SSE log endpoint, invoking `on_data` for every `data:`
    /// payload until the server closes the stream or the process is
    /// interrupted.
    pub async fn stream_logs(
        &self,
        id: &str,
        mut on_data: impl FnMut(&str),
    ) -> Result<()> {
        let mut response = self
            .http
            .get(self.url(&format!("/tasks/{id}/logs")))
            .send()
            .await
            .context("send logs request")?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let mut buffer = String::new();
        while let Some(chunk) = response.chunk().await.context("read log stream")? {
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end().to_string();
                buffer.drain(..=pos);
                if let Some(data) = line.strip_prefix("data: ") {
                    if data != "{}" && data != "ping" {
                        on_data(data);
                    }
                }
            }
        }
        Ok(())
    }

    async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        if response.status().is_success() {
            return response.json().await.context("decode response");
        }
        Err(Self::error_from(response).await)
    }

    async fn error_from(response: reqwest::Response) -> anyhow::Error {
        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(body) => anyhow!("{} ({status})", body.message),
            Err(_) => anyhow!("request failed with {status}"),
        }
    }
}
