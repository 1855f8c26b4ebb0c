//! CI provider: observes run conclusions for a pushed branch and fetches
//! failure logs.
//!
//! The engine only consumes the [`CiProvider`] trait; the production
//! implementation polls the GitHub Actions REST API. Tests use scripted
//! providers.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum CiError {
    #[error("operation not supported by this provider")]
    Unsupported,
    #[error("ci provider request failed: {0}")]
    Failed(String),
    #[error("ci observation cancelled")]
    Cancelled,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Final status of a CI run for a specific commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiConclusion {
    Success,
    Failure,
    /// No conclusion became observable before the deadline.
    TimedOut,
}

/// Outcome of observing CI for a branch + commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiObservation {
    /// Identifier of the observed run; absent when no run appeared at all.
    pub run_id: Option<i64>,
    pub conclusion: CiConclusion,
}

#[async_trait]
pub trait CiProvider: Send + Sync {
    /// Block (cooperatively) until the run targeting `branch`/`commit` has a
    /// conclusion or `deadline` elapses, polling with modest backoff.
    async fn observe(
        &self,
        repo: &str,
        branch: &str,
        commit: &str,
        cancel: &CancellationToken,
        deadline: Duration,
    ) -> Result<CiObservation, CiError>;

    async fn fetch_failure_logs(&self, repo: &str, run_id: i64) -> Result<Vec<u8>, CiError>;

    /// Best-effort pull request creation. `Unsupported` when the provider has
    /// no credentials.
    async fn open_pull_request(
        &self,
        repo: &str,
        base: &str,
        head: &str,
        title: &str,
        body: &str,
    ) -> Result<String, CiError>;
}

/// GitHub Actions provider over the REST API.
pub struct GitHubCi {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct RunsResponse {
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRun {
    id: i64,
    status: String,
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    html_url: String,
}

impl GitHubCi {
    pub fn new(api_base: impl Into<String>, token: Option<String>, poll_interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            token,
            poll_interval,
        }
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "orchestrator");
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn latest_run(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
        commit: &str,
    ) -> Result<Option<WorkflowRun>, CiError> {
        let url = format!(
            "{}/repos/{owner}/{name}/actions/runs?branch={branch}&head_sha={commit}&per_page=1",
            self.api_base
        );
        let response = self.request(reqwest::Method::GET, url).send().await?;
        if !response.status().is_success() {
            return Err(CiError::Failed(format!(
                "list workflow runs returned {}",
                response.status()
            )));
        }
        let runs: RunsResponse = response.json().await?;
        Ok(runs.workflow_runs.into_iter().next())
    }
}

#[async_trait]
impl CiProvider for GitHubCi {
    #[instrument(skip_all, fields(branch, commit))]
    async fn observe(
        &self,
        repo: &str,
        branch: &str,
        commit: &str,
        cancel: &CancellationToken,
        deadline: Duration,
    ) -> Result<CiObservation, CiError> {
        let (owner, name) = parse_repo(repo)?;
        let started = tokio::time::Instant::now();
        let mut interval = self.poll_interval;
        let mut last_run_id = None;

        info!(repo, branch, "observing ci");
        loop {
            if started.elapsed() >= deadline {
                warn!(branch, "ci deadline elapsed without conclusion");
                return Ok(CiObservation {
                    run_id: last_run_id,
                    conclusion: CiConclusion::TimedOut,
                });
            }

            match self.latest_run(&owner, &name, branch, commit).await {
                Ok(Some(run)) => {
                    last_run_id = Some(run.id);
                    if run.status == "completed" {
                        let conclusion = match run.conclusion.as_deref() {
                            Some("success") => CiConclusion::Success,
                            _ => CiConclusion::Failure,
                        };
                        debug!(run_id = run.id, ?conclusion, "ci run concluded");
                        return Ok(CiObservation {
                            run_id: Some(run.id),
                            conclusion,
                        });
                    }
                }
                Ok(None) => debug!(branch, "no workflow run yet"),
                // Transient listing failures are absorbed by the next poll.
                Err(err) => warn!(error = %err, "ci poll failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(CiError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
            interval = next_backoff(interval);
        }
    }

    async fn fetch_failure_logs(&self, repo: &str, run_id: i64) -> Result<Vec<u8>, CiError> {
        let (owner, name) = parse_repo(repo)?;
        let url = format!(
            "{}/repos/{owner}/{name}/actions/runs/{run_id}/logs",
            self.api_base
        );
        let response = self.request(reqwest::Method::GET, url).send().await?;
        if !response.status().is_success() {
            return Err(CiError::Failed(format!(
                "fetch run logs returned {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn open_pull_request(
        &self,
        repo: &str,
        base: &str,
        head: &str,
        title: &str,
        body: &str,
    ) -> Result<String, CiError> {
        if self.token.is_none() {
            return Err(CiError::Unsupported);
        }
        let (owner, name) = parse_repo(repo)?;
        let url = format!("{}/repos/{owner}/{name}/pulls", self.api_base);
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&serde_json::json!({
                "title": title,
                "head": head,
                "base": base,
                "body": body,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CiError::Failed(format!(
                "create pull request returned {}",
                response.status()
            )));
        }
        let pull: PullResponse = response.json().await?;
        Ok(pull.html_url)
    }
}

/// Modest backoff: grow by half, capped at one minute.
fn next_backoff(current: Duration) -> Duration {
    (current + current / 2).min(Duration::from_secs(60))
}

/// Extract `(owner, name)` from a repository locator: a web URL, an scp-style
/// ssh URL, or `owner/name` shorthand.
pub fn parse_repo(repo: &str) -> Result<(String, String), CiError> {
    let path = if let Some(rest) = repo.strip_prefix("git@") {
        rest.split_once(':')
            .map(|(_, path)| path)
            .ok_or_else(|| CiError::Other(anyhow!("unsupported repository url: {repo}")))?
    } else if let Some(idx) = repo.find("://") {
        let after_scheme = &repo[idx + 3..];
        after_scheme
            .split_once('/')
            .map(|(_, path)| path)
            .ok_or_else(|| CiError::Other(anyhow!("unsupported repository url: {repo}")))?
    } else {
        repo
    };

    let path = path.trim_end_matches('/').trim_end_matches(".git");
    let mut parts = path.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => {
            Ok((owner.to_string(), name.to_string()))
        }
        _ => Err(CiError::Other(anyhow!("invalid repository path: {path}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_https_url() {
        let (owner, name) = parse_repo("https://github.com/acme/widget.git").expect("parse");
        assert_eq!((owner.as_str(), name.as_str()), ("acme", "widget"));
    }

    #[test]
    fn parses_ssh_url() {
        let (owner, name) = parse_repo("git@github.com:acme/widget.git").expect("parse");
        assert_eq!((owner.as_str(), name.as_str()), ("acme", "widget"));
    }

    #[test]
    fn parses_shorthand() {
        let (owner, name) = parse_repo("acme/widget").expect("parse");
        assert_eq!((owner.as_str(), name.as_str()), ("acme", "widget"));
    }

    #[test]
    fn rejects_pathless_url() {
        assert!(parse_repo("https://github.com/acme").is_err());
        assert!(parse_repo("justaname").is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let first = next_backoff(Duration::from_secs(15));
        assert_eq!(first, Duration::from_secs(22) + Duration::from_millis(500));
        assert_eq!(next_backoff(Duration::from_secs(90)), Duration::from_secs(60));
    }

    #[test]
    fn pr_requires_token() {
        let ci = GitHubCi::new("https://api.github.com", None, Duration::from_secs(15));
        let err = tokio::runtime::Runtime::new()
            .expect("rt")
            .block_on(ci.open_pull_request("acme/widget", "main", "amp/abc123", "t", "b"))
            .unwrap_err();
        assert!(matches!(err, CiError::Unsupported));
    }
}
