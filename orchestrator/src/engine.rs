//! Per-task execution engine.
//!
//! Drives one claimed task (status `running`) through clone -> branch ->
//! generate -> commit -> push -> CI observation, looping on failure feedback
//! until a terminal or suspended state is reached or the task is cancelled.
//! Every outcome is persisted through the store; the working directory is
//! removed on every exit path.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::core::feedback::compose_retry_prompt;
use crate::core::task::{LogLevel, Task, TaskLogEntry, TaskPatch, TaskStatus};
use crate::io::ci::{CiConclusion, CiError, CiProvider};
use crate::io::generator::{GeneratorError, GeneratorExecutor};
use crate::io::git::{VcsError, VcsExecutor};
use crate::io::store::{SqliteStore, StoreError};

/// How often the engine polls the store for a control-surface abort while a
/// long external operation is in flight.
const DEFAULT_ABORT_POLL: Duration = Duration::from_secs(2);

/// Bounded in-iteration retries for transient network operations.
const TRANSIENT_ATTEMPTS: u32 = 3;
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(500);

/// Internal failure taxonomy. Never leaks to clients; the engine maps these
/// onto task statuses and summaries.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    #[error("subprocess failed: {0}")]
    SubprocessFailed(String),
    #[error("cancelled")]
    Cancelled,
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// Everything an engine needs to execute tasks.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<SqliteStore>,
    pub vcs: Arc<dyn VcsExecutor>,
    pub generator: Arc<dyn GeneratorExecutor>,
    pub ci: Arc<dyn CiProvider>,
    pub config: Arc<OrchestratorConfig>,
}

pub struct Engine {
    deps: EngineDeps,
    abort_poll: Duration,
}

impl Engine {
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            deps,
            abort_poll: DEFAULT_ABORT_POLL,
        }
    }

    /// Shorten the store-abort polling period (tests exercise cancellation
    /// latency with sub-second intervals).
    pub fn with_abort_poll(mut self, interval: Duration) -> Self {
        self.abort_poll = interval;
        self
    }

    /// Execute `task` until it reaches a terminal or suspended state.
    ///
    /// Returns the persisted final status, or [`EngineError::Cancelled`] when
    /// an abort or shutdown interrupted the run (status untouched in the
    /// shutdown case; already `aborted` in the abort case).
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub async fn run(
        &self,
        task: Task,
        cancel: CancellationToken,
    ) -> Result<TaskStatus, EngineError> {
        // Child token fired by shutdown (parent) or by the abort watcher; it
        // is what every external call observes.
        let op_cancel = cancel.child_token();
        let _watcher = self.spawn_abort_watcher(task.id.clone(), op_cancel.clone());

        let result = self.drive(task.clone(), &op_cancel).await;
        match result {
            Ok(status) => {
                info!(status = %status, "task finished");
                Ok(status)
            }
            Err(EngineError::Cancelled) => {
                info!("task cancelled");
                Err(EngineError::Cancelled)
            }
            Err(err) => {
                // Internal failure: surface as a terminal error status with a
                // reproducible diagnostic.
                warn!(error = %err, "task failed internally");
                self.log(&task.id, LogLevel::Error, &err.to_string()).await;
                let status = self
                    .finish(
                        &task.id,
                        TaskStatus::Error,
                        format!("internal failure: {err}"),
                        TaskPatch::default(),
                    )
                    .await?;
                Ok(status)
            }
        }
    }

    /// Background poll that fires the operation token when the control
    /// surface aborts the task mid-operation.
    fn spawn_abort_watcher(
        &self,
        task_id: String,
        op_cancel: CancellationToken,
    ) -> AbortOnDropHandle<()> {
        let store = Arc::clone(&self.deps.store);
        let interval = self.abort_poll;
        AbortOnDropHandle::new(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match store.get(&task_id).await {
                    Ok(task) if task.status == TaskStatus::Aborted => {
                        debug!(task_id = %task_id, "abort observed, cancelling in-flight work");
                        op_cancel.cancel();
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => return,
                }
            }
        }))
    }

    async fn drive(
        &self,
        mut task: Task,
        cancel: &CancellationToken,
    ) -> Result<TaskStatus, EngineError> {
        let cfg = &self.deps.config;

        self.ensure_alive(&task.id, cancel).await?;

        // Scoped working directory: removed on every exit path, including
        // panics, when the guard drops.
        let work = self.prepare_workdir(&task).await?;
        let repo_dir = work.path().join("repo");

        self.log(&task.id, LogLevel::Info, "cloning repository").await;
        let clone = retry_transient(TRANSIENT_ATTEMPTS, || {
            self.deps
                .vcs
                .clone_repo(&task.repo, &repo_dir, cancel, cfg.clone_timeout())
        })
        .await;
        if let Err(err) = clone {
            if matches!(err, VcsError::Cancelled) {
                return Err(EngineError::Cancelled);
            }
            self.log(&task.id, LogLevel::Error, &format!("clone failed: {err}"))
                .await;
            return self
                .finish(
                    &task.id,
                    TaskStatus::Error,
                    format!("clone failed: {err}"),
                    TaskPatch::default(),
                )
                .await;
        }

        self.ensure_alive(&task.id, cancel).await?;
        self.log(
            &task.id,
            LogLevel::Info,
            &format!("creating branch {}", task.branch),
        )
        .await;
        if let Err(err) = self
            .deps
            .vcs
            .create_branch(&repo_dir, &task.branch, cancel, cfg.push_timeout())
            .await
        {
            if matches!(err, VcsError::Cancelled) {
                return Err(EngineError::Cancelled);
            }
            self.log(
                &task.id,
                LogLevel::Error,
                &format!("branch creation failed: {err}"),
            )
            .await;
            return self
                .finish(
                    &task.id,
                    TaskStatus::Error,
                    format!("branch creation failed: {err}"),
                    TaskPatch::default(),
                )
                .await;
        }

        loop {
            self.ensure_alive(&task.id, cancel).await?;

            match self.iterate(&mut task, &repo_dir, cancel).await? {
                IterationOutcome::Finished(status) => return Ok(status),
                IterationOutcome::Retry => {
                    // retrying -> running for the next pass; the engine keeps
                    // its concurrency slot and working tree.
                    self.transition(&task.id, TaskStatus::Retrying, TaskPatch::default())
                        .await?;
                    self.ensure_alive(&task.id, cancel).await?;
                    self.transition(&task.id, TaskStatus::Running, TaskPatch::default())
                        .await?;
                }
            }
        }
    }

    /// One generate -> commit -> push -> observe pass.
    async fn iterate(
        &self,
        task: &mut Task,
        repo_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<IterationOutcome, EngineError> {
        let cfg = &self.deps.config;

        self.log(&task.id, LogLevel::Info, "invoking generator").await;
        let outcome = match self
            .deps
            .generator
            .run(repo_dir, &task.prompt, cancel, cfg.generator_timeout())
            .await
        {
            Ok(outcome) => outcome,
            Err(GeneratorError::Cancelled) => return Err(EngineError::Cancelled),
            Err(GeneratorError::Timeout(after)) => {
                self.log(
                    &task.id,
                    LogLevel::Error,
                    &format!("generator timed out after {after:?}"),
                )
                .await;
                let status = self
                    .finish(
                        &task.id,
                        TaskStatus::Error,
                        "generator timeout".to_string(),
                        TaskPatch::default(),
                    )
                    .await?;
                return Ok(IterationOutcome::Finished(status));
            }
            Err(err) => {
                self.log(&task.id, LogLevel::Error, &format!("generator failed: {err}"))
                    .await;
                let status = self
                    .finish(
                        &task.id,
                        TaskStatus::Error,
                        format!("generator failed: {err}"),
                        TaskPatch::default(),
                    )
                    .await?;
                return Ok(IterationOutcome::Finished(status));
            }
        };

        // A run that touched nothing cannot be pushed or verified; hand it to
        // an operator, even when the tool claimed success.
        if outcome.changed_files.is_empty() {
            self.log(
                &task.id,
                LogLevel::Warn,
                "generator finished without changing any files",
            )
            .await;
            let summary = if outcome.success {
                "generator reported success but changed no files".to_string()
            } else {
                format!(
                    "generator made no changes: {}",
                    first_line(&outcome.diagnostic)
                )
            };
            let status = self
                .finish(&task.id, TaskStatus::NeedsReview, summary, TaskPatch::default())
                .await?;
            return Ok(IterationOutcome::Finished(status));
        }

        self.ensure_alive(&task.id, cancel).await?;
        self.log(
            &task.id,
            LogLevel::Info,
            &format!("committing {} changed file(s)", outcome.changed_files.len()),
        )
        .await;
        let message = format!("task {}: {}", task.id, truncate(&task.prompt, 50));
        if let Err(err) = self
            .deps
            .vcs
            .commit_all(repo_dir, &message, cancel, cfg.push_timeout())
            .await
        {
            if matches!(err, VcsError::Cancelled) {
                return Err(EngineError::Cancelled);
            }
            let status = self
                .finish(
                    &task.id,
                    TaskStatus::Error,
                    format!("commit failed: {err}"),
                    TaskPatch::default(),
                )
                .await?;
            return Ok(IterationOutcome::Finished(status));
        }

        self.log(&task.id, LogLevel::Info, "pushing branch").await;
        let push = retry_transient(TRANSIENT_ATTEMPTS, || {
            self.deps
                .vcs
                .push(repo_dir, &task.branch, cancel, cfg.push_timeout())
        })
        .await;
        if let Err(err) = push {
            if matches!(err, VcsError::Cancelled) {
                return Err(EngineError::Cancelled);
            }
            self.log(&task.id, LogLevel::Error, &format!("push failed: {err}"))
                .await;
            let status = self
                .finish(
                    &task.id,
                    TaskStatus::Error,
                    format!("push failed: {err}"),
                    TaskPatch::default(),
                )
                .await?;
            return Ok(IterationOutcome::Finished(status));
        }

        let commit = self
            .deps
            .vcs
            .head_commit(repo_dir, cancel, cfg.push_timeout())
            .await
            .map_err(|err| EngineError::SubprocessFailed(format!("resolve head commit: {err}")))?;

        self.ensure_alive(&task.id, cancel).await?;
        self.log(
            &task.id,
            LogLevel::Info,
            &format!("observing ci for commit {commit}"),
        )
        .await;
        let observation = match self
            .deps
            .ci
            .observe(&task.repo, &task.branch, &commit, cancel, cfg.ci_deadline())
            .await
        {
            Ok(observation) => observation,
            Err(CiError::Cancelled) => return Err(EngineError::Cancelled),
            Err(err) => {
                let status = self
                    .finish(
                        &task.id,
                        TaskStatus::Error,
                        format!("ci observation failed: {err}"),
                        TaskPatch::default(),
                    )
                    .await?;
                return Ok(IterationOutcome::Finished(status));
            }
        };

        if let Some(run_id) = observation.run_id {
            task.ci_run_id = Some(run_id);
        }

        match observation.conclusion {
            CiConclusion::Success => {
                let status = self.conclude_success(task, repo_dir, cancel).await?;
                Ok(IterationOutcome::Finished(status))
            }
            CiConclusion::TimedOut => {
                self.log(&task.id, LogLevel::Error, "ci conclusion not observable")
                    .await;
                let status = self
                    .finish(
                        &task.id,
                        TaskStatus::Error,
                        "ci timeout".to_string(),
                        TaskPatch {
                            ci_run_id: task.ci_run_id,
                            ..TaskPatch::default()
                        },
                    )
                    .await?;
                Ok(IterationOutcome::Finished(status))
            }
            CiConclusion::Failure => self.conclude_failure(task).await,
        }
    }

    /// CI green: best-effort PR, record links, finish the task.
    async fn conclude_success(
        &self,
        task: &mut Task,
        repo_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<TaskStatus, EngineError> {
        let cfg = &self.deps.config;
        self.log(&task.id, LogLevel::Info, "ci succeeded").await;

        let remote = self
            .deps
            .vcs
            .remote_url(repo_dir, cancel, cfg.push_timeout())
            .await
            .ok();
        let branch_url = remote
            .as_ref()
            .map(|url| format!("{url}/tree/{}", task.branch));

        let title = format!("Task: {}", truncate(&task.prompt, 50));
        let body = format!(
            "Automated change generated for task {}.\n\nOriginal prompt: {}",
            task.id, task.prompt
        );
        let pr_url = match self
            .deps
            .ci
            .open_pull_request(&task.repo, "main", &task.branch, &title, &body)
            .await
        {
            Ok(url) => {
                self.log(&task.id, LogLevel::Info, &format!("pull request opened: {url}"))
                    .await;
                Some(url)
            }
            Err(CiError::Unsupported) => None,
            Err(err) => {
                // Best-effort: a failed PR does not fail the task.
                self.log(
                    &task.id,
                    LogLevel::Warn,
                    &format!("pull request creation failed: {err}"),
                )
                .await;
                None
            }
        };

        self.finish(
            &task.id,
            TaskStatus::Success,
            "ci passed".to_string(),
            TaskPatch {
                ci_run_id: task.ci_run_id,
                branch_url,
                pr_url,
                ..TaskPatch::default()
            },
        )
        .await
    }

    /// CI red: compose the feedback prompt, consume retry budget, suspend or
    /// go around again.
    async fn conclude_failure(&self, task: &mut Task) -> Result<IterationOutcome, EngineError> {
        let cfg = &self.deps.config;
        self.log(&task.id, LogLevel::Warn, "ci failed").await;

        let logs = match task.ci_run_id {
            Some(run_id) => match self.deps.ci.fetch_failure_logs(&task.repo, run_id).await {
                Ok(logs) => logs,
                Err(err) => {
                    self.log(
                        &task.id,
                        LogLevel::Warn,
                        &format!("failed to fetch ci logs: {err}"),
                    )
                    .await;
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        task.prompt = compose_retry_prompt(&logs, &cfg.feedback_limits());
        task.attempts += 1;

        let patch = TaskPatch {
            prompt: Some(task.prompt.clone()),
            attempts: Some(task.attempts),
            ci_run_id: task.ci_run_id,
            ..TaskPatch::default()
        };

        if task.attempts >= cfg.max_retries {
            self.log(
                &task.id,
                LogLevel::Error,
                &format!("retry budget exhausted ({} attempts)", task.attempts),
            )
            .await;
            let status = self
                .finish(
                    &task.id,
                    TaskStatus::NeedsReview,
                    format!(
                        "ci failing after max retries ({}); manual review required",
                        cfg.max_retries
                    ),
                    patch,
                )
                .await?;
            return Ok(IterationOutcome::Finished(status));
        }

        self.log(
            &task.id,
            LogLevel::Info,
            &format!(
                "retrying with feedback prompt (attempt {}/{})",
                task.attempts, cfg.max_retries
            ),
        )
        .await;
        self.deps
            .store
            .update_fields(&task.id, patch)
            .await
            .map_err(store_to_engine)?;
        Ok(IterationOutcome::Retry)
    }

    async fn prepare_workdir(&self, task: &Task) -> Result<TempDir, EngineError> {
        let parent = &self.deps.config.work_dir;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| EngineError::SubprocessFailed(format!("create work dir: {err}")))?;
        let short: String = task.id.chars().take(6).collect();
        tempfile::Builder::new()
            .prefix(&format!("task-{}-", short.to_lowercase()))
            .tempdir_in(parent)
            .map_err(|err| EngineError::SubprocessFailed(format!("create task workdir: {err}")))
    }

    /// Cancellation checkpoint: shutdown token or a store-observed abort.
    async fn ensure_alive(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match self.deps.store.get(task_id).await {
            Ok(task) if task.status == TaskStatus::Aborted => Err(EngineError::Cancelled),
            Ok(_) => Ok(()),
            Err(err) => Err(EngineError::InvariantViolation(format!(
                "task disappeared mid-run: {err}"
            ))),
        }
    }

    /// Persist a terminal or suspended outcome.
    async fn finish(
        &self,
        task_id: &str,
        status: TaskStatus,
        summary: String,
        mut patch: TaskPatch,
    ) -> Result<TaskStatus, EngineError> {
        patch.summary = Some(summary);
        self.transition(task_id, status, patch).await?;
        Ok(status)
    }

    async fn transition(
        &self,
        task_id: &str,
        status: TaskStatus,
        patch: TaskPatch,
    ) -> Result<(), EngineError> {
        match self.deps.store.update_status(task_id, status, patch).await {
            Ok(_) => Ok(()),
            // A concurrent abort wins any race with the engine's own writes.
            Err(StoreError::InvalidTransition {
                from: TaskStatus::Aborted,
                ..
            }) => Err(EngineError::Cancelled),
            Err(err) => Err(store_to_engine(err)),
        }
    }

    /// Append a task log entry; store failures are reported to tracing only.
    async fn log(&self, task_id: &str, level: LogLevel, message: &str) {
        let entry = TaskLogEntry {
            task_id: task_id.to_string(),
            level,
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(err) = self.deps.store.append_log(&entry).await {
            warn!(error = %err, "failed to append task log");
        }
    }
}

enum IterationOutcome {
    Finished(TaskStatus),
    Retry,
}

fn store_to_engine(err: StoreError) -> EngineError {
    match err {
        StoreError::InvalidTransition { from, to } => {
            EngineError::InvariantViolation(format!("invalid transition {from} -> {to}"))
        }
        other => EngineError::InvariantViolation(other.to_string()),
    }
}

/// Retry a fallible network-shaped operation with exponential backoff.
async fn retry_transient<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, VcsError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, VcsError>>,
{
    let mut backoff = TRANSIENT_BACKOFF;
    let mut last_err = None;
    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err @ (VcsError::Cancelled | VcsError::InvalidName(_))) => return Err(err),
            Err(err) => {
                debug!(attempt, error = %err, "transient operation failed");
                last_err = Some(err);
                if attempt + 1 < attempts {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
    Err(last_err.unwrap_or(VcsError::Cancelled))
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate("fix bug", 50), "fix bug");
    }

    #[test]
    fn truncate_marks_long_strings() {
        let long = "a".repeat(60);
        let out = truncate(&long, 50);
        assert_eq!(out.chars().count(), 50);
        assert!(out.ends_with("..."));
    }

    #[tokio::test]
    async fn retry_transient_stops_after_budget() {
        let mut calls = 0;
        let result: Result<(), VcsError> = retry_transient(3, || {
            calls += 1;
            async { Err(VcsError::PushFailed("remote hung up".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(VcsError::PushFailed(_))));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_transient_does_not_retry_cancellation() {
        let mut calls = 0;
        let result: Result<(), VcsError> = retry_transient(3, || {
            calls += 1;
            async { Err(VcsError::Cancelled) }
        })
        .await;
        assert!(matches!(result, Err(VcsError::Cancelled)));
        assert_eq!(calls, 1);
    }
}
