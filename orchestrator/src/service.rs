//! Task service: the control surface exposed to the API layer.
//!
//! Wraps the store with input validation and the outward error taxonomy
//! (`NotFound` / `Conflict` / `Validation` / `Internal`). The dispatcher and
//! engines observe the mutations made here through the store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::core::naming::{branch_for, mint_task_id, thread_for};
use crate::core::task::{Task, TaskFilter, TaskLogEntry, TaskPatch, TaskStatus};
use crate::io::store::{SqliteStore, StoreError};

/// Prompts beyond this are rejected at the boundary.
const MAX_PROMPT_CHARS: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("task not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ServiceError::NotFound,
            StoreError::InvalidTransition { from, to } => {
                ServiceError::Conflict(format!("cannot transition {from} -> {to}"))
            }
            StoreError::Duplicate(id) => ServiceError::Conflict(format!("task {id} exists")),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

/// Business operations over tasks.
#[derive(Clone)]
pub struct TaskService {
    store: Arc<SqliteStore>,
}

impl TaskService {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Create a task in `queued` with a freshly minted id and derived branch.
    #[instrument(skip_all, fields(repo))]
    pub async fn create_task(&self, repo: &str, prompt: &str) -> Result<Task, ServiceError> {
        validate_repo(repo)?;
        validate_prompt(prompt)?;

        let id = mint_task_id();
        let now = Utc::now();
        let task = Task {
            branch: branch_for(&id),
            thread_id: thread_for(&id),
            id,
            repo: repo.to_string(),
            prompt: prompt.to_string(),
            status: TaskStatus::Queued,
            ci_run_id: None,
            attempts: 0,
            summary: String::new(),
            branch_url: None,
            pr_url: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create(&task).await?;
        info!(id = %task.id, branch = %task.branch, "task created");
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task, ServiceError> {
        Ok(self.store.get(id).await?)
    }

    /// List tasks newest-first. Negative limit or offset are rejected; the
    /// store clamps the limit to its hard bound.
    pub async fn list_tasks(&self, filter: TaskFilter) -> Result<(Vec<Task>, i64), ServiceError> {
        if filter.limit.is_some_and(|l| l < 0) {
            return Err(ServiceError::Validation("limit must be >= 0".to_string()));
        }
        if filter.offset.is_some_and(|o| o < 0) {
            return Err(ServiceError::Validation("offset must be >= 0".to_string()));
        }
        Ok(self.store.list(&filter).await?)
    }

    /// Re-queue a suspended task, optionally overwriting the prompt.
    ///
    /// Valid from `retrying` and `needs_review`. The retry budget is shared
    /// across continues: `attempts` is not reset.
    #[instrument(skip_all, fields(id))]
    pub async fn continue_task(
        &self,
        id: &str,
        new_prompt: Option<&str>,
    ) -> Result<(), ServiceError> {
        let task = self.store.get(id).await?;
        if !matches!(task.status, TaskStatus::Retrying | TaskStatus::NeedsReview) {
            return Err(ServiceError::Conflict(format!(
                "cannot continue task in status {}",
                task.status
            )));
        }
        let mut patch = TaskPatch::default();
        if let Some(prompt) = new_prompt {
            validate_prompt(prompt)?;
            patch.prompt = Some(prompt.to_string());
        }
        self.store
            .update_status(id, TaskStatus::Queued, patch)
            .await?;
        info!(id, "task re-queued");
        Ok(())
    }

    /// Abort a task. No-op when already `aborted`; `Conflict` from the other
    /// terminal states. A running engine observes the new status at its next
    /// cancellation checkpoint.
    #[instrument(skip_all, fields(id))]
    pub async fn abort_task(&self, id: &str) -> Result<(), ServiceError> {
        self.store
            .update_status(id, TaskStatus::Aborted, TaskPatch::default())
            .await?;
        info!(id, "task aborted");
        Ok(())
    }

    /// Log entries for a task in insertion order, optionally after a cursor.
    pub async fn tail_logs(
        &self,
        id: &str,
        from: Option<DateTime<Utc>>,
    ) -> Result<Vec<TaskLogEntry>, ServiceError> {
        // Surface NotFound for unknown tasks rather than an empty stream.
        self.store.get(id).await?;
        Ok(self.store.logs_since(id, from).await?)
    }
}

fn validate_repo(repo: &str) -> Result<(), ServiceError> {
    if repo.trim().is_empty() {
        return Err(ServiceError::Validation("repo cannot be empty".to_string()));
    }
    if !repo.contains('/') {
        return Err(ServiceError::Validation(
            "repo must be 'owner/repo' or a full git URL".to_string(),
        ));
    }
    Ok(())
}

fn validate_prompt(prompt: &str) -> Result<(), ServiceError> {
    if prompt.trim().is_empty() {
        return Err(ServiceError::Validation(
            "prompt cannot be empty".to_string(),
        ));
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(ServiceError::Validation(format!(
            "prompt too long (max {MAX_PROMPT_CHARS} characters)"
        )));
    }
    Ok(())
}
