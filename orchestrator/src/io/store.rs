//! SQLite-backed task store.
//!
//! The single shared mutable state of the orchestrator. All task and log
//! mutations go through this type; a one-connection pool serializes writers,
//! and `claim_next` performs its select-and-flip as one statement so
//! concurrent dispatcher polls can never hand out the same task twice.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument};

use crate::core::task::{LogLevel, Task, TaskFilter, TaskLogEntry, TaskPatch, TaskStatus};

/// Hard upper bound on list page size.
const MAX_LIST_LIMIT: i64 = 100;
const DEFAULT_LIST_LIMIT: i64 = 50;

/// Default busy timeout for store operations.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
  id         TEXT PRIMARY KEY,
  repo       TEXT NOT NULL,
  branch     TEXT NOT NULL,
  thread_id  TEXT NOT NULL,
  prompt     TEXT NOT NULL,
  status     TEXT NOT NULL,
  ci_run_id  INTEGER,
  attempts   INTEGER NOT NULL DEFAULT 0,
  summary    TEXT NOT NULL DEFAULT '',
  branch_url TEXT,
  pr_url     TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS task_logs (
  id        INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id   TEXT NOT NULL,
  level     TEXT NOT NULL,
  message   TEXT NOT NULL,
  timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_logs_task_ts ON task_logs(task_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_tasks_status_created ON tasks(status, created_at);
"#;

const TASK_COLUMNS: &str = "id, repo, branch, thread_id, prompt, status, ci_run_id, attempts, \
                            summary, branch_url, pr_url, created_at, updated_at";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task not found")]
    NotFound,
    #[error("task already exists: {0}")]
    Duplicate(String),
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Durable task storage with serialized-writer semantics.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (and migrate) the store at `path`, creating the file if missing.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| StoreError::Corrupt(format!("create store dir: {err}")))?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);
        let store = Self::with_options(options).await?;
        info!(path = %path.display(), "task store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Db)?
            .busy_timeout(BUSY_TIMEOUT);
        Self::with_options(options).await
    }

    async fn with_options(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        // SQLite behaves best with a single writer connection; this also
        // keeps an in-memory database alive across calls.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(MIGRATION).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert a new task. Fails with [`StoreError::Duplicate`] when the id is
    /// already present.
    #[instrument(skip_all, fields(id = %task.id))]
    pub async fn create(&self, task: &Task) -> Result<(), StoreError> {
        let sql = format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?)");
        let result = sqlx::query(&sql)
            .bind(&task.id)
            .bind(&task.repo)
            .bind(&task.branch)
            .bind(&task.thread_id)
            .bind(&task.prompt)
            .bind(task.status.as_str())
            .bind(task.ci_run_id)
            .bind(task.attempts as i64)
            .bind(&task.summary)
            .bind(&task.branch_url)
            .bind(&task.pr_url)
            .bind(fmt_ts(task.created_at))
            .bind(fmt_ts(task.updated_at))
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => {
                debug!("task created");
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(task.id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Task, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        task_from_row(&row)
    }

    /// List tasks matching `filter`, newest first, with the matching total.
    pub async fn list(&self, filter: &TaskFilter) -> Result<(Vec<Task>, i64), StoreError> {
        let mut clauses: Vec<&str> = Vec::new();
        if filter.status.is_some() {
            clauses.push("status = ?");
        }
        if filter.repo.is_some() {
            clauses.push("repo = ?");
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let limit = filter
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(0, MAX_LIST_LIMIT);
        let offset = filter.offset.unwrap_or(0).max(0);

        let list_sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks{where_sql} \
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        );
        let mut query = sqlx::query(&list_sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(repo) = &filter.repo {
            query = query.bind(repo);
        }
        let rows = query.bind(limit).bind(offset).fetch_all(&self.pool).await?;
        let tasks = rows
            .iter()
            .map(task_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let count_sql = format!("SELECT COUNT(*) AS n FROM tasks{where_sql}");
        let mut count_query = sqlx::query(&count_sql);
        if let Some(status) = filter.status {
            count_query = count_query.bind(status.as_str());
        }
        if let Some(repo) = &filter.repo {
            count_query = count_query.bind(repo);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.try_get("n")?;

        Ok((tasks, total))
    }

    /// Atomically claim the oldest queued task, flipping it to `running`.
    ///
    /// The select and the update are a single statement, so each queued task
    /// is handed to at most one caller.
    pub async fn claim_next(&self) -> Result<Option<Task>, StoreError> {
        let sql = format!(
            "UPDATE tasks SET status = 'running', updated_at = ? \
             WHERE id = (SELECT id FROM tasks WHERE status = 'queued' \
                         ORDER BY created_at ASC, id ASC LIMIT 1) \
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(fmt_ts(Utc::now()))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Transition a task's status, validating against the transition table,
    /// and apply `patch` in the same write. Returns the updated task.
    ///
    /// `aborted -> aborted` is an accepted no-op.
    #[instrument(skip_all, fields(id, to = %new_status))]
    pub async fn update_status(
        &self,
        id: &str,
        new_status: TaskStatus,
        patch: TaskPatch,
    ) -> Result<Task, StoreError> {
        let current = self.get(id).await?;
        if !current.status.can_transition_to(new_status) {
            return Err(StoreError::InvalidTransition {
                from: current.status,
                to: new_status,
            });
        }
        if current.status == TaskStatus::Aborted && new_status == TaskStatus::Aborted {
            return Ok(current);
        }
        debug!(from = %current.status, "status transition");
        self.write_back(current, Some(new_status), patch).await
    }

    /// Apply non-status field mutations, stamping `updated_at`.
    pub async fn update_fields(&self, id: &str, patch: TaskPatch) -> Result<Task, StoreError> {
        let current = self.get(id).await?;
        self.write_back(current, None, patch).await
    }

    async fn write_back(
        &self,
        mut task: Task,
        new_status: Option<TaskStatus>,
        patch: TaskPatch,
    ) -> Result<Task, StoreError> {
        if let Some(status) = new_status {
            task.status = status;
        }
        if let Some(prompt) = patch.prompt {
            task.prompt = prompt;
        }
        if let Some(ci_run_id) = patch.ci_run_id {
            task.ci_run_id = Some(ci_run_id);
        }
        if let Some(attempts) = patch.attempts {
            task.attempts = attempts;
        }
        if let Some(summary) = patch.summary {
            task.summary = summary;
        }
        if let Some(branch_url) = patch.branch_url {
            task.branch_url = Some(branch_url);
        }
        if let Some(pr_url) = patch.pr_url {
            task.pr_url = Some(pr_url);
        }
        // updated_at never moves backwards, even under clock adjustment.
        task.updated_at = Utc::now().max(task.updated_at);

        let sql = "UPDATE tasks SET prompt = ?, status = ?, ci_run_id = ?, attempts = ?, \
                   summary = ?, branch_url = ?, pr_url = ?, updated_at = ? WHERE id = ?";
        sqlx::query(sql)
            .bind(&task.prompt)
            .bind(task.status.as_str())
            .bind(task.ci_run_id)
            .bind(task.attempts as i64)
            .bind(&task.summary)
            .bind(&task.branch_url)
            .bind(&task.pr_url)
            .bind(fmt_ts(task.updated_at))
            .bind(&task.id)
            .execute(&self.pool)
            .await?;
        Ok(task)
    }

    /// Append a log entry. Entries are never mutated after insert.
    pub async fn append_log(&self, entry: &TaskLogEntry) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO task_logs (task_id, level, message, timestamp) VALUES (?,?,?,?)")
            .bind(&entry.task_id)
            .bind(entry.level.as_str())
            .bind(&entry.message)
            .bind(fmt_ts(entry.timestamp))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Log entries for a task in insertion order, optionally only those after
    /// `after`.
    pub async fn logs_since(
        &self,
        task_id: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<TaskLogEntry>, StoreError> {
        let mut sql = String::from(
            "SELECT task_id, level, message, timestamp FROM task_logs WHERE task_id = ?",
        );
        if after.is_some() {
            sql.push_str(" AND timestamp > ?");
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC");

        let mut query = sqlx::query(&sql).bind(task_id);
        if let Some(after) = after {
            query = query.bind(fmt_ts(after));
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(log_from_row).collect()
    }

    /// Recovery sweep: atomically re-queue `running` tasks whose last update
    /// is older than `threshold`, returning them.
    ///
    /// `running -> queued` is deliberately absent from the public transition
    /// table; this primitive is the single sanctioned path for it, used by
    /// the dispatcher at startup and shutdown.
    #[instrument(skip_all)]
    pub async fn requeue_stuck(&self, threshold: Duration) -> Result<Vec<Task>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold)
                .map_err(|err| StoreError::Corrupt(format!("threshold out of range: {err}")))?;
        let sql = format!(
            "UPDATE tasks SET status = 'queued', updated_at = ? \
             WHERE status = 'running' AND updated_at < ? \
             RETURNING {TASK_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(fmt_ts(Utc::now()))
            .bind(fmt_ts(cutoff))
            .fetch_all(&self.pool)
            .await?;
        let tasks: Vec<Task> = rows
            .iter()
            .map(task_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        if !tasks.is_empty() {
            info!(count = tasks.len(), "re-queued stuck running tasks");
        }
        Ok(tasks)
    }
}

/// RFC3339 UTC with fixed microsecond precision, so TEXT ordering matches
/// chronological ordering.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("bad timestamp {raw:?}: {err}")))
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown status {status_raw:?}")))?;
    let created_raw: String = row.try_get("created_at")?;
    let updated_raw: String = row.try_get("updated_at")?;
    let attempts: i64 = row.try_get("attempts")?;
    Ok(Task {
        id: row.try_get("id")?,
        repo: row.try_get("repo")?,
        branch: row.try_get("branch")?,
        thread_id: row.try_get("thread_id")?,
        prompt: row.try_get("prompt")?,
        status,
        ci_run_id: row.try_get("ci_run_id")?,
        attempts: attempts.max(0) as u32,
        summary: row.try_get("summary")?,
        branch_url: row.try_get("branch_url")?,
        pr_url: row.try_get("pr_url")?,
        created_at: parse_ts(&created_raw)?,
        updated_at: parse_ts(&updated_raw)?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<TaskLogEntry, StoreError> {
    let level_raw: String = row.try_get("level")?;
    let level = LogLevel::parse(&level_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown log level {level_raw:?}")))?;
    let ts_raw: String = row.try_get("timestamp")?;
    Ok(TaskLogEntry {
        task_id: row.try_get("task_id")?,
        level,
        message: row.try_get("message")?,
        timestamp: parse_ts(&ts_raw)?,
    })
}
