//! Task model and status state machine.
//!
//! These types define the stable contracts between the store, the dispatcher
//! and the execution engine. The transition table is encoded as data so that
//! every status mutation is validated in one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Retrying,
    NeedsReview,
    Success,
    Aborted,
    Error,
}

/// Allowed outgoing transitions per non-terminal state.
///
/// Terminal states (`success`, `aborted`, `error`) have no entry: nothing
/// leaves them, except the idempotent `aborted -> aborted` no-op handled in
/// [`TaskStatus::can_transition_to`].
const TRANSITIONS: &[(TaskStatus, &[TaskStatus])] = &[
    (
        TaskStatus::Queued,
        &[TaskStatus::Running, TaskStatus::Aborted],
    ),
    (
        TaskStatus::Running,
        &[
            TaskStatus::Retrying,
            TaskStatus::NeedsReview,
            TaskStatus::Success,
            TaskStatus::Error,
            TaskStatus::Aborted,
        ],
    ),
    (
        TaskStatus::Retrying,
        &[
            TaskStatus::Running,
            TaskStatus::Queued,
            TaskStatus::NeedsReview,
            TaskStatus::Error,
            TaskStatus::Aborted,
        ],
    ),
    (
        TaskStatus::NeedsReview,
        &[TaskStatus::Queued, TaskStatus::Aborted],
    ),
];

impl TaskStatus {
    pub const ALL: &'static [TaskStatus] = &[
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Retrying,
        TaskStatus::NeedsReview,
        TaskStatus::Success,
        TaskStatus::Aborted,
        TaskStatus::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::NeedsReview => "needs_review",
            TaskStatus::Success => "success",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<TaskStatus> {
        Self::ALL.iter().copied().find(|s| s.as_str() == raw)
    }

    /// True if the task is finished and holds no further engine work.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Aborted | TaskStatus::Error
        )
    }

    /// Consult the transition table.
    ///
    /// `aborted -> aborted` is permitted as an idempotent no-op; every other
    /// transition out of a terminal state is rejected.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self == TaskStatus::Aborted && next == TaskStatus::Aborted {
            return true;
        }
        TRANSITIONS
            .iter()
            .find(|(from, _)| *from == self)
            .is_some_and(|(_, allowed)| allowed.contains(&next))
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work carrying a prompt and a target repository through the
/// generate / push / CI retry loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Lexicographically sortable, time-ordered identifier. Immutable.
    pub id: String,
    /// Source repository locator (URL or `owner/repo` shorthand).
    pub repo: String,
    /// Feature branch derived from `id`.
    pub branch: String,
    /// Opaque generator session handle, retained across iterations.
    pub thread_id: String,
    /// Current prompt text; overwritten with the feedback-composed prompt on
    /// each retry.
    pub prompt: String,
    pub status: TaskStatus,
    /// Last observed CI run identifier.
    pub ci_run_id: Option<i64>,
    /// Generator invocations beyond the first.
    pub attempts: u32,
    /// Human-readable final message on terminal and suspended states.
    pub summary: String,
    pub branch_url: Option<String>,
    pub pr_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Severity of a task log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<LogLevel> {
        match raw {
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Append-only log entry attached to a task. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub task_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Non-status field mutations applied through the store.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub prompt: Option<String>,
    pub ci_run_id: Option<i64>,
    pub attempts: Option<u32>,
    pub summary: Option<String>,
    pub branch_url: Option<String>,
    pub pr_url: Option<String>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.prompt.is_none()
            && self.ci_run_id.is_none()
            && self.attempts.is_none()
            && self.summary.is_none()
            && self.branch_url.is_none()
            && self.pr_url.is_none()
    }
}

/// Filter for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub repo: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Enumerates the full transition table from the design: every pair of
    /// states is checked against the expected verdict.
    #[test]
    fn transition_table_is_total() {
        use TaskStatus::*;
        let allowed: &[(TaskStatus, TaskStatus)] = &[
            (Queued, Running),
            (Queued, Aborted),
            (Running, Retrying),
            (Running, NeedsReview),
            (Running, Success),
            (Running, Error),
            (Running, Aborted),
            (Retrying, Running),
            (Retrying, Queued),
            (Retrying, NeedsReview),
            (Retrying, Error),
            (Retrying, Aborted),
            (NeedsReview, Queued),
            (NeedsReview, Aborted),
            (Aborted, Aborted),
        ];
        for &from in TaskStatus::ALL {
            for &to in TaskStatus::ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{from} -> {to} should be {expected}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exit() {
        use TaskStatus::*;
        for &from in &[Success, Error] {
            for &to in TaskStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} allowed");
            }
        }
        // Aborted permits only the idempotent no-op.
        for &to in TaskStatus::ALL {
            assert_eq!(Aborted.can_transition_to(to), to == Aborted);
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for &status in TaskStatus::ALL {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::NeedsReview).expect("serialize");
        assert_eq!(json, "\"needs_review\"");
    }
}
