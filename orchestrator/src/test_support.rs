//! Test-only helpers: task fixtures and scripted adapter fakes.
//!
//! The scripted fakes return predetermined outcomes without spawning
//! processes or touching the network, so lifecycle tests can drive the
//! engine and dispatcher deterministically.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::core::naming::{branch_for, thread_for};
use crate::core::task::{Task, TaskStatus};
use crate::io::ci::{CiError, CiObservation, CiProvider};
use crate::io::generator::{GeneratorError, GeneratorExecutor, GeneratorOutcome};
use crate::io::git::{StatusEntry, VcsError, VcsExecutor};

/// Create a deterministic queued task with derived branch and thread names.
pub fn task_fixture(id: &str, repo: &str) -> Task {
    let now = Utc::now();
    Task {
        id: id.to_string(),
        repo: repo.to_string(),
        branch: branch_for(id),
        thread_id: thread_for(id),
        prompt: "fix bug".to_string(),
        status: TaskStatus::Queued,
        ci_run_id: None,
        attempts: 0,
        summary: String::new(),
        branch_url: None,
        pr_url: None,
        created_at: now,
        updated_at: now,
    }
}

/// Scripted version-control executor. Records operations for assertions.
pub struct ScriptedVcs {
    pub fail_clone: Option<String>,
    pub fail_push: Option<String>,
    pub remote: String,
    pub head: String,
    pub calls: Mutex<Vec<String>>,
}

impl Default for ScriptedVcs {
    fn default() -> Self {
        Self {
            fail_clone: None,
            fail_push: None,
            remote: "https://host/x/y".to_string(),
            head: "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef".to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedVcs {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, op: impl Into<String>) {
        self.calls.lock().expect("calls lock").push(op.into());
    }

    fn check_cancel(&self, cancel: &CancellationToken) -> Result<(), VcsError> {
        if cancel.is_cancelled() {
            return Err(VcsError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl VcsExecutor for ScriptedVcs {
    async fn clone_repo(
        &self,
        _url: &str,
        _dest: &Path,
        cancel: &CancellationToken,
        _timeout: Duration,
    ) -> Result<(), VcsError> {
        self.check_cancel(cancel)?;
        self.record("clone");
        match &self.fail_clone {
            Some(message) => Err(VcsError::CloneFailed(message.clone())),
            None => Ok(()),
        }
    }

    async fn create_branch(
        &self,
        _dir: &Path,
        name: &str,
        cancel: &CancellationToken,
        _timeout: Duration,
    ) -> Result<(), VcsError> {
        self.check_cancel(cancel)?;
        self.record(format!("branch {name}"));
        Ok(())
    }

    async fn commit_all(
        &self,
        _dir: &Path,
        _message: &str,
        cancel: &CancellationToken,
        _timeout: Duration,
    ) -> Result<(), VcsError> {
        self.check_cancel(cancel)?;
        self.record("commit");
        Ok(())
    }

    async fn push(
        &self,
        _dir: &Path,
        branch: &str,
        cancel: &CancellationToken,
        _timeout: Duration,
    ) -> Result<(), VcsError> {
        self.check_cancel(cancel)?;
        self.record(format!("push {branch}"));
        match &self.fail_push {
            Some(message) => Err(VcsError::PushFailed(message.clone())),
            None => Ok(()),
        }
    }

    async fn status(
        &self,
        _dir: &Path,
        cancel: &CancellationToken,
        _timeout: Duration,
    ) -> Result<Vec<StatusEntry>, VcsError> {
        self.check_cancel(cancel)?;
        Ok(Vec::new())
    }

    async fn remote_url(
        &self,
        _dir: &Path,
        cancel: &CancellationToken,
        _timeout: Duration,
    ) -> Result<String, VcsError> {
        self.check_cancel(cancel)?;
        Ok(self.remote.clone())
    }

    async fn head_commit(
        &self,
        _dir: &Path,
        cancel: &CancellationToken,
        _timeout: Duration,
    ) -> Result<String, VcsError> {
        self.check_cancel(cancel)?;
        Ok(self.head.clone())
    }

    async fn cleanup(&self, _dir: &Path) -> Result<(), VcsError> {
        self.record("cleanup");
        Ok(())
    }
}

/// One scripted generator invocation.
pub struct ScriptedGen {
    /// Simulated execution time; the run observes cancellation while waiting.
    pub delay: Duration,
    pub result: ScriptedGenResult,
}

pub enum ScriptedGenResult {
    Outcome(GeneratorOutcome),
    Timeout,
    Failed(String),
}

/// Build a successful outcome that changed the given files.
pub fn gen_change(files: &[&str]) -> ScriptedGen {
    ScriptedGen {
        delay: Duration::ZERO,
        result: ScriptedGenResult::Outcome(GeneratorOutcome {
            success: true,
            changed_files: files.iter().map(|f| f.to_string()).collect(),
            diagnostic: "ok".to_string(),
        }),
    }
}

/// Build an outcome that changed nothing.
pub fn gen_no_change(success: bool) -> ScriptedGen {
    ScriptedGen {
        delay: Duration::ZERO,
        result: ScriptedGenResult::Outcome(GeneratorOutcome {
            success,
            changed_files: Vec::new(),
            diagnostic: "nothing to do".to_string(),
        }),
    }
}

/// Scripted generator executor consuming a queue of responses.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<ScriptedGen>>,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<ScriptedGen>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().expect("script lock").len()
    }
}

#[async_trait]
impl GeneratorExecutor for ScriptedGenerator {
    async fn available(&self) -> Result<(), GeneratorError> {
        Ok(())
    }

    async fn run(
        &self,
        _dir: &Path,
        _prompt: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<GeneratorOutcome, GeneratorError> {
        let scripted = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .ok_or_else(|| GeneratorError::Failed("generator script exhausted".to_string()))?;

        if !scripted.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(GeneratorError::Cancelled),
                _ = tokio::time::sleep(scripted.delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(GeneratorError::Cancelled);
        }

        match scripted.result {
            ScriptedGenResult::Outcome(outcome) => Ok(outcome),
            ScriptedGenResult::Timeout => Err(GeneratorError::Timeout(timeout)),
            ScriptedGenResult::Failed(message) => Err(GeneratorError::Failed(message)),
        }
    }
}

/// Scripted CI provider consuming a queue of observations.
pub struct ScriptedCi {
    observations: Mutex<VecDeque<CiObservation>>,
    pub failure_logs: Vec<u8>,
    /// `Some(url)` opens pull requests; `None` reports `Unsupported`.
    pub pr_url: Option<String>,
    pr_calls: Mutex<u32>,
}

impl ScriptedCi {
    pub fn new(observations: Vec<CiObservation>) -> Self {
        Self {
            observations: Mutex::new(observations.into()),
            failure_logs: b"FAIL test_login".to_vec(),
            pr_url: None,
            pr_calls: Mutex::new(0),
        }
    }

    pub fn with_failure_logs(mut self, logs: &[u8]) -> Self {
        self.failure_logs = logs.to_vec();
        self
    }

    pub fn with_pr_url(mut self, url: &str) -> Self {
        self.pr_url = Some(url.to_string());
        self
    }

    pub fn pr_calls(&self) -> u32 {
        *self.pr_calls.lock().expect("pr lock")
    }
}

#[async_trait]
impl CiProvider for ScriptedCi {
    async fn observe(
        &self,
        _repo: &str,
        _branch: &str,
        _commit: &str,
        cancel: &CancellationToken,
        _deadline: Duration,
    ) -> Result<CiObservation, CiError> {
        if cancel.is_cancelled() {
            return Err(CiError::Cancelled);
        }
        self.observations
            .lock()
            .expect("observations lock")
            .pop_front()
            .ok_or_else(|| CiError::Failed("ci script exhausted".to_string()))
    }

    async fn fetch_failure_logs(&self, _repo: &str, _run_id: i64) -> Result<Vec<u8>, CiError> {
        Ok(self.failure_logs.clone())
    }

    async fn open_pull_request(
        &self,
        _repo: &str,
        _base: &str,
        _head: &str,
        _title: &str,
        _body: &str,
    ) -> Result<String, CiError> {
        *self.pr_calls.lock().expect("pr lock") += 1;
        match &self.pr_url {
            Some(url) => Ok(url.clone()),
            None => Err(CiError::Unsupported),
        }
    }
}
