//! Generator executor: runs the external code-generation tool in a working
//! tree.
//!
//! The [`GeneratorExecutor`] trait decouples the engine from the concrete
//! tool. Tests use scripted executors that return predetermined outcomes
//! without spawning processes.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command;

/// Bytes of generator output retained for diagnostics.
const GENERATOR_OUTPUT_LIMIT: usize = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("generator is not installed: {0}")]
    NotInstalled(String),
    #[error("generator failed: {0}")]
    Failed(String),
    #[error("generator timed out after {0:?}")]
    Timeout(Duration),
    #[error("generator cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result of one generator invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorOutcome {
    /// Whether the tool itself reported success (exit status).
    pub success: bool,
    /// Paths changed in the working tree, as observed via VCS status.
    pub changed_files: Vec<String>,
    /// Bounded diagnostic output for logging and summaries.
    pub diagnostic: String,
}

/// Abstraction over code-generation backends.
#[async_trait]
pub trait GeneratorExecutor: Send + Sync {
    /// Cheap availability probe, used at startup.
    async fn available(&self) -> Result<(), GeneratorError>;

    /// Run the tool with `prompt` on stdin inside `dir`.
    async fn run(
        &self,
        dir: &Path,
        prompt: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<GeneratorOutcome, GeneratorError>;
}

/// Generator that spawns a configurable command line (default `amp`) and
/// pipes the prompt to its stdin.
#[derive(Debug, Clone)]
pub struct CliGenerator {
    command: Vec<String>,
}

impl CliGenerator {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("amp")
    }
}

#[async_trait]
impl GeneratorExecutor for CliGenerator {
    async fn available(&self) -> Result<(), GeneratorError> {
        let mut cmd = Command::new(self.program());
        cmd.args(self.command.iter().skip(1)).arg("--version");
        let output = run_command(
            cmd,
            None,
            Duration::from_secs(10),
            4096,
            &CancellationToken::new(),
        )
        .await
        .map_err(|err| GeneratorError::NotInstalled(err.to_string()))?;
        if !output.status.success() {
            return Err(GeneratorError::NotInstalled(format!(
                "{} --version exited with {:?}",
                self.program(),
                output.status.code()
            )));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
    async fn run(
        &self,
        dir: &Path,
        prompt: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<GeneratorOutcome, GeneratorError> {
        info!(workdir = %dir.display(), "starting generator");

        let mut cmd = Command::new(self.program());
        cmd.args(self.command.iter().skip(1)).current_dir(dir);

        let output = run_command(
            cmd,
            Some(prompt.as_bytes()),
            timeout,
            GENERATOR_OUTPUT_LIMIT,
            cancel,
        )
        .await?;

        if output.cancelled {
            return Err(GeneratorError::Cancelled);
        }
        if output.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "generator timed out");
            return Err(GeneratorError::Timeout(timeout));
        }

        let success = output.status.success();
        let diagnostic = output.merged();
        if !success {
            warn!(exit_code = ?output.status.code(), "generator exited non-zero");
        }

        let changed_files = detect_changed_files(dir, cancel).await?;
        debug!(
            success,
            changed = changed_files.len(),
            "generator finished"
        );

        Ok(GeneratorOutcome {
            success,
            changed_files,
            diagnostic,
        })
    }
}

/// Observe working-tree changes via porcelain status. The engine combines
/// this with the tool's self-report to decide whether anything real happened.
async fn detect_changed_files(
    dir: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<String>, GeneratorError> {
    use crate::io::git::{GitCli, VcsExecutor};

    let entries = GitCli
        .status(dir, cancel, Duration::from_secs(30))
        .await
        .map_err(|err| GeneratorError::Other(anyhow::anyhow!(err)))?;
    Ok(entries.into_iter().map(|e| e.path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn available_fails_for_missing_binary() {
        let generator = CliGenerator::new(vec!["definitely-not-a-real-tool-xyz".to_string()]);
        let err = generator.available().await.unwrap_err();
        assert!(matches!(err, GeneratorError::NotInstalled(_)));
    }

    #[tokio::test]
    async fn run_reports_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        // The dir must be a git repo only when the command succeeds; a timeout
        // short-circuits before change detection.
        let generator = CliGenerator::new(vec!["sleep".to_string(), "30".to_string()]);
        let err = generator
            .run(
                temp.path(),
                "ignored",
                &CancellationToken::new(),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GeneratorError::Timeout(_)));
    }
}
