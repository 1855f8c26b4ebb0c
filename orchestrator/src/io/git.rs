//! Version-control executor: clone, branch, commit, push.
//!
//! The engine drives git exclusively through the [`VcsExecutor`] trait so
//! tests can script repository behavior without touching a real remote. The
//! production implementation is a small, explicit wrapper around `git`
//! subprocess calls.

use std::path::Path;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::core::naming::{validate_branch_name, BranchNameError};
use crate::io::process::{run_command, CommandOutput};

/// Bytes of subprocess output retained for diagnostics.
const GIT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Commit identity used for generated commits.
const COMMIT_IDENTITY: &[(&str, &str)] = &[
    ("GIT_AUTHOR_NAME", "Orchestrator"),
    ("GIT_AUTHOR_EMAIL", "orchestrator@localhost"),
    ("GIT_COMMITTER_NAME", "Orchestrator"),
    ("GIT_COMMITTER_EMAIL", "orchestrator@localhost"),
];

#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("clone failed: {0}")]
    CloneFailed(String),
    #[error("invalid branch name: {0}")]
    InvalidName(#[from] BranchNameError),
    #[error("branch already exists: {0}")]
    BranchExists(String),
    #[error("nothing to commit")]
    NothingToCommit,
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error("push failed: {0}")]
    PushFailed(String),
    #[error("git operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("git operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path of the changed file.
    pub path: String,
}

/// Abstraction over repository operations.
///
/// Every call accepts a cancellation token and a timeout; implementations
/// must return promptly once either fires.
#[async_trait]
pub trait VcsExecutor: Send + Sync {
    async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), VcsError>;

    async fn create_branch(
        &self,
        dir: &Path,
        name: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), VcsError>;

    /// Stage all changes and commit them. [`VcsError::NothingToCommit`] when
    /// the working tree is clean.
    async fn commit_all(
        &self,
        dir: &Path,
        message: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), VcsError>;

    /// Push `branch` upstream. Tolerates a pre-existing remote branch.
    async fn push(
        &self,
        dir: &Path,
        branch: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), VcsError>;

    /// Changed paths (including untracked) in porcelain order.
    async fn status(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Vec<StatusEntry>, VcsError>;

    /// Origin URL normalized to web form.
    async fn remote_url(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<String, VcsError>;

    async fn head_commit(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<String, VcsError>;

    /// Remove a working directory. Missing directories are not an error.
    async fn cleanup(&self, dir: &Path) -> Result<(), VcsError>;
}

/// `git` subprocess implementation.
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    async fn run(
        &self,
        dir: Option<&Path>,
        args: &[&str],
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<CommandOutput, VcsError> {
        let mut cmd = Command::new("git");
        cmd.args(args).env("GIT_TERMINAL_PROMPT", "0");
        for (key, value) in COMMIT_IDENTITY {
            cmd.env(key, value);
        }
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        let output = run_command(cmd, None, timeout, GIT_OUTPUT_LIMIT, cancel)
            .await
            .map_err(VcsError::Other)?;
        if output.cancelled {
            return Err(VcsError::Cancelled);
        }
        if output.timed_out {
            return Err(VcsError::Timeout(timeout));
        }
        Ok(output)
    }

    async fn run_checked(
        &self,
        dir: Option<&Path>,
        args: &[&str],
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<CommandOutput, VcsError> {
        let output = self.run(dir, args, cancel, timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VcsError::Other(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl VcsExecutor for GitCli {
    #[instrument(skip_all, fields(url))]
    async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), VcsError> {
        debug!(url, dest = %dest.display(), "cloning repository");
        let dest_str = dest.to_string_lossy();
        let output = self
            .run(None, &["clone", url, &dest_str], cancel, timeout)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(url, "clone failed");
            return Err(VcsError::CloneFailed(stderr.trim().to_string()));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(name))]
    async fn create_branch(
        &self,
        dir: &Path,
        name: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), VcsError> {
        validate_branch_name(name)?;
        debug!(name, "creating and checking out branch");
        let output = self
            .run(Some(dir), &["checkout", "-b", name], cancel, timeout)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("already exists") {
                return Err(VcsError::BranchExists(name.to_string()));
            }
            return Err(VcsError::Other(anyhow!(
                "git checkout -b {name} failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    #[instrument(skip_all)]
    async fn commit_all(
        &self,
        dir: &Path,
        message: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), VcsError> {
        self.run_checked(Some(dir), &["add", "-A"], cancel, timeout)
            .await?;

        let staged = self
            .run_checked(
                Some(dir),
                &["diff", "--cached", "--name-only"],
                cancel,
                timeout,
            )
            .await?;
        if String::from_utf8_lossy(&staged.stdout).trim().is_empty() {
            debug!("no staged changes");
            return Err(VcsError::NothingToCommit);
        }

        let output = self
            .run(Some(dir), &["commit", "-m", message], cancel, timeout)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VcsError::CommitFailed(stderr.trim().to_string()));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(branch))]
    async fn push(
        &self,
        dir: &Path,
        branch: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), VcsError> {
        let output = self
            .run(Some(dir), &["push", "-u", "origin", branch], cancel, timeout)
            .await?;
        if output.status.success() {
            return Ok(());
        }
        // A previous iteration (or a crashed run) may have left the remote
        // branch behind; re-push over it rather than failing the task.
        warn!(branch, "push rejected, retrying with --force-with-lease");
        let retry = self
            .run(
                Some(dir),
                &["push", "-u", "--force-with-lease", "origin", branch],
                cancel,
                timeout,
            )
            .await?;
        if !retry.status.success() {
            let stderr = String::from_utf8_lossy(&retry.stderr);
            return Err(VcsError::PushFailed(stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn status(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Vec<StatusEntry>, VcsError> {
        let output = self
            .run_checked(
                Some(dir),
                &["status", "--porcelain=v1", "-uall"],
                cancel,
                timeout,
            )
            .await?;
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        let mut entries = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line).map_err(VcsError::Other)?);
        }
        Ok(entries)
    }

    async fn remote_url(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<String, VcsError> {
        let output = self
            .run_checked(
                Some(dir),
                &["remote", "get-url", "origin"],
                cancel,
                timeout,
            )
            .await?;
        let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(normalize_remote_url(&raw))
    }

    async fn head_commit(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<String, VcsError> {
        let output = self
            .run_checked(Some(dir), &["rev-parse", "HEAD"], cancel, timeout)
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn cleanup(&self, dir: &Path) -> Result<(), VcsError> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(VcsError::Other(
                anyhow::Error::new(err).context(format!("remove {}", dir.display())),
            )),
        }
    }
}

/// Split one `--porcelain=v1` line into its XY code and path.
///
/// The format is two code characters, a space, then the path; renames list
/// both sides as `old -> new` and only the destination matters here.
fn parse_status_line(line: &str) -> anyhow::Result<StatusEntry> {
    let mut chars = line.chars();
    let code: String = chars.by_ref().take(2).collect();
    if code.chars().count() < 2 || chars.next() != Some(' ') {
        return Err(anyhow!("malformed porcelain status line: {line:?}"));
    }
    let rest = chars.as_str().trim();
    if rest.is_empty() {
        return Err(anyhow!("porcelain status line has no path: {line:?}"));
    }
    let path = match rest.rsplit_once(" -> ") {
        Some((_, destination)) => destination,
        None => rest,
    };
    Ok(StatusEntry {
        code,
        path: path.to_string(),
    })
}

/// Normalize a remote URL to its web form: scp-style ssh URLs become https
/// and a trailing `.git` is stripped.
pub fn normalize_remote_url(url: &str) -> String {
    let url = url.trim();
    if let Some(rest) = url.strip_prefix("git@") {
        if let Some((host, path)) = rest.split_once(':') {
            let path = path.trim_end_matches(".git");
            return format!("https://{host}/{path}");
        }
    }
    url.trim_end_matches(".git").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_codes_and_paths() {
        let cases = [
            ("?? notes.md", "??", "notes.md"),
            (" M src/main.rs", " M", "src/main.rs"),
            ("A  src/new.rs", "A ", "src/new.rs"),
            (" D gone.rs", " D", "gone.rs"),
        ];
        for (line, code, path) in cases {
            let entry = parse_status_line(line).expect(line);
            assert_eq!(entry.code, code, "code for {line:?}");
            assert_eq!(entry.path, path, "path for {line:?}");
        }
    }

    #[test]
    fn status_line_rename_keeps_destination() {
        let entry = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(entry.code, "R ");
        assert_eq!(entry.path, "new.txt");
    }

    #[test]
    fn status_line_rejects_garbage() {
        assert!(parse_status_line("M").is_err());
        assert!(parse_status_line("Mx").is_err());
        assert!(parse_status_line("?? ").is_err());
    }

    #[test]
    fn normalizes_ssh_urls_to_https() {
        assert_eq!(
            normalize_remote_url("git@github.com:acme/widget.git"),
            "https://github.com/acme/widget"
        );
        assert_eq!(
            normalize_remote_url("git@gitlab.com:acme/widget.git"),
            "https://gitlab.com/acme/widget"
        );
    }

    #[test]
    fn strips_git_suffix_from_https_urls() {
        assert_eq!(
            normalize_remote_url("https://github.com/acme/widget.git"),
            "https://github.com/acme/widget"
        );
        assert_eq!(
            normalize_remote_url("https://github.com/acme/widget"),
            "https://github.com/acme/widget"
        );
    }

    #[tokio::test]
    async fn create_branch_rejects_invalid_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = GitCli;
        let err = git
            .create_branch(
                temp.path(),
                "has space",
                &CancellationToken::new(),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::InvalidName(_)));
    }

    #[tokio::test]
    async fn commits_and_reports_clean_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        let cancel = CancellationToken::new();
        let timeout = Duration::from_secs(10);
        let git = GitCli;

        git.run_checked(Some(dir), &["init", "-q"], &cancel, timeout)
            .await
            .expect("git init");

        // Clean tree: nothing to commit.
        let err = git
            .commit_all(dir, "empty", &cancel, timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::NothingToCommit));

        tokio::fs::write(dir.join("note.txt"), "hello")
            .await
            .expect("write");
        git.commit_all(dir, "add note", &cancel, timeout)
            .await
            .expect("commit");

        let head = git.head_commit(dir, &cancel, timeout).await.expect("head");
        assert_eq!(head.len(), 40);

        let entries = git.status(dir, &cancel, timeout).await.expect("status");
        assert!(entries.is_empty(), "tree should be clean after commit");
    }
}
