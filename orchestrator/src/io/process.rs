//! Helpers for running child processes with timeouts, cancellation and
//! bounded output capture.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out && !self.cancelled
    }

    /// Stdout and stderr merged into one lossy string for diagnostics.
    pub fn merged(&self) -> String {
        let mut buf = String::from_utf8_lossy(&self.stdout).into_owned();
        if !self.stderr.is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        if self.stdout_truncated + self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[output truncated {} bytes]",
                self.stdout_truncated + self.stderr_truncated
            ));
        }
        buf
    }
}

/// Run a command with a timeout and a cancellation token, capturing
/// stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs; `output_limit_bytes`
/// bounds the bytes kept per stream (the pipes are still drained past the
/// limit). On timeout or cancellation the child is killed and the flags on
/// [`CommandOutput`] are set; the caller decides how to surface that.
pub async fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().context("spawn command")?;

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).await.context("write stdin")?;
        child_stdin.shutdown().await.context("close stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle =
        tokio::spawn(async move { read_stream_limited(stdout, output_limit_bytes).await });
    let stderr_handle =
        tokio::spawn(async move { read_stream_limited(stderr, output_limit_bytes).await });

    let mut timed_out = false;
    let mut cancelled = false;
    let status = tokio::select! {
        res = child.wait() => res.context("wait for command")?,
        _ = tokio::time::sleep(timeout) => {
            timed_out = true;
            child.kill().await.context("kill timed-out command")?;
            child.wait().await.context("wait after kill")?
        }
        _ = cancel.cancelled() => {
            cancelled = true;
            child.kill().await.context("kill cancelled command")?;
            child.wait().await.context("wait after kill")?
        }
    };

    let (stdout, stdout_truncated) = stdout_handle
        .await
        .map_err(|_| anyhow!("stdout reader task panicked"))??;
    let (stderr, stderr_truncated) = stderr_handle
        .await
        .map_err(|_| anyhow!("stderr reader task panicked"))??;

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

async fn read_stream_limited<R: AsyncReadExt + Unpin>(
    mut reader: R,
    limit: usize,
) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await.context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
