//! Helpers for running child processes with timeouts and bounded output.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How long output pipes may stay open once the child has exited. A
/// grandchild (`ssh` under `git fetch`) can inherit them and outlive it.
const PIPE_DRAIN: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Best single-line explanation of a failure: stderr, else stdout.
    pub fn detail(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let stderr = self.stderr_lossy();
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout_lossy();
        let stdout = stdout.trim();
        if stdout.is_empty() {
            format!("exit status {:?}", self.status.code())
        } else {
            stdout.to_string()
        }
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub async fn run_command(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stop_readers = CancellationToken::new();
    let stdout_handle = tokio::spawn(read_stream_limited(
        stdout,
        output_limit_bytes,
        stop_readers.clone(),
    ));
    let stderr_handle = tokio::spawn(read_stream_limited(
        stderr,
        output_limit_bytes,
        stop_readers.clone(),
    ));

    let mut timed_out = false;
    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.context("wait for command")?,
        Err(_) => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.start_kill().context("kill command")?;
            child.wait().await.context("wait command after kill")?
        }
    };

    let deadline = tokio::spawn({
        let stop = stop_readers.clone();
        async move {
            tokio::time::sleep(PIPE_DRAIN).await;
            stop.cancel();
        }
    });
    let (stdout, stdout_truncated) = stdout_handle
        .await
        .map_err(|_| anyhow!("stdout reader task panicked"))?
        .context("join stdout")?;
    let (stderr, stderr_truncated) = stderr_handle
        .await
        .map_err(|_| anyhow!("stderr reader task panicked"))?
        .context("join stderr")?;
    deadline.abort();
    if stop_readers.is_cancelled() {
        warn!(
            drain_secs = PIPE_DRAIN.as_secs(),
            "output pipes held open after exit, output may be incomplete"
        );
    }

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Read until EOF or until `stop` fires, keeping at most `limit` bytes.
async fn read_stream_limited<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
    stop: CancellationToken,
) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = tokio::select! {
            biased;
            read = reader.read(&mut chunk) => read.context("read output")?,
            () = stop.cancelled() => break,
        };
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

/// Best-effort system-wide sweep for stray worker processes.
///
/// Sends SIGTERM via `pkill -f <marker>` to every process whose command line
/// contains `marker` (typically a workspace path). Returns whether anything
/// matched. Cooperative cancellation is the normal path; this exists for
/// workers that outlived their agent.
#[instrument(skip_all, fields(marker))]
pub async fn kill_stray_workers(marker: &str) -> Result<bool> {
    if marker.trim().is_empty() {
        return Err(anyhow!("refusing to sweep processes with an empty marker"));
    }
    let mut cmd = Command::new("pkill");
    cmd.arg("-f").arg(marker);
    let output = run_command(cmd, Duration::from_secs(10), 4_096).await?;
    match output.status.code() {
        Some(0) => {
            info!(marker, "terminated stray worker processes");
            Ok(true)
        }
        Some(1) => {
            debug!(marker, "no stray worker processes");
            Ok(false)
        }
        _ => Err(anyhow!("pkill failed: {}", output.detail())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_status() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf hello; printf oops >&2; exit 3");
        let out = run_command(cmd, Duration::from_secs(5), 1_000)
            .await
            .expect("run");
        assert_eq!(out.stdout_lossy(), "hello");
        assert_eq!(out.status.code(), Some(3));
        assert!(!out.success());
        assert_eq!(out.detail(), "oops");
    }

    #[tokio::test]
    async fn truncates_beyond_limit() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf 0123456789");
        let out = run_command(cmd, Duration::from_secs(5), 4)
            .await
            .expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.stdout_truncated, 6);
    }

    #[tokio::test]
    async fn kills_on_timeout() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 5");
        let out = run_command(cmd, Duration::from_millis(100), 100)
            .await
            .expect("run");
        assert!(out.timed_out);
        assert_eq!(out.detail(), "timed out");
    }

    #[tokio::test]
    async fn timeout_is_not_extended_by_a_grandchild_holding_the_pipe() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf started; sleep 30 & wait");
        let started = std::time::Instant::now();
        let out = run_command(cmd, Duration::from_millis(100), 100)
            .await
            .expect("run");
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(out.stdout_lossy(), "started");
    }

    #[tokio::test]
    async fn exited_child_returns_while_grandchild_keeps_pipe_open() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf done; sleep 30 &");
        let started = std::time::Instant::now();
        let out = run_command(cmd, Duration::from_secs(20), 100)
            .await
            .expect("run");
        assert!(out.success());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(out.stdout_lossy(), "done");
    }

    #[tokio::test]
    async fn stray_sweep_rejects_empty_marker() {
        assert!(kill_stray_workers("  ").await.is_err());
    }
}
