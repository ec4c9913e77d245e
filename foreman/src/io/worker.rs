//! Worker launcher abstraction.
//!
//! The [`WorkerLauncher`] trait decouples agent lifecycle from the actual AI
//! backend (currently the `claude` CLI in stream-json mode). Tests use a
//! scripted launcher that replays predetermined messages without spawning
//! processes.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::message::{WorkerMessage, WorkerResult, parse_line};
use crate::io::config::WorkerConfig;

const STDERR_DRAIN: Duration = Duration::from_secs(2);

/// Parameters for one worker launch.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub item_id: u64,
    pub prompt: String,
    /// Workspace the worker runs in.
    pub workdir: PathBuf,
    /// Cancelled by `stop`; the launcher must end the worker when it fires.
    pub cancel: CancellationToken,
}

/// Abstraction over AI worker backends.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker and return its ordered message stream.
    ///
    /// The stream ends after a terminal `Result`, after cancellation, or when
    /// the worker exits. An error here means nothing was started.
    async fn launch(&self, request: WorkerRequest) -> Result<mpsc::Receiver<WorkerMessage>>;
}

/// Launcher that spawns the `claude` CLI and parses its JSONL stdout.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    config: WorkerConfig,
}

impl ClaudeCli {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &WorkerRequest) -> Result<Command> {
        let (program, leading) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("worker.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(leading);
        if !self.config.prompt_flag.is_empty() {
            cmd.arg(&self.config.prompt_flag);
        }
        cmd.arg(&request.prompt)
            .args(&self.config.args)
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl WorkerLauncher for ClaudeCli {
    #[instrument(skip_all, fields(item_id = request.item_id, workdir = %request.workdir.display()))]
    async fn launch(&self, request: WorkerRequest) -> Result<mpsc::Receiver<WorkerMessage>> {
        let mut cmd = self.command(&request)?;
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn worker {}", self.config.command.join(" ")))?;
        info!(pid = ?child.id(), "worker started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("worker stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("worker stderr was not piped"))?;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);

        // Forwards stderr into the stream and keeps a tail for failure detail.
        // It holds a sender, so every exit path below must abort it.
        let tail_lines = self.config.stderr_tail_lines.max(1);
        let stderr_tx = tx.clone();
        let mut stderr_task = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(tail_lines);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = stderr_tx.send(WorkerMessage::Stderr(line.clone())).await;
                if tail.len() == tail_lines {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        });
        let cancel = request.cancel;
        let item_id = request.item_id;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut saw_result = false;
            let mut cancelled = false;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(item_id, "cancellation requested, killing worker");
                        cancelled = true;
                        if let Err(err) = child.start_kill() {
                            warn!(item_id, err = %err, "failed to kill worker");
                        }
                        break;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if saw_result {
                                continue;
                            }
                            for message in parse_line(&line) {
                                saw_result |= message.is_terminal();
                                if tx.send(message).await.is_err() {
                                    debug!(item_id, "consumer gone, killing worker");
                                    let _ = child.start_kill();
                                    stderr_task.abort();
                                    return;
                                }
                                if saw_result {
                                    break;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(item_id, err = %err, "worker stdout read failed");
                            break;
                        }
                    }
                }
            }

            let status = child.wait().await;
            let exit_ok = status.as_ref().is_ok_and(std::process::ExitStatus::success);
            debug!(item_id, exit_ok, saw_result, cancelled, "worker exited");
            if saw_result || cancelled || exit_ok {
                stderr_task.abort();
                return;
            }
            // Grandchildren may keep stderr open after the worker itself exits.
            let tail = tokio::time::timeout(STDERR_DRAIN, &mut stderr_task)
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            stderr_task.abort();
            let code = status.ok().and_then(|s| s.code());
            let tail = tail.into_iter().collect::<Vec<_>>().join("\n");
            let detail = if tail.trim().is_empty() {
                format!("worker exited with status {code:?}")
            } else {
                format!("worker exited with status {code:?}: {tail}")
            };
            let _ = tx
                .send(WorkerMessage::Result(WorkerResult::failure("error_exit", detail)))
                .await;
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_launcher(script: &str) -> ClaudeCli {
        ClaudeCli::new(WorkerConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                script.to_string(),
                "worker".to_string(),
            ],
            prompt_flag: "-p".to_string(),
            args: Vec::new(),
            channel_capacity: 16,
            stderr_tail_lines: 5,
        })
    }

    fn request(dir: &std::path::Path) -> WorkerRequest {
        WorkerRequest {
            item_id: 42,
            prompt: "do the thing".to_string(),
            workdir: dir.to_path_buf(),
            cancel: CancellationToken::new(),
        }
    }

    async fn drain(mut rx: mpsc::Receiver<WorkerMessage>) -> Vec<WorkerMessage> {
        let mut out = Vec::new();
        while let Some(msg) = rx.recv().await {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn streams_parsed_messages_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = r#"
echo '{"type":"system","subtype":"init","session_id":"s"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}'
echo '{"type":"result","subtype":"success","is_error":false,"result":"done"}'
echo '{"type":"assistant","message":{"content":"ignored"}}'
"#;
        let rx = sh_launcher(script)
            .launch(request(temp.path()))
            .await
            .expect("launch");
        let msgs = drain(rx).await;
        assert_eq!(msgs.len(), 3);
        assert!(matches!(msgs[0], WorkerMessage::Init { .. }));
        assert_eq!(msgs[1], WorkerMessage::Text("hi".to_string()));
        assert!(matches!(&msgs[2], WorkerMessage::Result(r) if r.success));
    }

    #[tokio::test]
    async fn prompt_is_passed_after_flag() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = r#"printf '{"type":"result","subtype":"success","result":"%s %s"}\n' "$1" "$2""#;
        let rx = sh_launcher(script)
            .launch(request(temp.path()))
            .await
            .expect("launch");
        let msgs = drain(rx).await;
        let WorkerMessage::Result(result) = &msgs[0] else {
            panic!("expected result");
        };
        assert_eq!(result.text.as_deref(), Some("-p do the thing"));
    }

    #[tokio::test]
    async fn nonzero_exit_without_result_is_synthesized() {
        let temp = tempfile::tempdir().expect("tempdir");
        let rx = sh_launcher("echo 'auth expired' >&2; exit 2")
            .launch(request(temp.path()))
            .await
            .expect("launch");
        let msgs = drain(rx).await;
        assert_eq!(msgs[0], WorkerMessage::Stderr("auth expired".to_string()));
        let Some(WorkerMessage::Result(result)) = msgs.last() else {
            panic!("expected result");
        };
        assert!(!result.success);
        assert!(result.failure_detail().contains("auth expired"));
    }

    #[tokio::test]
    async fn stderr_lines_are_forwarded_before_the_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = r#"
echo 'warming up' >&2
sleep 0.2
echo '{"type":"result","subtype":"success","result":"done"}'
"#;
        let rx = sh_launcher(script)
            .launch(request(temp.path()))
            .await
            .expect("launch");
        let msgs = drain(rx).await;
        assert_eq!(msgs[0], WorkerMessage::Stderr("warming up".to_string()));
        assert!(matches!(msgs.last(), Some(WorkerMessage::Result(r)) if r.success));
    }

    #[tokio::test]
    async fn clean_exit_without_result_just_closes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let rx = sh_launcher("echo not-json")
            .launch(request(temp.path()))
            .await
            .expect("launch");
        let msgs = drain(rx).await;
        assert_eq!(msgs.len(), 1);
        assert!(matches!(&msgs[0], WorkerMessage::Unknown { .. }));
    }

    #[tokio::test]
    async fn cancellation_ends_the_stream() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path());
        let cancel = req.cancel.clone();
        let rx = sh_launcher("sleep 30").launch(req).await.expect("launch");
        cancel.cancel();
        let msgs = tokio::time::timeout(Duration::from_secs(5), drain(rx))
            .await
            .expect("stream closes after cancel");
        assert!(msgs.is_empty());
    }

    #[tokio::test]
    async fn missing_binary_fails_launch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let launcher = ClaudeCli::new(WorkerConfig {
            command: vec!["definitely-not-a-worker-binary".to_string()],
            ..WorkerConfig::default()
        });
        assert!(launcher.launch(request(temp.path())).await.is_err());
    }
}
