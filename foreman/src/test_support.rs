//! Test-only helpers: a throwaway git repository, a scripted worker, and an
//! in-memory hosting platform.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::core::message::{WorkerMessage, WorkerResult};
use crate::core::types::WorkItem;
use crate::io::config::ForemanConfig;
use crate::io::hosting::{ArtifactRequest, CreateOutcome, HostingPlatform, RemoteArtifact};
use crate::io::worker::{WorkerLauncher, WorkerRequest};

/// A git repository in a temp dir with one commit on its default branch.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let repo = Self { dir };
        repo.git(&["init"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "test"])?;
        fs::write(repo.path().join("README.md"), "test repo\n").context("write README")?;
        repo.git(&["add", "README.md"])?;
        repo.git(&["commit", "-m", "chore: init"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run git in the repo and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("run git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Local branches, without the `refs/heads/` prefix.
    pub fn branches(&self) -> Result<Vec<String>> {
        let out = self.git(&["for-each-ref", "--format=%(refname:short)", "refs/heads"])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Worktree paths git knows about, excluding the main checkout.
    pub fn worktrees(&self) -> Result<Vec<PathBuf>> {
        let out = self.git(&["worktree", "list", "--porcelain"])?;
        let main = fs::canonicalize(self.path()).context("canonicalize repo")?;
        Ok(out
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(PathBuf::from)
            .filter(|path| *path != main)
            .collect())
    }
}

/// Config with every delay shortened for tests.
pub fn fast_config() -> ForemanConfig {
    let mut config = ForemanConfig::default();
    config.workspace.remove_backoff_ms = 10;
    config.workspace.settle_ms = 10;
    config.workspace.git_timeout_secs = 30;
    config.agent.cleanup_delay_ms = 20;
    config.agent.stop_grace_ms = 1_000;
    config.health.interval_secs = 1;
    config.reconcile.retry_delay_ms = 10;
    config.reconcile.conflict_requery_delay_ms = 10;
    config
}

pub fn text(content: &str) -> WorkerMessage {
    WorkerMessage::Text(content.to_string())
}

pub fn tool_error(content: &str) -> WorkerMessage {
    WorkerMessage::ToolResult {
        content: content.to_string(),
        is_error: true,
    }
}

pub fn stderr(line: &str) -> WorkerMessage {
    WorkerMessage::Stderr(line.to_string())
}

pub fn success(summary: &str) -> WorkerMessage {
    WorkerMessage::Result(WorkerResult {
        success: true,
        subtype: "success".to_string(),
        text: Some(summary.to_string()),
    })
}

pub fn failure(detail: &str) -> WorkerMessage {
    WorkerMessage::Result(WorkerResult::failure("error_during_execution", detail))
}

/// What a scripted worker does for one item.
#[derive(Debug, Clone, Default)]
pub struct WorkerScript {
    pub messages: Vec<WorkerMessage>,
    /// Keep the stream open after the messages until cancelled.
    pub hold: bool,
    /// Fail the launch itself.
    pub fail_launch: bool,
    /// How long the worker takes to exit once cancelled.
    pub exit_delay: Duration,
}

impl WorkerScript {
    pub fn messages(messages: Vec<WorkerMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// A worker that emits `messages` and then runs until stopped.
    pub fn holding(messages: Vec<WorkerMessage>) -> Self {
        Self {
            messages,
            hold: true,
            ..Self::default()
        }
    }

    pub fn exiting_after(mut self, delay: Duration) -> Self {
        self.exit_delay = delay;
        self
    }
}

/// Launcher that replays a script per item instead of spawning a process.
///
/// Items without a script get a worker that succeeds immediately.
#[derive(Default)]
pub struct ScriptedWorker {
    scripts: Mutex<HashMap<u64, WorkerScript>>,
    launched: Mutex<Vec<(u64, String, PathBuf)>>,
    exited: Arc<Mutex<Vec<u64>>>,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, item_id: u64, script: WorkerScript) {
        self.scripts.lock().insert(item_id, script);
    }

    /// `(item_id, prompt, workdir)` for every launch so far.
    pub fn launched(&self) -> Vec<(u64, String, PathBuf)> {
        self.launched.lock().clone()
    }

    /// Whether a worker for `item_id` has exited and closed its stream.
    pub fn has_exited(&self, item_id: u64) -> bool {
        self.exited.lock().contains(&item_id)
    }

    pub fn launch_count(&self, item_id: u64) -> usize {
        self.launched
            .lock()
            .iter()
            .filter(|(id, _, _)| *id == item_id)
            .count()
    }
}

#[async_trait]
impl WorkerLauncher for ScriptedWorker {
    async fn launch(&self, request: WorkerRequest) -> Result<mpsc::Receiver<WorkerMessage>> {
        let script = self
            .scripts
            .lock()
            .get(&request.item_id)
            .cloned()
            .unwrap_or_else(|| WorkerScript::messages(vec![success("done")]));
        self.launched.lock().push((
            request.item_id,
            request.prompt.clone(),
            request.workdir.clone(),
        ));
        if script.fail_launch {
            return Err(anyhow!("scripted launch failure"));
        }

        let (tx, rx) = mpsc::channel(64);
        let cancel = request.cancel;
        let exited = Arc::clone(&self.exited);
        let item_id = request.item_id;
        tokio::spawn(async move {
            for message in script.messages {
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            if script.hold {
                cancel.cancelled().await;
                tokio::time::sleep(script.exit_delay).await;
            }
            exited.lock().push(item_id);
            drop(tx);
        });
        Ok(rx)
    }
}

/// In-memory hosting platform.
#[derive(Default)]
pub struct FakeHosting {
    items: Mutex<HashMap<u64, WorkItem>>,
    artifacts: Mutex<Vec<RemoteArtifact>>,
    creates: AtomicUsize,
    lists: AtomicUsize,
    /// When set, create reports a conflict and the artifact shows up in the
    /// next listing.
    conflict: Mutex<Option<RemoteArtifact>>,
    fail_list: AtomicBool,
}

impl FakeHosting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&self, id: u64, title: &str, body: &str) {
        self.items.lock().insert(
            id,
            WorkItem {
                id,
                title: title.to_string(),
                body: body.to_string(),
            },
        );
    }

    pub fn add_artifact(&self, artifact: RemoteArtifact) {
        self.artifacts.lock().push(artifact);
    }

    pub fn conflict_with(&self, artifact: RemoteArtifact) {
        *self.conflict.lock() = Some(artifact);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn artifacts(&self) -> Vec<RemoteArtifact> {
        self.artifacts.lock().clone()
    }
}

/// An open pull request as the fake platform would list it.
pub fn remote_artifact(number: u64, title: &str, body: &str, head: &str) -> RemoteArtifact {
    RemoteArtifact {
        number,
        url: format!("https://github.com/acme/app/pull/{number}"),
        title: title.to_string(),
        body: body.to_string(),
        head_branch: head.to_string(),
        state: "OPEN".to_string(),
    }
}

#[async_trait]
impl HostingPlatform for FakeHosting {
    async fn fetch_item(&self, item_id: u64) -> Result<WorkItem> {
        Ok(self
            .items
            .lock()
            .get(&item_id)
            .cloned()
            .unwrap_or_else(|| WorkItem {
                id: item_id,
                title: format!("Item {item_id}"),
                body: String::new(),
            }))
    }

    async fn list_artifacts(&self) -> Result<Vec<RemoteArtifact>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            bail!("scripted listing failure");
        }
        Ok(self.artifacts.lock().clone())
    }

    async fn create_artifact(&self, request: &ArtifactRequest) -> Result<CreateOutcome> {
        if let Some(existing) = self.conflict.lock().take() {
            self.artifacts.lock().push(existing);
            return Ok(CreateOutcome::AlreadyExists {
                detail: format!("a pull request for branch \"{}\" already exists", request.head),
            });
        }
        let count = self.creates.fetch_add(1, Ordering::SeqCst) as u64;
        let number = 100 + count;
        let artifact = remote_artifact(number, &request.title, &request.body, &request.head);
        let url = artifact.url.clone();
        self.artifacts.lock().push(artifact);
        Ok(CreateOutcome::Created { number, url })
    }
}
