//! Agent lifecycle: deploy, stream consumption, stop, and cleanup.
//!
//! [`AgentManager`] owns the in-memory agent table. Every status change goes
//! through one function that checks the transition, stamps the record,
//! persists it (when a store is configured) and publishes a [`StatusEvent`].
//!
//! Deploy and stop for the same item are serialized by a per-item
//! [`KeyedMutex`]; different items proceed independently, and one agent's
//! failure never touches another's record.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::health::AgentActivity;
use crate::core::linking::find_artifact_url;
use crate::core::log_buffer::LogBuffer;
use crate::core::message::WorkerMessage;
use crate::core::types::{AgentRecord, AgentStatus, LogEntry, LogKind, StatusEvent, WorkItem};
use crate::error::ForemanError;
use crate::io::agent_store::{AgentStore, write_agent_store};
use crate::io::config::AgentConfig;
use crate::io::git::Git;
use crate::io::hosting::HostingPlatform;
use crate::io::instructions::{
    INSTRUCTIONS_FILE, InstructionInputs, ensure_excluded, render_instructions, render_prompt,
    write_instructions,
};
use crate::io::worker::{WorkerLauncher, WorkerRequest};
use crate::reconcile::{CompletedAgent, ReconciliationManager};
use crate::repo_mutex::{KeyedMutex, RepoMutex};
use crate::workspace::{DestroyReport, Workspace, WorkspaceProvisioner};

/// Point-in-time copy of an agent, safe to hand out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSnapshot {
    pub item_id: u64,
    pub title: String,
    pub status: AgentStatus,
    pub workspace: PathBuf,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub error_count: u32,
    pub error: Option<String>,
    pub log_len: usize,
}

struct Agent {
    generation: u64,
    item: WorkItem,
    context: Option<String>,
    status: AgentStatus,
    workspace: PathBuf,
    branch: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    last_activity: DateTime<Utc>,
    error_count: u32,
    error: Option<String>,
    logs: LogBuffer,
    cancel: CancellationToken,
    consumer: Option<JoinHandle<()>>,
}

impl Agent {
    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            item_id: self.item.id,
            title: self.item.title.clone(),
            status: self.status,
            workspace: self.workspace.clone(),
            branch: self.branch.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            last_activity: self.last_activity,
            error_count: self.error_count,
            error: self.error.clone(),
            log_len: self.logs.len(),
        }
    }

    fn record(&self) -> AgentRecord {
        AgentRecord {
            item_id: self.item.id,
            status: self.status,
            workspace: self.workspace.clone(),
            branch: self.branch.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            error: self.error.clone(),
        }
    }

    fn completed(&self) -> CompletedAgent {
        CompletedAgent {
            item_id: self.item.id,
            title: self.item.title.clone(),
            branch: self.branch.clone(),
            logs: self.logs.snapshot(),
        }
    }
}

/// Persisted agent records and where to write them.
#[derive(Debug)]
pub struct StoreHandle {
    pub path: PathBuf,
    pub store: AgentStore,
}

/// Everything an [`AgentManager`] needs.
pub struct ManagerParts {
    pub provisioner: WorkspaceProvisioner,
    pub repo_mutex: RepoMutex,
    pub hosting: Arc<dyn HostingPlatform>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub reconciler: ReconciliationManager,
    pub config: AgentConfig,
    pub store: Option<StoreHandle>,
}

struct Inner {
    agents: Mutex<HashMap<u64, Agent>>,
    deploy_mutex: KeyedMutex<u64>,
    repo_mutex: RepoMutex,
    provisioner: WorkspaceProvisioner,
    hosting: Arc<dyn HostingPlatform>,
    launcher: Arc<dyn WorkerLauncher>,
    reconciler: ReconciliationManager,
    events: broadcast::Sender<StatusEvent>,
    config: AgentConfig,
    store: Option<Store>,
    cleanups: Mutex<Vec<JoinHandle<()>>>,
    next_generation: AtomicU64,
}

/// In-memory agent records plus the file they are mirrored to.
struct Store {
    path: PathBuf,
    records: Mutex<AgentStore>,
    /// Held across each file write, so the last write carries the newest
    /// snapshot.
    writer: tokio::sync::Mutex<()>,
}

impl Store {
    /// Write the current records from the blocking pool.
    async fn flush(&self) {
        let _writer = self.writer.lock().await;
        let snapshot = self.records.lock().clone();
        let path = self.path.clone();
        match tokio::task::spawn_blocking(move || write_agent_store(&path, &snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(err = %format!("{err:#}"), "failed to persist agent store"),
            Err(err) => warn!(err = %err, "agent store write did not finish"),
        }
    }
}

/// Shared handle to the agent table; clones refer to the same agents.
#[derive(Clone)]
pub struct AgentManager {
    inner: Arc<Inner>,
}

impl AgentManager {
    pub fn new(parts: ManagerParts) -> Self {
        let (events, _) = broadcast::channel(parts.config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                agents: Mutex::new(HashMap::new()),
                deploy_mutex: KeyedMutex::new(),
                repo_mutex: parts.repo_mutex,
                provisioner: parts.provisioner,
                hosting: parts.hosting,
                launcher: parts.launcher,
                reconciler: parts.reconciler,
                events,
                config: parts.config,
                store: parts.store.map(|handle| Store {
                    path: handle.path,
                    records: Mutex::new(handle.store),
                    writer: tokio::sync::Mutex::new(()),
                }),
                cleanups: Mutex::new(Vec::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn provisioner(&self) -> &WorkspaceProvisioner {
        &self.inner.provisioner
    }

    pub fn reconciler(&self) -> &ReconciliationManager {
        &self.inner.reconciler
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.events.subscribe()
    }

    /// Whether `item_id` has a live agent or a persisted record.
    pub fn is_tracked(&self, item_id: u64) -> bool {
        if self.inner.agents.lock().contains_key(&item_id) {
            return true;
        }
        self.inner
            .store
            .as_ref()
            .is_some_and(|store| store.records.lock().is_tracked(item_id))
    }

    fn ensure_not_running(&self, item_id: u64) -> Result<()> {
        let agents = self.inner.agents.lock();
        if let Some(agent) = agents.get(&item_id)
            && !agent.status.is_terminal()
        {
            return Err(ForemanError::AlreadyRunning(item_id).into());
        }
        Ok(())
    }

    /// Deploy an agent for `item_id`.
    ///
    /// Fails with [`ForemanError::AlreadyRunning`] when a live agent exists,
    /// and propagates provisioning errors after a best-effort cleanup. A
    /// worker that fails to launch still yields an agent, marked `failed`.
    #[instrument(skip_all, fields(item_id))]
    pub async fn deploy(&self, item_id: u64, context: Option<String>) -> Result<AgentSnapshot> {
        self.ensure_not_running(item_id)?;
        let _deploy = self.inner.deploy_mutex.lock(item_id).await;
        self.ensure_not_running(item_id)?;

        let item = self
            .inner
            .hosting
            .fetch_item(item_id)
            .await
            .with_context(|| format!("fetch work item {item_id}"))?;

        let (workspace, prompt) = match self.prepare_workspace(&item, context.as_deref()).await {
            Ok(prepared) => prepared,
            Err(err) => {
                let report = self.inner.provisioner.destroy(item_id).await;
                debug!(clean = report.is_clean(), "cleaned up after failed provisioning");
                return Err(err.context(format!("provision workspace for item {item_id}")));
            }
        };

        let cancel = CancellationToken::new();
        let now = Utc::now();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut logs = LogBuffer::new(self.inner.config.log_cap, self.inner.config.log_trim_interval);
        logs.push(LogEntry::new(
            LogKind::Lifecycle,
            format!("deployed to {} on {}", workspace.path.display(), workspace.branch),
        ));
        let agent = Agent {
            generation,
            item,
            context,
            status: AgentStatus::Starting,
            workspace: workspace.path.clone(),
            branch: workspace.branch.clone(),
            started_at: now,
            ended_at: None,
            last_activity: now,
            error_count: 0,
            error: None,
            logs,
            cancel: cancel.clone(),
            consumer: None,
        };
        let snapshot = agent.snapshot();
        self.inner.agents.lock().insert(item_id, agent);
        self.persist(item_id).await;
        self.publish(item_id, AgentStatus::Starting, None);
        info!(workspace = %workspace.path.display(), "agent registered");

        let request = WorkerRequest {
            item_id,
            prompt,
            workdir: workspace.path.clone(),
            cancel: cancel.clone(),
        };
        match self.inner.launcher.launch(request).await {
            Ok(rx) => {
                let manager = self.clone();
                let handle = tokio::spawn(async move {
                    manager.consume(item_id, generation, rx, cancel).await;
                });
                if let Some(agent) = self.inner.agents.lock().get_mut(&item_id) {
                    agent.consumer = Some(handle);
                }
            }
            Err(err) => {
                let err = ForemanError::Subprocess(format!("failed to launch: {err:#}"));
                warn!(err = %err, "worker failed to launch");
                self.apply_status(item_id, AgentStatus::Failed, Some(err.to_string()))
                    .await;
            }
        }

        Ok(self.get_status(item_id).unwrap_or(snapshot))
    }

    /// Provision the workspace and write the worker instructions into it.
    async fn prepare_workspace(
        &self,
        item: &WorkItem,
        context: Option<&str>,
    ) -> Result<(Workspace, String)> {
        let workspace = self.inner.provisioner.provision(item.id).await?;
        let inputs = InstructionInputs {
            item,
            branch: &workspace.branch,
            context,
        };
        let instructions = render_instructions(&inputs)?;
        let prompt = render_prompt(&inputs)?;
        write_instructions(&workspace.path, &instructions).await?;

        let git = Git::new(&workspace.path);
        let exclude = git.git_path("info/exclude").await?;
        {
            let _guard = self
                .inner
                .repo_mutex
                .lock_repo(self.inner.provisioner.root())
                .await;
            ensure_excluded(&exclude, INSTRUCTIONS_FILE).await?;
        }
        Ok((workspace, prompt))
    }

    /// Drain one agent's worker stream in order.
    async fn consume(
        &self,
        item_id: u64,
        generation: u64,
        mut rx: mpsc::Receiver<WorkerMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    // Launchers close the stream only once the worker has
                    // exited, so `stop` can bound that wait on this task.
                    debug!(item_id, "cancelled, waiting for worker to exit");
                    while rx.recv().await.is_some() {}
                    return;
                }
                message = rx.recv() => message,
            };
            let Some(message) = message else {
                break;
            };
            if let WorkerMessage::Stderr(line) = &message {
                if !self.record_stderr(item_id, generation, line) {
                    return;
                }
                continue;
            }
            if !self.record_message(item_id, generation, &message).await {
                debug!(item_id, "agent replaced, dropping stream");
                return;
            }
            if let Some(text) = message.text_content()
                && let Some(link) = find_artifact_url(text)
            {
                self.inner.reconciler.record_artifact_url(item_id, &link);
            }
            if let WorkerMessage::Result(result) = message {
                if result.success {
                    self.on_completed(item_id, generation).await;
                } else {
                    let detail = result.failure_detail();
                    self.apply_status(item_id, AgentStatus::Failed, Some(detail))
                        .await;
                }
                return;
            }
        }
        if cancel.is_cancelled() {
            return;
        }
        self.apply_status(
            item_id,
            AgentStatus::Failed,
            Some(ForemanError::Subprocess("exited without a result".to_string()).to_string()),
        )
        .await;
    }

    /// Keep a worker stderr line in the agent log. Stderr alone does not
    /// count as progress, so activity and status are left alone.
    fn record_stderr(&self, item_id: u64, generation: u64, line: &str) -> bool {
        let mut agents = self.inner.agents.lock();
        match agents.get_mut(&item_id) {
            Some(agent) if agent.generation == generation => {
                agent
                    .logs
                    .push(WorkerMessage::Stderr(line.to_string()).to_log_entry());
                true
            }
            _ => false,
        }
    }

    /// Log a message against the agent and bump its activity. Returns false
    /// when the agent is gone or belongs to a newer deploy.
    async fn record_message(
        &self,
        item_id: u64,
        generation: u64,
        message: &WorkerMessage,
    ) -> bool {
        let first = {
            let mut agents = self.inner.agents.lock();
            let Some(agent) = agents.get_mut(&item_id) else {
                return false;
            };
            if agent.generation != generation {
                return false;
            }
            agent.logs.push(message.to_log_entry());
            agent.last_activity = Utc::now();
            if let WorkerMessage::ToolResult { is_error: true, .. } = message {
                agent.error_count += 1;
            }
            agent.status == AgentStatus::Starting
        };
        if first {
            self.apply_status(item_id, AgentStatus::Working, None).await;
        }
        true
    }

    async fn on_completed(&self, item_id: u64, generation: u64) {
        if !self.apply_status(item_id, AgentStatus::Completed, None).await {
            return;
        }
        let handoff = self
            .inner
            .agents
            .lock()
            .get(&item_id)
            .map(Agent::completed);
        if let Some(handoff) = handoff {
            self.inner.reconciler.enqueue(handoff);
        }

        let manager = self.clone();
        let delay = self.inner.config.cleanup_delay();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.cleanup_completed(item_id, generation).await;
        });
        let mut cleanups = self.inner.cleanups.lock();
        cleanups.retain(|h| !h.is_finished());
        cleanups.push(handle);
    }

    async fn cleanup_completed(&self, item_id: u64, generation: u64) {
        let _deploy = self.inner.deploy_mutex.lock(item_id).await;
        let still_ours = self
            .inner
            .agents
            .lock()
            .get(&item_id)
            .is_some_and(|a| a.generation == generation && a.status == AgentStatus::Completed);
        if !still_ours {
            debug!(item_id, "agent changed before cleanup, skipping");
            return;
        }
        let report = self.inner.provisioner.destroy(item_id).await;
        self.forget(item_id).await;
        info!(item_id, clean = report.is_clean(), "completed agent cleaned up");
    }

    /// Stop an agent: cancel its worker, destroy its workspace, and drop it.
    #[instrument(skip_all, fields(item_id))]
    pub async fn stop(&self, item_id: u64) -> Result<DestroyReport> {
        let _deploy = self.inner.deploy_mutex.lock(item_id).await;
        let (cancel, consumer, was_live) = {
            let mut agents = self.inner.agents.lock();
            let agent = agents
                .get_mut(&item_id)
                .ok_or(ForemanError::NotFound(item_id))?;
            (
                agent.cancel.clone(),
                agent.consumer.take(),
                !agent.status.is_terminal(),
            )
        };

        cancel.cancel();
        if let Some(mut handle) = consumer {
            let grace = self.inner.config.stop_grace();
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "worker still running after grace period"
                );
                handle.abort();
            }
        }

        if was_live {
            self.apply_status(item_id, AgentStatus::Stopped, Some("stopped".to_string()))
                .await;
        }
        let report = self.inner.provisioner.destroy(item_id).await;
        self.forget(item_id).await;
        info!(clean = report.is_clean(), "agent stopped");
        Ok(report)
    }

    /// Stop every agent that is still running.
    pub async fn stop_all(&self) {
        let live: Vec<u64> = self
            .inner
            .agents
            .lock()
            .values()
            .filter(|a| !a.status.is_terminal())
            .map(|a| a.item.id)
            .collect();
        for item_id in live {
            if let Err(err) = self.stop(item_id).await {
                warn!(item_id, err = %format!("{err:#}"), "stop failed");
            }
        }
    }

    pub fn get_status(&self, item_id: u64) -> Option<AgentSnapshot> {
        self.inner.agents.lock().get(&item_id).map(Agent::snapshot)
    }

    /// All tracked agents, ordered by item id.
    pub fn list_all(&self) -> Vec<AgentSnapshot> {
        let mut all: Vec<_> = self
            .inner
            .agents
            .lock()
            .values()
            .map(Agent::snapshot)
            .collect();
        all.sort_by_key(|a| a.item_id);
        all
    }

    pub fn logs(&self, item_id: u64) -> Option<Vec<LogEntry>> {
        self.inner
            .agents
            .lock()
            .get(&item_id)
            .map(|a| a.logs.snapshot())
    }

    /// Deploy context an agent was started with.
    pub fn context(&self, item_id: u64) -> Option<String> {
        self.inner
            .agents
            .lock()
            .get(&item_id)
            .and_then(|a| a.context.clone())
    }

    /// Health inputs for every non-terminal agent.
    pub fn activities(&self) -> Vec<AgentActivity> {
        let mut out: Vec<_> = self
            .inner
            .agents
            .lock()
            .values()
            .filter(|a| !a.status.is_terminal())
            .map(|a| AgentActivity {
                item_id: a.item.id,
                status: a.status,
                started_at: a.started_at,
                last_activity: a.last_activity,
                error_count: a.error_count,
            })
            .collect();
        out.sort_by_key(|a| a.item_id);
        out
    }

    /// Completed agents still awaiting cleanup, for reconciliation scans.
    pub fn completed_agents(&self) -> Vec<CompletedAgent> {
        self.inner
            .agents
            .lock()
            .values()
            .filter(|a| a.status == AgentStatus::Completed)
            .map(Agent::completed)
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.inner
            .agents
            .lock()
            .values()
            .all(|a| a.status.is_terminal())
    }

    /// Wait until no agent is running, then for scheduled cleanups.
    pub async fn wait_settled(&self) {
        let mut events = self.subscribe();
        while !self.all_terminal() {
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        let pending: Vec<_> = std::mem::take(&mut *self.inner.cleanups.lock());
        for handle in pending {
            let _ = handle.await;
        }
    }

    /// Apply a status change if the transition is allowed.
    ///
    /// Returns whether it was applied. Rejected transitions are logged and
    /// leave the agent untouched.
    async fn apply_status(&self, item_id: u64, next: AgentStatus, detail: Option<String>) -> bool {
        {
            let mut agents = self.inner.agents.lock();
            let Some(agent) = agents.get_mut(&item_id) else {
                debug!(item_id, status = %next, "status change for untracked agent ignored");
                return false;
            };
            if !agent.status.can_transition_to(next) {
                warn!(
                    item_id,
                    from = %agent.status,
                    to = %next,
                    "rejected status transition"
                );
                return false;
            }
            agent.status = next;
            if next.is_terminal() {
                agent.ended_at = Some(Utc::now());
            }
            if next == AgentStatus::Failed {
                agent.error = detail.clone();
            }
            let line = match &detail {
                Some(detail) => format!("status {next}: {detail}"),
                None => format!("status {next}"),
            };
            agent.logs.push(LogEntry::new(LogKind::Lifecycle, line));
        }
        info!(item_id, status = %next, detail = ?detail, "agent status changed");
        self.persist(item_id).await;
        self.publish(item_id, next, detail);
        true
    }

    fn publish(&self, item_id: u64, status: AgentStatus, detail: Option<String>) {
        // No subscribers is fine.
        let _ = self.inner.events.send(StatusEvent {
            item_id,
            status,
            detail,
            at: Utc::now(),
        });
    }

    /// Drop persisted records of finished agents that are not in memory.
    ///
    /// Returns the dropped ids; their workspaces become sweepable.
    pub async fn drop_inactive(&self) -> Vec<u64> {
        let Some(store) = &self.inner.store else {
            return Vec::new();
        };
        let live: Vec<u64> = self.inner.agents.lock().keys().copied().collect();
        let dropped: Vec<u64> = {
            let mut records = store.records.lock();
            let dropped: Vec<u64> = records
                .agents
                .values()
                .filter(|r| r.status.is_terminal() && !live.contains(&r.item_id))
                .map(|r| r.item_id)
                .collect();
            for item_id in &dropped {
                records.remove(*item_id);
            }
            dropped
        };
        if !dropped.is_empty() {
            store.flush().await;
        }
        dropped
    }

    /// Persisted records, including agents from earlier runs.
    pub fn records(&self) -> Vec<AgentRecord> {
        self.inner
            .store
            .as_ref()
            .map(|store| store.records.lock().agents.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn forget(&self, item_id: u64) {
        self.inner.agents.lock().remove(&item_id);
        if let Some(store) = &self.inner.store {
            store.records.lock().remove(item_id);
            store.flush().await;
        }
    }

    async fn persist(&self, item_id: u64) {
        let Some(store) = &self.inner.store else {
            return;
        };
        let record = self.inner.agents.lock().get(&item_id).map(Agent::record);
        if let Some(record) = record {
            store.records.lock().upsert(record);
            store.flush().await;
        }
    }
}
