//! Reconciliation of completed agents against the hosting platform.
//!
//! A worker can finish successfully without ever linking a completion
//! artifact (pull request). Such agents are queued here and each pass tries,
//! in order:
//!
//! 1. find an existing artifact that links the item or uses its branch,
//! 2. create one, but only if the captured logs show the branch was pushed.
//!
//! A pull-request URL printed by the worker is only a candidate: it may point
//! at another repository or at a PR the worker merely mentioned. A pass
//! confirms it against the listing before the ledger treats it as concrete.
//!
//! The local [`ArtifactLedger`] is consulted before any creation so an item
//! never gets a second artifact from us, and a platform-side duplicate
//! (`AlreadyExists`) is resolved by re-querying rather than creating again.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::background::BackgroundTask;
use crate::core::linking::{ArtifactLink, links_item, mentions_branch_creation};
use crate::core::types::{ArtifactState, CompletionArtifact, LogEntry, TaskState};
use crate::error::ForemanError;
use crate::io::config::ReconcileConfig;
use crate::io::hosting::{ArtifactRequest, CreateOutcome, HostingPlatform, RemoteArtifact};

/// Local view of which items have completion artifacts.
#[derive(Debug, Clone, Default)]
pub struct ArtifactLedger {
    artifacts: HashMap<u64, CompletionArtifact>,
    /// Unconfirmed URLs seen in worker output.
    candidates: HashMap<u64, ArtifactLink>,
}

impl ArtifactLedger {
    pub fn get(&self, item_id: u64) -> Option<&CompletionArtifact> {
        self.artifacts.get(&item_id)
    }

    pub fn has_concrete(&self, item_id: u64) -> bool {
        self.artifacts
            .get(&item_id)
            .is_some_and(CompletionArtifact::is_concrete)
    }

    /// Claim the right to create an artifact for `item_id`.
    ///
    /// Returns false when a concrete artifact is already recorded.
    pub fn reserve_pending(&mut self, item_id: u64) -> bool {
        if self.has_concrete(item_id) {
            return false;
        }
        self.artifacts
            .insert(item_id, CompletionArtifact::pending(item_id));
        true
    }

    /// Drop a pending reservation after a failed creation.
    pub fn release_pending(&mut self, item_id: u64) {
        if self
            .artifacts
            .get(&item_id)
            .is_some_and(|a| a.state == ArtifactState::Pending)
        {
            self.artifacts.remove(&item_id);
        }
    }

    /// Remember a URL from worker output until a listing confirms it.
    pub fn record_candidate(&mut self, item_id: u64, link: &ArtifactLink) {
        if !self.has_concrete(item_id) {
            self.candidates.insert(item_id, link.clone());
        }
    }

    pub fn candidate(&self, item_id: u64) -> Option<&ArtifactLink> {
        self.candidates.get(&item_id)
    }

    /// Record an artifact returned by creation.
    pub fn record_url(&mut self, item_id: u64, link: &ArtifactLink) {
        self.candidates.remove(&item_id);
        let entry = self
            .artifacts
            .entry(item_id)
            .or_insert_with(|| CompletionArtifact::pending(item_id));
        entry.number = Some(link.number);
        entry.url = Some(link.url.clone());
        if entry.state == ArtifactState::Pending {
            entry.state = ArtifactState::Open;
        }
    }

    /// Fill in an artifact found on the platform.
    pub fn backfill(&mut self, item_id: u64, remote: &RemoteArtifact) {
        self.candidates.remove(&item_id);
        self.artifacts.insert(
            item_id,
            CompletionArtifact {
                item_id,
                number: Some(remote.number),
                url: Some(remote.url.clone()),
                state: ArtifactState::from_remote(&remote.state),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

/// What the lifecycle manager hands over when an agent completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedAgent {
    pub item_id: u64,
    pub title: String,
    pub branch: String,
    pub logs: Vec<LogEntry>,
}

/// One queued recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryTask {
    pub item_id: u64,
    pub title: String,
    pub branch: String,
    #[serde(skip)]
    pub logs: Vec<LogEntry>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub state: TaskState,
    pub next_attempt_at: DateTime<Utc>,
}

impl RecoveryTask {
    fn new(agent: CompletedAgent) -> Self {
        Self {
            item_id: agent.item_id,
            title: agent.title,
            branch: agent.branch,
            logs: agent.logs,
            attempts: 0,
            last_error: None,
            state: TaskState::Pending,
            next_attempt_at: Utc::now(),
        }
    }

    fn shows_branch_pushed(&self) -> bool {
        self.logs
            .iter()
            .any(|entry| mentions_branch_creation(&entry.payload, &self.branch))
    }

    /// Error form of an exhausted task.
    pub fn exhausted_error(&self) -> ForemanError {
        ForemanError::RecoveryExhausted {
            item_id: self.item_id,
            attempts: self.attempts,
            last_error: self.last_error.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Another pass was already running; nothing was attempted.
    pub skipped: bool,
    /// Matched to an existing artifact.
    pub matched: Vec<u64>,
    pub created: Vec<u64>,
    pub retried: Vec<u64>,
    pub exhausted: Vec<u64>,
}

impl PassReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.matched.is_empty()
            && self.created.is_empty()
            && self.retried.is_empty()
            && self.exhausted.is_empty()
    }
}

enum Resolution {
    Matched,
    Created,
    /// A concrete artifact showed up in the ledger meanwhile.
    AlreadyRecorded,
}

struct Inner {
    hosting: Arc<dyn HostingPlatform>,
    config: ReconcileConfig,
    ledger: Mutex<ArtifactLedger>,
    queue: Mutex<BTreeMap<u64, RecoveryTask>>,
    finished: Mutex<Vec<RecoveryTask>>,
    running: AtomicBool,
}

/// Shared handle; clones refer to the same queue and ledger.
#[derive(Clone)]
pub struct ReconciliationManager {
    inner: Arc<Inner>,
}

/// Clears the reentrancy flag even if a pass is cancelled midway.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ReconciliationManager {
    pub fn new(hosting: Arc<dyn HostingPlatform>, config: ReconcileConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                hosting,
                config,
                ledger: Mutex::new(ArtifactLedger::default()),
                queue: Mutex::new(BTreeMap::new()),
                finished: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Queue a completed agent unless it already has a concrete artifact or
    /// is already queued. Returns whether it was queued.
    pub fn enqueue(&self, agent: CompletedAgent) -> bool {
        let item_id = agent.item_id;
        if self.inner.ledger.lock().has_concrete(item_id) {
            debug!(item_id, "artifact already recorded, nothing to reconcile");
            return false;
        }
        let mut queue = self.inner.queue.lock();
        if queue.contains_key(&item_id) {
            return false;
        }
        info!(item_id, branch = %agent.branch, "queued completed agent for reconciliation");
        queue.insert(item_id, RecoveryTask::new(agent));
        true
    }

    /// Queue every agent in `agents` that needs it. Returns how many were added.
    pub fn scan(&self, agents: impl IntoIterator<Item = CompletedAgent>) -> usize {
        agents
            .into_iter()
            .filter(|agent| self.enqueue(agent.clone()))
            .count()
    }

    /// Eagerly record an artifact URL seen in worker output.
    ///
    /// The URL stays a candidate; a queued task for the item becomes due at
    /// once so the next pass can confirm it.
    pub fn record_artifact_url(&self, item_id: u64, link: &ArtifactLink) {
        self.inner.ledger.lock().record_candidate(item_id, link);
        debug!(item_id, url = %link.url, "artifact candidate from worker output");
        if let Some(task) = self.inner.queue.lock().get_mut(&item_id) {
            task.next_attempt_at = Utc::now();
        }
    }

    pub fn candidate(&self, item_id: u64) -> Option<ArtifactLink> {
        self.inner.ledger.lock().candidate(item_id).cloned()
    }

    pub fn artifact(&self, item_id: u64) -> Option<CompletionArtifact> {
        self.inner.ledger.lock().get(item_id).cloned()
    }

    pub fn has_concrete(&self, item_id: u64) -> bool {
        self.inner.ledger.lock().has_concrete(item_id)
    }

    pub fn queued(&self) -> Vec<RecoveryTask> {
        self.inner.queue.lock().values().cloned().collect()
    }

    pub fn is_drained(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }

    /// Earliest time a queued task becomes due.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.inner
            .queue
            .lock()
            .values()
            .map(|task| task.next_attempt_at)
            .min()
    }

    /// Tasks that gave up, as typed errors.
    pub fn failures(&self) -> Vec<ForemanError> {
        self.inner
            .finished
            .lock()
            .iter()
            .filter(|task| task.state == TaskState::Failed)
            .map(RecoveryTask::exhausted_error)
            .collect()
    }

    /// Attempt every due task once.
    #[instrument(skip_all)]
    pub async fn run_pass(&self) -> PassReport {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            debug!("reconciliation pass already running");
            return PassReport::skipped();
        }
        let _guard = PassGuard(&self.inner.running);

        let now = Utc::now();
        let due: Vec<RecoveryTask> = self
            .inner
            .queue
            .lock()
            .values()
            .filter(|task| task.state == TaskState::Pending && task.next_attempt_at <= now)
            .cloned()
            .collect();

        let mut report = PassReport::default();
        for task in due {
            let item_id = task.item_id;
            match self.attempt(&task).await {
                Ok(resolution) => {
                    match resolution {
                        Resolution::Matched => report.matched.push(item_id),
                        Resolution::Created => report.created.push(item_id),
                        Resolution::AlreadyRecorded => {}
                    }
                    self.finish(item_id, TaskState::Resolved, None);
                }
                Err(err) => {
                    let detail = format!("{err:#}");
                    if self.record_failure(item_id, detail) {
                        report.exhausted.push(item_id);
                    } else {
                        report.retried.push(item_id);
                    }
                }
            }
        }
        report
    }

    async fn attempt(&self, task: &RecoveryTask) -> Result<Resolution> {
        let item_id = task.item_id;
        if self.has_concrete(item_id) {
            return Ok(Resolution::AlreadyRecorded);
        }

        let remote = self.inner.hosting.list_artifacts().await?;
        if self.backfill_match(task, &remote) {
            return Ok(Resolution::Matched);
        }

        if !task.shows_branch_pushed() {
            bail!(
                "no artifact links item {item_id} and the logs show no push of {}",
                task.branch
            );
        }
        if !self.inner.ledger.lock().reserve_pending(item_id) {
            return Ok(Resolution::AlreadyRecorded);
        }

        let request = ArtifactRequest {
            item_id,
            title: task.title.clone(),
            body: format!(
                "Closes #{item_id}\n\nOpened by foreman: the worker finished on `{}` without linking a pull request.",
                task.branch
            ),
            head: task.branch.clone(),
        };
        let outcome = match self.inner.hosting.create_artifact(&request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.inner.ledger.lock().release_pending(item_id);
                return Err(err);
            }
        };

        match outcome {
            CreateOutcome::Created { number, url } => {
                info!(item_id, number, url = %url, "created missing artifact");
                self.inner
                    .ledger
                    .lock()
                    .record_url(item_id, &ArtifactLink { url, number });
                Ok(Resolution::Created)
            }
            CreateOutcome::AlreadyExists { detail } => {
                debug!(item_id, detail = %detail, "platform reports an existing artifact");
                self.requery_after_conflict(task).await
            }
        }
    }

    /// The platform said an artifact exists that our listing missed; give the
    /// listing a few chances to catch up.
    async fn requery_after_conflict(&self, task: &RecoveryTask) -> Result<Resolution> {
        let max_depth = self.inner.config.max_requery_depth;
        for depth in 1..=max_depth {
            tokio::time::sleep(self.inner.config.conflict_requery_delay()).await;
            let remote = self.inner.hosting.list_artifacts().await?;
            if self.backfill_match(task, &remote) {
                debug!(item_id = task.item_id, depth, "found artifact after conflict");
                return Ok(Resolution::Matched);
            }
        }
        self.inner.ledger.lock().release_pending(task.item_id);
        bail!(
            "artifact for {} reported as existing but not listed after {max_depth} re-queries",
            task.branch
        )
    }

    fn backfill_match(&self, task: &RecoveryTask, remote: &[RemoteArtifact]) -> bool {
        let candidate = self.candidate(task.item_id);
        let Some(found) = find_match(remote, task.item_id, &task.branch, candidate.as_ref())
        else {
            return false;
        };
        info!(
            item_id = task.item_id,
            number = found.number,
            "matched existing artifact"
        );
        self.inner.ledger.lock().backfill(task.item_id, found);
        true
    }

    fn finish(&self, item_id: u64, state: TaskState, last_error: Option<String>) {
        if let Some(mut task) = self.inner.queue.lock().remove(&item_id) {
            task.state = state;
            if last_error.is_some() {
                task.last_error = last_error;
            }
            self.inner.finished.lock().push(task);
        }
    }

    /// Count a failed attempt. Returns true when the task is exhausted.
    fn record_failure(&self, item_id: u64, detail: String) -> bool {
        let max_attempts = self.inner.config.max_attempts;
        let exhausted = {
            let mut queue = self.inner.queue.lock();
            let Some(task) = queue.get_mut(&item_id) else {
                return false;
            };
            task.attempts += 1;
            task.last_error = Some(detail.clone());
            if task.attempts >= max_attempts {
                true
            } else {
                let delay = chrono::Duration::from_std(self.inner.config.retry_delay())
                    .unwrap_or(chrono::Duration::zero());
                task.next_attempt_at = Utc::now() + delay;
                debug!(item_id, attempts = task.attempts, error = %detail, "reconciliation attempt failed");
                false
            }
        };
        if exhausted {
            warn!(item_id, attempts = max_attempts, error = %detail, "reconciliation exhausted");
            self.finish(item_id, TaskState::Failed, None);
        }
        exhausted
    }

    /// Run passes every `interval` until the handle is stopped.
    pub fn spawn(&self, interval: Duration) -> BackgroundTask {
        let manager = self.clone();
        BackgroundTask::every("reconcile", interval, move || {
            let manager = manager.clone();
            async move {
                let report = manager.run_pass().await;
                if !report.is_empty() {
                    info!(
                        matched = ?report.matched,
                        created = ?report.created,
                        retried = ?report.retried,
                        exhausted = ?report.exhausted,
                        "reconciliation pass"
                    );
                }
            }
        })
    }
}

/// Artifact that links `item_id` in its title or body, or whose head branch
/// is `branch`. The worker's candidate wins among several matches; on its
/// own it never makes an artifact match.
fn find_match<'a>(
    remote: &'a [RemoteArtifact],
    item_id: u64,
    branch: &str,
    candidate: Option<&ArtifactLink>,
) -> Option<&'a RemoteArtifact> {
    let related = |artifact: &&RemoteArtifact| {
        links_item(&artifact.title, item_id)
            || links_item(&artifact.body, item_id)
            || artifact.head_branch == branch
    };
    candidate
        .and_then(|link| {
            remote
                .iter()
                .filter(related)
                .find(|artifact| artifact.url == link.url)
        })
        .or_else(|| remote.iter().find(related))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(number: u64, body: &str, head: &str) -> RemoteArtifact {
        RemoteArtifact {
            number,
            url: format!("https://github.com/a/b/pull/{number}"),
            title: "change".to_string(),
            body: body.to_string(),
            head_branch: head.to_string(),
            state: "OPEN".to_string(),
        }
    }

    #[test]
    fn pending_reservation_blocks_nothing_until_concrete() {
        let mut ledger = ArtifactLedger::default();
        assert!(ledger.reserve_pending(42));
        assert!(!ledger.has_concrete(42));
        assert_eq!(ledger.get(42).map(|a| a.state), Some(ArtifactState::Pending));

        ledger.record_url(
            42,
            &ArtifactLink {
                url: "https://github.com/a/b/pull/7".to_string(),
                number: 7,
            },
        );
        assert!(ledger.has_concrete(42));
        assert!(!ledger.reserve_pending(42));
        ledger.release_pending(42);
        assert!(ledger.has_concrete(42));
    }

    #[test]
    fn backfill_keeps_remote_state() {
        let mut ledger = ArtifactLedger::default();
        let mut merged = remote(9, "Fixes #3", "item-3");
        merged.state = "MERGED".to_string();
        ledger.backfill(3, &merged);
        assert_eq!(ledger.get(3).map(|a| a.state), Some(ArtifactState::Merged));
    }

    #[test]
    fn matches_by_phrase_or_branch() {
        let list = vec![
            remote(1, "unrelated", "feature-x"),
            remote(2, "This resolves #42", "other"),
            remote(3, "", "item-7"),
        ];
        assert_eq!(find_match(&list, 42, "item-42", None).map(|a| a.number), Some(2));
        assert_eq!(find_match(&list, 7, "item-7", None).map(|a| a.number), Some(3));
        assert!(find_match(&list, 8, "item-8", None).is_none());
    }

    #[test]
    fn candidate_is_preferred_but_never_matches_alone() {
        let list = vec![
            remote(1, "unrelated", "feature-x"),
            remote(2, "Closes #42", "other"),
            remote(3, "", "item-42"),
        ];
        let link = |number: u64| ArtifactLink {
            url: format!("https://github.com/a/b/pull/{number}"),
            number,
        };
        let found = find_match(&list, 42, "item-42", Some(&link(3)));
        assert_eq!(found.map(|a| a.number), Some(3));
        // Listed but unrelated to the item.
        let found = find_match(&list, 42, "item-42", Some(&link(1)));
        assert_eq!(found.map(|a| a.number), Some(2));
        assert!(find_match(&list, 8, "item-8", Some(&link(1))).is_none());
    }

    #[test]
    fn candidate_stays_unconfirmed_until_backfilled() {
        let mut ledger = ArtifactLedger::default();
        let link = ArtifactLink {
            url: "https://github.com/other/repo/pull/5".to_string(),
            number: 5,
        };
        ledger.record_candidate(42, &link);
        assert!(!ledger.has_concrete(42));
        assert_eq!(ledger.candidate(42), Some(&link));

        ledger.backfill(42, &remote(6, "", "item-42"));
        assert!(ledger.has_concrete(42));
        assert_eq!(ledger.candidate(42), None);
    }
}
