//! The owning instance that wires provisioning, lifecycle, health, and
//! reconciliation together for one project root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::background::BackgroundTask;
use crate::core::health::{HealthReport, Recommendation, RestartGate};
use crate::health::HealthMonitor;
use crate::io::agent_store::{agents_path, load_agent_store, write_agent_store};
use crate::io::config::ForemanConfig;
use crate::io::hosting::HostingPlatform;
use crate::io::worker::WorkerLauncher;
use crate::lifecycle::{AgentManager, AgentSnapshot, ManagerParts, StoreHandle};
use crate::reconcile::{PassReport, ReconciliationManager};
use crate::repo_mutex::RepoMutex;
use crate::workspace::{DestroyReport, SweepReport, WorkspaceProvisioner};

/// Background loops started by [`Orchestrator::start_background`].
pub struct Background {
    pub health: BackgroundTask,
    pub reconcile: BackgroundTask,
}

impl Background {
    pub async fn stop(self) {
        self.health.stop().await;
        self.reconcile.stop().await;
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    root: PathBuf,
    config: ForemanConfig,
    manager: AgentManager,
    reconciler: ReconciliationManager,
    restart_gate: RestartGate,
    /// Error count of each item's previous run, for the restart gate.
    prior_errors: Arc<Mutex<HashMap<u64, u32>>>,
    restarts_in_flight: Arc<AtomicUsize>,
}

impl Orchestrator {
    /// Build an orchestrator for the git checkout at `root`.
    ///
    /// Loads persisted agent records (live ones become interrupted) when
    /// `persist` is set.
    pub fn new(
        root: &Path,
        config: ForemanConfig,
        hosting: Arc<dyn HostingPlatform>,
        launcher: Arc<dyn WorkerLauncher>,
        persist: bool,
    ) -> Result<Self> {
        config.validate()?;
        let repo_mutex = RepoMutex::new();
        let provisioner =
            WorkspaceProvisioner::new(root, config.workspace.clone(), repo_mutex.clone())?;
        let root = provisioner.root().to_path_buf();

        let store = if persist {
            let path = agents_path(&root);
            let store = load_agent_store(&path)
                .with_context(|| format!("load agent records for {}", root.display()))?;
            if !store.agents.is_empty() {
                write_agent_store(&path, &store)?;
            }
            Some(StoreHandle { path, store })
        } else {
            None
        };

        let reconciler = ReconciliationManager::new(Arc::clone(&hosting), config.reconcile.clone());
        let manager = AgentManager::new(ManagerParts {
            provisioner,
            repo_mutex,
            hosting,
            launcher,
            reconciler: reconciler.clone(),
            config: config.agent.clone(),
            store,
        });
        let restart_gate = RestartGate {
            max_prior_errors: config.health.max_restart_errors,
        };

        Ok(Self {
            root,
            config,
            manager,
            reconciler,
            restart_gate,
            prior_errors: Arc::new(Mutex::new(HashMap::new())),
            restarts_in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ForemanConfig {
        &self.config
    }

    pub fn manager(&self) -> &AgentManager {
        &self.manager
    }

    pub fn reconciler(&self) -> &ReconciliationManager {
        &self.reconciler
    }

    pub fn provisioner(&self) -> &WorkspaceProvisioner {
        self.manager.provisioner()
    }

    pub fn health(&self) -> HealthMonitor {
        HealthMonitor::new(self.manager.clone(), self.config.health.thresholds())
    }

    /// Forget finished agents from earlier runs so the next sweep can reclaim
    /// their workspaces.
    pub async fn drop_inactive(&self) -> Vec<u64> {
        let dropped = self.manager.drop_inactive().await;
        if !dropped.is_empty() {
            info!(ids = ?dropped, "dropped inactive agent records");
        }
        dropped
    }

    /// Destroy workspaces and branches with no tracked agent.
    #[instrument(skip_all)]
    pub async fn startup_sweep(&self) -> SweepReport {
        let manager = self.manager.clone();
        self.provisioner()
            .sweep_orphans(move |id| manager.is_tracked(id))
            .await
    }

    pub async fn deploy(&self, item_id: u64, context: Option<String>) -> Result<AgentSnapshot> {
        self.manager.deploy(item_id, context).await
    }

    pub async fn stop(&self, item_id: u64) -> Result<DestroyReport> {
        self.manager.stop(item_id).await
    }

    /// Stop and redeploy an agent with its original context, if the restart
    /// gate allows it.
    #[instrument(skip_all, fields(item_id))]
    pub async fn restart(&self, item_id: u64) -> Result<Option<AgentSnapshot>> {
        let Some(current) = self.manager.get_status(item_id) else {
            return Ok(None);
        };
        let prior = self
            .prior_errors
            .lock()
            .get(&item_id)
            .copied()
            .unwrap_or(0);
        if prior >= self.restart_gate.max_prior_errors {
            warn!(prior, "restart refused, previous run had too many errors");
            return Ok(None);
        }
        let context = self.manager.context(item_id);
        self.manager.stop(item_id).await?;
        self.prior_errors
            .lock()
            .insert(item_id, prior.max(current.error_count));
        info!("redeploying agent");
        self.manager.deploy(item_id, context).await.map(Some)
    }

    fn on_health_report(&self, report: HealthReport) {
        if report.recommendation != Some(Recommendation::Restart) {
            return;
        }
        let prior = self
            .prior_errors
            .lock()
            .get(&report.item_id)
            .copied()
            .unwrap_or(0);
        if !self.restart_gate.allows(&report, prior) {
            debug!(item_id = report.item_id, prior, "restart gated");
            return;
        }
        let orchestrator = self.clone();
        let item_id = report.item_id;
        self.restarts_in_flight.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            if let Err(err) = orchestrator.restart(item_id).await {
                warn!(item_id, err = %format!("{err:#}"), "automatic restart failed");
            }
            orchestrator.restarts_in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Start the health and reconciliation loops.
    ///
    /// With `auto_restart`, agents the health sweep recommends restarting are
    /// restarted while the restart gate allows it.
    pub fn start_background(&self, auto_restart: bool) -> Background {
        let orchestrator = self.clone();
        let health = HealthMonitor::spawn(
            self.manager.clone(),
            &self.config.health,
            move |report| {
                if auto_restart {
                    orchestrator.on_health_report(report);
                }
            },
        );
        let reconcile = self.reconciler.spawn(self.config.reconcile.interval());
        Background { health, reconcile }
    }

    /// Queue any completed agents that still lack an artifact and run passes
    /// until the queue is empty.
    pub async fn drain_reconciliation(&self) -> Vec<PassReport> {
        self.reconciler.scan(self.manager.completed_agents());
        let mut reports = Vec::new();
        while !self.reconciler.is_drained() {
            let report = self.reconciler.run_pass().await;
            if !report.skipped && !report.is_empty() {
                reports.push(report);
            }
            if self.reconciler.is_drained() {
                break;
            }
            tokio::time::sleep(self.until_next_due()).await;
        }
        reports
    }

    fn until_next_due(&self) -> Duration {
        let floor = Duration::from_millis(10);
        self.reconciler
            .next_due()
            .and_then(|due| (due - chrono::Utc::now()).to_std().ok())
            .map_or(floor, |wait| wait.max(floor))
    }

    /// Wait for every agent to finish, then drain reconciliation.
    pub async fn run_until_settled(&self) -> Vec<PassReport> {
        loop {
            self.manager.wait_settled().await;
            // A restart briefly leaves no live agent between stop and redeploy.
            if self.restarts_in_flight.load(Ordering::Acquire) == 0 && self.manager.all_terminal()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.drain_reconciliation().await
    }

    pub async fn shutdown(&self) {
        self.manager.stop_all().await;
    }
}
