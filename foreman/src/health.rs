//! Periodic health sweeps over running agents.
//!
//! The monitor only observes: it evaluates each non-terminal agent with
//! [`core::health::evaluate`](crate::core::health::evaluate) and hands the
//! report to a caller-supplied callback. Acting on a recommendation is the
//! caller's decision.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::background::BackgroundTask;
use crate::core::health::{HealthReport, HealthThresholds, evaluate};
use crate::io::config::HealthConfig;
use crate::lifecycle::AgentManager;

#[derive(Clone)]
pub struct HealthMonitor {
    manager: AgentManager,
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(manager: AgentManager, thresholds: HealthThresholds) -> Self {
        Self {
            manager,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Evaluate every running agent now.
    pub fn snapshot(&self) -> Vec<HealthReport> {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> Vec<HealthReport> {
        self.manager
            .activities()
            .iter()
            .map(|activity| evaluate(activity, &self.thresholds, now))
            .collect()
    }

    /// Poll every `config.interval_secs` and pass each report to `callback`.
    pub fn spawn<F>(manager: AgentManager, config: &HealthConfig, callback: F) -> BackgroundTask
    where
        F: Fn(HealthReport) + Send + Sync + 'static,
    {
        let monitor = Self::new(manager, config.thresholds());
        let callback = Arc::new(callback);
        BackgroundTask::every("health", config.interval(), move || {
            let monitor = monitor.clone();
            let callback = Arc::clone(&callback);
            async move {
                let reports = monitor.snapshot();
                debug!(agents = reports.len(), "health sweep");
                for report in reports {
                    if !report.is_healthy {
                        warn!(
                            item_id = report.item_id,
                            issues = ?report.issues,
                            recommendation = report.recommendation.map(|r| r.as_str()),
                            "unhealthy agent"
                        );
                    }
                    callback(report);
                }
            }
        })
    }
}
