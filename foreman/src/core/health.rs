//! Pure health evaluation shared by periodic polling and on-demand snapshots.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::AgentStatus;

/// Inputs needed to judge one agent's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentActivity {
    pub item_id: u64,
    pub status: AgentStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub error_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub max_runtime: Duration,
    pub max_errors: u32,
    pub stuck_after: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_runtime: Duration::from_secs(60 * 60),
            max_errors: 10,
            stuck_after: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Restart,
    Investigate,
}

impl Recommendation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Investigate => "investigate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum HealthIssue {
    RuntimeExceeded { runtime_secs: u64, limit_secs: u64 },
    TooManyErrors { errors: u32, limit: u32 },
    Stuck { idle_secs: u64, limit_secs: u64 },
}

impl HealthIssue {
    fn recommendation(&self) -> Recommendation {
        match self {
            Self::RuntimeExceeded { .. } | Self::Stuck { .. } => Recommendation::Restart,
            Self::TooManyErrors { .. } => Recommendation::Investigate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub item_id: u64,
    pub is_healthy: bool,
    pub idle: Duration,
    pub runtime: Duration,
    pub error_count: u32,
    pub issues: Vec<HealthIssue>,
    pub recommendation: Option<Recommendation>,
}

/// Judge one agent against `thresholds` as of `now`.
///
/// When issues disagree, `restart` wins over `investigate`.
pub fn evaluate(
    activity: &AgentActivity,
    thresholds: &HealthThresholds,
    now: DateTime<Utc>,
) -> HealthReport {
    let runtime = elapsed(activity.started_at, now);
    let idle = elapsed(activity.last_activity, now);

    let mut issues = Vec::new();
    if runtime > thresholds.max_runtime {
        issues.push(HealthIssue::RuntimeExceeded {
            runtime_secs: runtime.as_secs(),
            limit_secs: thresholds.max_runtime.as_secs(),
        });
    }
    if activity.error_count > thresholds.max_errors {
        issues.push(HealthIssue::TooManyErrors {
            errors: activity.error_count,
            limit: thresholds.max_errors,
        });
    }
    if idle > thresholds.stuck_after {
        issues.push(HealthIssue::Stuck {
            idle_secs: idle.as_secs(),
            limit_secs: thresholds.stuck_after.as_secs(),
        });
    }

    let recommendation = issues
        .iter()
        .map(HealthIssue::recommendation)
        .min_by_key(|rec| match rec {
            Recommendation::Restart => 0,
            Recommendation::Investigate => 1,
        });

    HealthReport {
        item_id: activity.item_id,
        is_healthy: issues.is_empty(),
        idle,
        runtime,
        error_count: activity.error_count,
        issues,
        recommendation,
    }
}

/// Caller-side auto-restart policy.
///
/// Acting on a `restart` recommendation is allowed only while the item's
/// error count from its previous run stays below `max_prior_errors`, which
/// stops an agent that keeps failing from being restarted forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartGate {
    pub max_prior_errors: u32,
}

impl RestartGate {
    pub fn allows(&self, report: &HealthReport, prior_errors: u32) -> bool {
        report.recommendation == Some(Recommendation::Restart)
            && prior_errors < self.max_prior_errors
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}
