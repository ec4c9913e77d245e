//! Orchestrator configuration stored at `.foreman/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::health::HealthThresholds;
use crate::core::naming::{DEFAULT_BRANCH_MAX_LEN, MIN_BRANCH_MAX_LEN};

/// Directory (relative to the project root) holding config and state.
pub const FOREMAN_DIR: &str = ".foreman";

pub fn config_path(root: &Path) -> PathBuf {
    root.join(FOREMAN_DIR).join("config.toml")
}

pub fn state_dir(root: &Path) -> PathBuf {
    root.join(FOREMAN_DIR).join("state")
}

/// Orchestrator configuration (TOML).
///
/// Every section is optional; missing fields take the defaults below.
/// Durations are plain integers with the unit in the key name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForemanConfig {
    pub workspace: WorkspaceConfig,
    pub agent: AgentConfig,
    pub health: HealthConfig,
    pub reconcile: ReconcileConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory under the project root that holds `item-<id>` worktrees.
    pub workspaces_dir: String,
    pub branch_max_len: usize,
    /// Untracked local files copied from the root into each new workspace.
    pub copy_files: Vec<String>,
    pub remove_attempts: u32,
    /// Linear backoff step between `worktree remove` attempts.
    pub remove_backoff_ms: u64,
    /// Pause before verifying a removed directory is gone.
    pub settle_ms: u64,
    pub git_timeout_secs: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            workspaces_dir: "workspaces".to_string(),
            branch_max_len: DEFAULT_BRANCH_MAX_LEN,
            copy_files: vec![
                ".env".to_string(),
                ".env.local".to_string(),
                ".claude/settings.local.json".to_string(),
            ],
            remove_attempts: 3,
            remove_backoff_ms: 250,
            settle_ms: 200,
            git_timeout_secs: 120,
        }
    }
}

impl WorkspaceConfig {
    pub fn remove_backoff(&self) -> Duration {
        Duration::from_millis(self.remove_backoff_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Most recent log entries kept per agent.
    pub log_cap: usize,
    /// Appends between trims of the log buffer.
    pub log_trim_interval: usize,
    /// Delay between a successful completion and workspace cleanup.
    pub cleanup_delay_ms: u64,
    /// How long `stop` waits for the stream consumer to finish.
    pub stop_grace_ms: u64,
    /// Buffered status events per subscriber.
    pub event_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_cap: 500,
            log_trim_interval: 50,
            cleanup_delay_ms: 5_000,
            stop_grace_ms: 3_000,
            event_capacity: 256,
        }
    }
}

impl AgentConfig {
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub max_runtime_secs: u64,
    pub max_errors: u32,
    pub stuck_after_secs: u64,
    /// Prior error count at which automatic restarts stop being allowed.
    pub max_restart_errors: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_runtime_secs: 60 * 60,
            max_errors: 10,
            stuck_after_secs: 5 * 60,
            max_restart_errors: 3,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            max_runtime: Duration::from_secs(self.max_runtime_secs),
            max_errors: self.max_errors,
            stuck_after: Duration::from_secs(self.stuck_after_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// Wait before re-querying after the platform reports a duplicate.
    pub conflict_requery_delay_ms: u64,
    pub max_requery_depth: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_attempts: 3,
            retry_delay_ms: 30_000,
            conflict_requery_delay_ms: 2_000,
            max_requery_depth: 2,
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn conflict_requery_delay(&self) -> Duration {
        Duration::from_millis(self.conflict_requery_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Program and leading arguments, e.g. `["claude"]`.
    pub command: Vec<String>,
    /// Flag that precedes the prompt argument.
    pub prompt_flag: String,
    /// Arguments appended after the prompt.
    pub args: Vec<String>,
    /// Buffered messages between the worker reader and the consumer.
    pub channel_capacity: usize,
    /// Stderr lines kept for synthetic failure results.
    pub stderr_tail_lines: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string()],
            prompt_flag: "-p".to_string(),
            args: vec![
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
            channel_capacity: 256,
            stderr_tail_lines: 20,
        }
    }
}

impl ForemanConfig {
    pub fn validate(&self) -> Result<()> {
        let ws = &self.workspace;
        if ws.workspaces_dir.trim().is_empty() {
            return Err(anyhow!("workspace.workspaces_dir must be non-empty"));
        }
        if Path::new(&ws.workspaces_dir).is_absolute() {
            return Err(anyhow!("workspace.workspaces_dir must be relative"));
        }
        if ws.branch_max_len < MIN_BRANCH_MAX_LEN {
            return Err(anyhow!(
                "workspace.branch_max_len must be >= {MIN_BRANCH_MAX_LEN}"
            ));
        }
        if ws.remove_attempts == 0 {
            return Err(anyhow!("workspace.remove_attempts must be > 0"));
        }
        if ws.git_timeout_secs == 0 {
            return Err(anyhow!("workspace.git_timeout_secs must be > 0"));
        }
        if self.agent.log_cap == 0 || self.agent.log_trim_interval == 0 {
            return Err(anyhow!("agent.log_cap and agent.log_trim_interval must be > 0"));
        }
        if self.agent.event_capacity == 0 {
            return Err(anyhow!("agent.event_capacity must be > 0"));
        }
        if self.health.interval_secs == 0 {
            return Err(anyhow!("health.interval_secs must be > 0"));
        }
        if self.reconcile.interval_secs == 0 {
            return Err(anyhow!("reconcile.interval_secs must be > 0"));
        }
        if self.reconcile.max_attempts == 0 {
            return Err(anyhow!("reconcile.max_attempts must be > 0"));
        }
        if self.worker.command.is_empty() || self.worker.command[0].trim().is_empty() {
            return Err(anyhow!("worker.command must be a non-empty array"));
        }
        if self.worker.channel_capacity == 0 {
            return Err(anyhow!("worker.channel_capacity must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForemanConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForemanConfig> {
    if !path.exists() {
        let cfg = ForemanConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForemanConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ForemanConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
