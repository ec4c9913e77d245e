//! Persisted agent records (`.foreman/state/agents.json`).
//!
//! The store is a snapshot of every agent the orchestrator has tracked, keyed
//! by item id. It backs the "is this id tracked" query used by the orphan
//! sweep and the `status` command.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::types::AgentRecord;
use crate::io::config::state_dir;

pub fn agents_path(root: &Path) -> PathBuf {
    state_dir(root).join("agents.json")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentStore {
    #[serde(default)]
    pub agents: BTreeMap<u64, AgentRecord>,
}

impl AgentStore {
    pub fn is_tracked(&self, item_id: u64) -> bool {
        self.agents.contains_key(&item_id)
    }

    pub fn upsert(&mut self, record: AgentRecord) {
        self.agents.insert(record.item_id, record);
    }

    pub fn remove(&mut self, item_id: u64) -> Option<AgentRecord> {
        self.agents.remove(&item_id)
    }

    /// Mark every record that was live when last written as interrupted.
    ///
    /// Returns the ids that changed.
    pub fn interrupt_live(&mut self) -> Vec<u64> {
        let mut changed = Vec::new();
        for record in self.agents.values_mut() {
            let next = record.status.on_restart();
            if next != record.status {
                record.status = next;
                record.error = Some("orchestrator restarted while agent was live".to_string());
                changed.push(record.item_id);
            }
        }
        changed
    }
}

/// Load the store, converting live records to interrupted.
///
/// A missing file is an empty store.
pub fn load_agent_store(path: &Path) -> Result<AgentStore> {
    if !path.exists() {
        debug!(path = %path.display(), "no agent store, starting empty");
        return Ok(AgentStore::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read agent store {}", path.display()))?;
    let mut store: AgentStore = serde_json::from_str(&contents)
        .with_context(|| format!("parse agent store {}", path.display()))?;
    let interrupted = store.interrupt_live();
    if !interrupted.is_empty() {
        info!(count = interrupted.len(), ids = ?interrupted, "marked stale agents interrupted");
    }
    Ok(store)
}

/// Atomically write the store (temp file + rename).
pub fn write_agent_store(path: &Path, store: &AgentStore) -> Result<()> {
    debug!(path = %path.display(), agents = store.agents.len(), "writing agent store");
    let mut buf = serde_json::to_string_pretty(store)?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("agent store path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp agent store {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace agent store {}", path.display()))?;
    Ok(())
}
