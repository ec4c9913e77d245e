//! Shared domain types for the orchestration core.
//!
//! These types are plain data: serializable, clonable, and free of handles to
//! processes or locks so they can cross task boundaries and be persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Externally tracked unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
}

/// Lifecycle status of a deployed agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Starting,
    Working,
    Completed,
    Failed,
    Stopped,
    /// Assigned at load time to records persisted in a non-terminal state.
    Interrupted,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published on every applied status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub item_id: u64,
    pub status: AgentStatus,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    System,
    Text,
    ToolUse,
    ToolResult,
    Result,
    Stderr,
    /// Emitted by the orchestrator itself (deploy, stop, cleanup).
    Lifecycle,
    Unknown,
}

/// One captured entry in an agent's bounded log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub kind: LogKind,
    pub payload: String,
    pub at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(kind: LogKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactState {
    /// Creation reserved or in flight; no number or url yet.
    Pending,
    Open,
    Merged,
    Closed,
}

impl ArtifactState {
    /// Map a hosting-platform state string (`OPEN`, `MERGED`, ...) to a state.
    pub fn from_remote(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "merged" => Self::Merged,
            "closed" => Self::Closed,
            _ => Self::Open,
        }
    }
}

/// Hosted object (pull request) that closes out a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionArtifact {
    pub item_id: u64,
    pub number: Option<u64>,
    pub url: Option<String>,
    pub state: ArtifactState,
}

impl CompletionArtifact {
    pub fn pending(item_id: u64) -> Self {
        Self {
            item_id,
            number: None,
            url: None,
            state: ArtifactState::Pending,
        }
    }

    /// True once the artifact carries a concrete number.
    pub fn is_concrete(&self) -> bool {
        self.number.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Resolved,
    Failed,
}

/// Persisted view of an agent (see `io::agent_store`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub item_id: u64,
    pub status: AgentStatus,
    pub workspace: std::path::PathBuf,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}
