//! Typed failure taxonomy for the orchestration layer.
//!
//! Fallible functions return `anyhow::Result` with context attached. When a
//! caller needs to branch on the failure class it recovers the typed error with
//! `err.downcast_ref::<ForemanError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForemanError {
    /// Bad path, branch, or id. Raised before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    /// External command exited nonzero. Retried at the call site with bounds.
    #[error("`{command}` failed: {detail}")]
    TransientTool { command: String, detail: String },

    /// An expected directory was missing or unexpectedly present.
    #[error("workspace state: {0}")]
    WorkspaceState(String),

    /// Worker could not start or ended without a usable result.
    #[error("worker {0}")]
    Subprocess(String),

    /// Reconciliation gave up on an orphaned completion.
    #[error("recovery for item {item_id} exhausted after {attempts} attempts: {last_error}")]
    RecoveryExhausted {
        item_id: u64,
        attempts: u32,
        last_error: String,
    },

    #[error("agent for item {0} is already running")]
    AlreadyRunning(u64),

    #[error("no agent tracked for item {0}")]
    NotFound(u64),
}

impl ForemanError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True if `err` wraps a [`ForemanError::Validation`].
    pub fn is_validation(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<ForemanError>(),
            Some(ForemanError::Validation(_))
        )
    }
}
