//! Stable exit codes for foreman CLI commands.

/// Every requested agent completed.
pub const OK: i32 = 0;
/// Invalid input, config, or an unexpected error.
pub const INVALID: i32 = 1;
/// At least one agent failed, was stopped, or could not be deployed.
pub const AGENT_FAILED: i32 = 2;
/// A completed agent's artifact could not be reconciled.
pub const RECONCILE_FAILED: i32 = 3;
/// Interrupted by ctrl-c; running agents were stopped.
pub const INTERRUPTED: i32 = 130;
