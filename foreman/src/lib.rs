//! Parallel coding-agent orchestrator.
//!
//! Each work item gets its own git worktree and branch, a worker process
//! streaming JSONL, and a lifecycle record. The architecture keeps the same
//! split throughout:
//!
//! - **[`core`]**: Pure logic (status machine, naming, health evaluation,
//!   message parsing, link detection). No I/O.
//! - **[`io`]**: Side effects (git, the hosting platform, worker processes,
//!   config and state files).
//!
//! Orchestration modules ([`workspace`], [`lifecycle`], [`health`],
//! [`reconcile`], [`orchestrator`]) coordinate the two, with [`repo_mutex`]
//! serializing every mutation of a repository's shared git metadata.

pub mod background;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod health;
pub mod io;
pub mod lifecycle;
pub mod logging;
pub mod orchestrator;
pub mod reconcile;
pub mod repo_mutex;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workspace;
