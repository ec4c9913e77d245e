//! Side-effecting adapters: processes, git, the hosting platform, the worker
//! backend, and on-disk config and state.

pub mod agent_store;
pub mod config;
pub mod git;
pub mod hosting;
pub mod instructions;
pub mod process;
pub mod worker;
