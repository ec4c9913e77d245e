//! Deterministic, pure logic shared by the orchestration layer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and take the current time as an argument where it matters, so tests
//! can drive them without processes, clocks, or a repository.

pub mod health;
pub mod linking;
pub mod log_buffer;
pub mod message;
pub mod naming;
pub mod status;
pub mod strategy;
pub mod types;
