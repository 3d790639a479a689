//! redrive - durable retry-task scheduling.
//!
//! A library-level core meant to be embedded inside a host runtime: tasks
//! are driven through bounded attempts with jittered exponential backoff,
//! side effects are guarded at-most-once by an idempotency ledger, and
//! fan-out batches aggregate item completions into a single completion
//! event. Persistence and delayed re-invocation are collaborator traits
//! (`storage::Storage`, `scheduler::Scheduler`) supplied by the host;
//! in-memory and tokio-backed implementations ship in-crate.

pub mod backoff;
pub mod batch;
pub mod clock;
pub mod codec;
pub mod keys;
pub mod ledger;
pub mod metrics;
pub mod runner;
pub mod scheduler;
pub mod settings;
pub mod storage;
pub mod task;
pub mod trace;

pub use redrive_macros::test;
