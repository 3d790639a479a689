//! Task records and the work contract.
//!
//! A task is one attempt-sequence for a unit of work. The stored record
//! carries everything the runner needs to drive the attempt lifecycle and
//! everything recovery needs to reschedule after a restart.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use thiserror::Error;

use crate::backoff::RetryPolicy;

/// Failure signal returned by a work callback. Retryable failures are
/// transient conditions (rate limits, timeouts, network errors) eligible for
/// another attempt; fatal failures are permanent and end the task
/// immediately regardless of remaining attempts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

/// One logical unit of work, invoked once per attempt. Implementations must
/// tolerate re-invocation across attempts; side effects that must run at
/// most once belong behind an idempotency key.
#[async_trait]
pub trait Work: Send + Sync {
    async fn run(&self) -> Result<Vec<u8>, WorkError>;
}

/// Discriminant for task state kinds, independent of timestamps.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize, PartialEq, Eq, Copy)]
#[archive(check_bytes)]
pub enum TaskStateKind {
    Pending,
    Running,
    Succeeded,
    FailedTerminal,
}

/// Task state lifecycle. `Pending` and `Running` alternate while attempts
/// remain; `Succeeded` and `FailedTerminal` are the only terminal states a
/// caller ever observes.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum TaskState {
    Pending { next_run_at_ms: i64 },
    Running { started_at_ms: i64 },
    Succeeded { finished_at_ms: i64, result: Vec<u8> },
    FailedTerminal { finished_at_ms: i64, error_code: String },
}

impl TaskState {
    pub fn kind(&self) -> TaskStateKind {
        match self {
            TaskState::Pending { .. } => TaskStateKind::Pending,
            TaskState::Running { .. } => TaskStateKind::Running,
            TaskState::Succeeded { .. } => TaskStateKind::Succeeded,
            TaskState::FailedTerminal { .. } => TaskStateKind::FailedTerminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded { .. } | TaskState::FailedTerminal { .. }
        )
    }
}

impl fmt::Display for TaskStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStateKind::Pending => "pending",
            TaskStateKind::Running => "running",
            TaskStateKind::Succeeded => "succeeded",
            TaskStateKind::FailedTerminal => "failed_terminal",
        };
        f.write_str(s)
    }
}

/// Stored representation of one task's attempt sequence.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct TaskRecord {
    pub id: String,
    /// 0-based count of attempts that have failed so far.
    pub attempt: u32,
    pub state: TaskState,
    pub policy: RetryPolicy,
    /// Opaque caller payload, available to work resolvers at recovery.
    pub payload: Vec<u8>,
    pub idempotency_key: Option<String>,
    pub batch_id: Option<String>,
    /// Last observed error message, retained across retries for diagnostics.
    pub last_error: Option<String>,
}

impl TaskRecord {
    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }
}

/// Submission parameters for a task. `id` defaults to a fresh UUID and
/// `start_at_ms` to now.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub id: Option<String>,
    pub payload: Vec<u8>,
    pub policy: RetryPolicy,
    pub idempotency_key: Option<String>,
    pub batch_id: Option<String>,
    pub start_at_ms: Option<i64>,
}

/// Convenience for wrapping an async closure-style work source used by
/// tests and the simulation harness.
pub struct WorkFn<F>(pub F);

#[async_trait]
impl<F, Fut> Work for WorkFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Vec<u8>, WorkError>> + Send,
{
    async fn run(&self) -> Result<Vec<u8>, WorkError> {
        (self.0)().await
    }
}

/// Box an async closure into a shareable work handle.
pub fn work_fn<F, Fut>(f: F) -> Arc<dyn Work>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Vec<u8>, WorkError>> + Send + 'static,
{
    Arc::new(WorkFn(f))
}
