//! Retry task runner - drives a task through bounded attempts.
//!
//! The runner owns every `TaskRecord` state transition. Each attempt is one
//! scheduler re-entry: load the record, mark it running, invoke the work
//! callback, and durably record the outcome before anything else may
//! re-dispatch the task. Backoff intervals are suspension points, not
//! sleeps; between attempts the only trace of the task is its stored record
//! and one scheduled callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::compute_delay_ms;
use crate::clock::Clock;
use crate::codec::{decode_task_record, encode_task_record, CodecError};
use crate::keys::{task_key, TASK_PREFIX};
use crate::ledger::{Begin, IdempotencyLedger, LedgerError};
use crate::metrics::Metrics;
use crate::scheduler::{self, ScheduleHandle, Scheduler};
use crate::storage::{Storage, StorageError};
use crate::task::{TaskRecord, TaskSpec, TaskState, TaskStateKind, Work, WorkError};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("task already exists with id {0}")]
    TaskAlreadyExists(String),
    #[error("task not found with id {0}")]
    TaskNotFound(String),
    #[error("task {0} is already in terminal state {1}")]
    TaskAlreadyTerminal(String, TaskStateKind),
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(&'static str),
}

/// Fired exactly once when a task reaches a terminal state.
pub type CompletionHook = Box<dyn FnOnce(&TaskRecord) + Send>;

/// Maps a stored record back to its work implementation during recovery.
/// Closures are not durable, so the host re-supplies them from the record's
/// payload.
pub type WorkResolver = dyn Fn(&TaskRecord) -> Option<Arc<dyn Work>> + Send + Sync;

struct ActiveTask {
    work: Arc<dyn Work>,
    on_terminal: Option<CompletionHook>,
    schedule: Option<ScheduleHandle>,
}

/// Drives tasks through bounded retries with backoff, producing exactly one
/// terminal outcome per task.
pub struct TaskRunner {
    storage: Arc<dyn Storage>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    ledger: IdempotencyLedger,
    metrics: Option<Metrics>,
    jitter: Mutex<StdRng>,
    active: Mutex<HashMap<String, ActiveTask>>,
}

impl TaskRunner {
    pub fn new(
        storage: Arc<dyn Storage>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        metrics: Option<Metrics>,
    ) -> Arc<Self> {
        let ledger = IdempotencyLedger::new(Arc::clone(&storage), Arc::clone(&clock));
        Arc::new(Self {
            storage,
            scheduler,
            clock,
            ledger,
            metrics,
            jitter: Mutex::new(StdRng::from_entropy()),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Submit a task. Creates the durable record (rejecting duplicate ids),
    /// registers the work callback, and schedules the first attempt at
    /// `spec.start_at_ms` or now, whichever is later.
    pub async fn submit(
        self: &Arc<Self>,
        spec: TaskSpec,
        work: Arc<dyn Work>,
        on_terminal: Option<CompletionHook>,
    ) -> Result<String, RunnerError> {
        if spec.policy.max_attempts == 0 {
            return Err(RunnerError::InvalidPolicy("max_attempts must be positive"));
        }
        let id = spec.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = self.clock.now_epoch_ms();
        let first_run_at = spec.start_at_ms.unwrap_or(now).max(now);
        let record = TaskRecord {
            id: id.clone(),
            attempt: 0,
            state: TaskState::Pending {
                next_run_at_ms: first_run_at,
            },
            policy: spec.policy,
            payload: spec.payload,
            idempotency_key: spec.idempotency_key,
            batch_id: spec.batch_id,
            last_error: None,
        };
        let encoded = encode_task_record(&record)?;
        match self.storage.create(&task_key(&id), &encoded).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists(_)) => {
                return Err(RunnerError::TaskAlreadyExists(id));
            }
            Err(e) => return Err(e.into()),
        }
        self.active.lock().unwrap().insert(
            id.clone(),
            ActiveTask {
                work,
                on_terminal,
                schedule: None,
            },
        );
        if let Some(m) = &self.metrics {
            m.record_submit();
        }
        debug!(task_id = %id, next_run_at_ms = first_run_at, "task submitted");
        self.schedule_attempt(&id, first_run_at);
        Ok(id)
    }

    /// Cancel a task. A `Pending` task has its scheduled invocation removed
    /// and reaches `FailedTerminal` with error code `cancelled`; returns
    /// `Ok(true)`. A `Running` task is left to finish its in-flight attempt
    /// (best-effort cancellation); returns `Ok(false)`.
    pub async fn cancel(&self, id: &str) -> Result<bool, RunnerError> {
        let key = task_key(id);
        let raw = self
            .storage
            .get(&key)
            .await?
            .ok_or_else(|| RunnerError::TaskNotFound(id.to_string()))?;
        let mut record = decode_task_record(&raw)?;
        match record.state {
            TaskState::Pending { .. } => {
                let entry = self.active.lock().unwrap().remove(id);
                if let Some(entry) = &entry {
                    if let Some(handle) = &entry.schedule {
                        self.scheduler.cancel(handle);
                    }
                }
                record.state = TaskState::FailedTerminal {
                    finished_at_ms: self.clock.now_epoch_ms(),
                    error_code: "cancelled".to_string(),
                };
                record.last_error = Some("cancelled before execution".to_string());
                self.storage.put(&key, &encode_task_record(&record)?).await?;
                if let Some(m) = &self.metrics {
                    m.record_completion("cancelled");
                }
                info!(task_id = %id, "task cancelled");
                if let Some(entry) = entry {
                    if let Some(hook) = entry.on_terminal {
                        hook(&record);
                    }
                }
                Ok(true)
            }
            TaskState::Running { .. } => {
                debug!(task_id = %id, "cancel requested while attempt in flight");
                Ok(false)
            }
            TaskState::Succeeded { .. } | TaskState::FailedTerminal { .. } => Err(
                RunnerError::TaskAlreadyTerminal(id.to_string(), record.state.kind()),
            ),
        }
    }

    /// Reload stored tasks after a restart. `Pending` records are
    /// rescheduled at their recorded time (or now, if overdue); `Running`
    /// records are crashed attempts and are re-driven immediately - the
    /// attempt never reported, and the idempotency ledger keeps any side
    /// effects at-most-once. Returns the number of tasks rescheduled.
    pub async fn recover(self: &Arc<Self>, resolve: &WorkResolver) -> Result<usize, RunnerError> {
        let now = self.clock.now_epoch_ms();
        let mut recovered = 0usize;
        for (key, raw) in self.storage.scan_prefix(TASK_PREFIX).await? {
            let mut record = match decode_task_record(&raw) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping undecodable task record");
                    continue;
                }
            };
            let next_run_at = match record.state {
                TaskState::Pending { next_run_at_ms } => next_run_at_ms.max(now),
                TaskState::Running { .. } => now,
                TaskState::Succeeded { .. } | TaskState::FailedTerminal { .. } => continue,
            };
            let Some(work) = resolve(&record) else {
                warn!(task_id = %record.id, "no work resolved for stored task");
                continue;
            };
            if matches!(record.state, TaskState::Running { .. }) {
                record.state = TaskState::Pending {
                    next_run_at_ms: next_run_at,
                };
                self.storage.put(&key, &encode_task_record(&record)?).await?;
            }
            self.active.lock().unwrap().insert(
                record.id.clone(),
                ActiveTask {
                    work,
                    on_terminal: None,
                    schedule: None,
                },
            );
            self.schedule_attempt(&record.id, next_run_at);
            recovered += 1;
        }
        if recovered > 0 {
            info!(count = recovered, "recovered stored tasks");
        }
        Ok(recovered)
    }

    /// Fetch a task record by id.
    pub async fn task(&self, id: &str) -> Result<Option<TaskRecord>, RunnerError> {
        match self.storage.get(&task_key(id)).await? {
            Some(raw) => Ok(Some(decode_task_record(&raw)?)),
            None => Ok(None),
        }
    }

    /// List all task records.
    pub async fn tasks(&self) -> Result<Vec<TaskRecord>, RunnerError> {
        let mut out = Vec::new();
        for (_, raw) in self.storage.scan_prefix(TASK_PREFIX).await? {
            out.push(decode_task_record(&raw)?);
        }
        Ok(out)
    }

    fn schedule_attempt(self: &Arc<Self>, id: &str, when_ms: i64) {
        let runner = Arc::clone(self);
        let task_id = id.to_string();
        let handle = self.scheduler.schedule_at(
            when_ms,
            scheduler::callback(move || async move {
                runner.run_due(task_id).await;
            }),
        );
        if let Some(entry) = self.active.lock().unwrap().get_mut(id) {
            entry.schedule = Some(handle);
        }
    }

    async fn run_due(self: Arc<Self>, id: String) {
        if let Err(err) = self.run_attempt(&id).await {
            error!(task_id = %id, error = %err, "task attempt did not complete cleanly");
        }
    }

    async fn run_attempt(self: &Arc<Self>, id: &str) -> Result<(), RunnerError> {
        let key = task_key(id);
        let raw = self
            .storage
            .get(&key)
            .await?
            .ok_or_else(|| RunnerError::TaskNotFound(id.to_string()))?;
        let mut record = decode_task_record(&raw)?;
        match record.state {
            TaskState::Pending { .. } => {}
            ref state => {
                // Cancelled or completed between scheduling and firing.
                debug!(task_id = %id, state = %state.kind(), "skipping run for non-pending task");
                return Ok(());
            }
        }

        let now = self.clock.now_epoch_ms();
        record.state = TaskState::Running { started_at_ms: now };
        self.storage.put(&key, &encode_task_record(&record)?).await?;

        if let Some(m) = &self.metrics {
            m.record_attempt(record.attempt > 0);
        }
        debug!(task_id = %id, attempt = record.attempt, "attempt started");

        let work = {
            let active = self.active.lock().unwrap();
            active.get(id).map(|entry| Arc::clone(&entry.work))
        };
        let Some(work) = work else {
            // The record exists but nothing can run it; a contract
            // violation, reported terminally rather than stalling forever.
            return self
                .finish_failure(
                    record,
                    "work-not-registered",
                    "no work registered at attempt time".to_string(),
                )
                .await;
        };

        let mut claimed_key: Option<String> = None;
        if let Some(idem_key) = record.idempotency_key.clone() {
            match self.ledger.begin_or_reuse(&idem_key).await {
                Ok(Begin::New) => {
                    if let Some(m) = &self.metrics {
                        m.record_ledger_begin("new");
                    }
                    claimed_key = Some(idem_key);
                }
                Ok(Begin::Replayed(result)) => {
                    if let Some(m) = &self.metrics {
                        m.record_ledger_begin("replayed");
                    }
                    debug!(task_id = %id, "replaying completed idempotent result");
                    return self.finish_success(record, result).await;
                }
                Err(LedgerError::DuplicateInFlight(_)) => {
                    if let Some(m) = &self.metrics {
                        m.record_ledger_begin("in_flight");
                    }
                    return self
                        .handle_retryable(record, "operation in flight elsewhere".to_string())
                        .await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        match work.run().await {
            Ok(result) => {
                if let Some(idem_key) = claimed_key {
                    self.ledger.complete(&idem_key, &result).await?;
                }
                self.finish_success(record, result).await
            }
            Err(WorkError::Retryable(msg)) => {
                if let Some(idem_key) = claimed_key {
                    self.ledger.abandon(&idem_key).await?;
                }
                self.handle_retryable(record, msg).await
            }
            Err(WorkError::Fatal(msg)) => {
                if let Some(idem_key) = claimed_key {
                    self.ledger.abandon(&idem_key).await?;
                }
                self.finish_failure(record, "fatal", msg).await
            }
        }
    }

    async fn handle_retryable(
        self: &Arc<Self>,
        mut record: TaskRecord,
        message: String,
    ) -> Result<(), RunnerError> {
        let failed_attempt = record.attempt;
        record.last_error = Some(message.clone());
        if failed_attempt + 1 >= record.policy.max_attempts {
            return self
                .finish_failure(record, "exhausted-retries", message)
                .await;
        }

        let now = self.clock.now_epoch_ms();
        let delay_ms = {
            let mut rng = self.jitter.lock().unwrap();
            compute_delay_ms(failed_attempt, &record.policy, &mut *rng)
        };
        let next_run_at = now.saturating_add(delay_ms);
        record.attempt = failed_attempt + 1;
        record.state = TaskState::Pending {
            next_run_at_ms: next_run_at,
        };
        self.storage
            .put(&task_key(&record.id), &encode_task_record(&record)?)
            .await?;
        if let Some(m) = &self.metrics {
            m.record_retry_scheduled(delay_ms);
        }
        debug!(
            task_id = %record.id,
            attempt = record.attempt,
            delay_ms,
            error = %message,
            "retry scheduled"
        );
        self.schedule_attempt(&record.id, next_run_at);
        Ok(())
    }

    async fn finish_success(
        &self,
        mut record: TaskRecord,
        result: Vec<u8>,
    ) -> Result<(), RunnerError> {
        record.state = TaskState::Succeeded {
            finished_at_ms: self.clock.now_epoch_ms(),
            result,
        };
        self.storage
            .put(&task_key(&record.id), &encode_task_record(&record)?)
            .await?;
        if let Some(m) = &self.metrics {
            m.record_completion("succeeded");
        }
        info!(task_id = %record.id, attempts = record.attempt + 1, "task succeeded");
        self.finish(record);
        Ok(())
    }

    async fn finish_failure(
        &self,
        mut record: TaskRecord,
        error_code: &str,
        message: String,
    ) -> Result<(), RunnerError> {
        record.last_error = Some(message);
        record.state = TaskState::FailedTerminal {
            finished_at_ms: self.clock.now_epoch_ms(),
            error_code: error_code.to_string(),
        };
        self.storage
            .put(&task_key(&record.id), &encode_task_record(&record)?)
            .await?;
        if let Some(m) = &self.metrics {
            m.record_completion("failed");
        }
        warn!(
            task_id = %record.id,
            error_code,
            attempts = record.attempt + 1,
            "task failed terminally"
        );
        self.finish(record);
        Ok(())
    }

    /// Drop the in-memory registration and fire the completion hook, after
    /// the terminal state is durably recorded.
    fn finish(&self, record: TaskRecord) {
        let entry = self.active.lock().unwrap().remove(&record.id);
        if let Some(entry) = entry {
            if let Some(hook) = entry.on_terminal {
                hook(&record);
            }
        }
    }
}
