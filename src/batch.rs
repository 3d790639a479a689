//! Fan-out/fan-in batch coordination.
//!
//! A batch dispatches one runner task per item and fires a single
//! completion callback when the last item finishes, in any order. The
//! `completed_items` counter is the one piece of shared mutable state in
//! the crate, so all increments flow through one aggregator task fed by a
//! channel: the storage layer only promises single-record atomicity, and a
//! lone writer makes the increment-check-and-fire step atomic without it.

use std::collections::HashMap;
use std::sync::Arc;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::codec::{decode_batch_record, encode_batch_record, CodecError};
use crate::keys::{batch_key, BATCH_PREFIX};
use crate::metrics::Metrics;
use crate::runner::{CompletionHook, RunnerError, TaskRunner};
use crate::storage::{Storage, StorageError};
use crate::task::{TaskRecord, TaskSpec, Work};

#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize, PartialEq, Eq, Copy)]
#[archive(check_bytes)]
pub enum BatchStatus {
    Processing,
    Completed,
}

/// Stored representation of one fan-out/fan-in aggregation.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct BatchRecord {
    pub id: String,
    pub total_items: u32,
    /// Monotonically increasing count of finished items (success or
    /// terminal failure alike).
    pub completed_items: u32,
    pub status: BatchStatus,
    pub created_at_ms: i64,
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Submit(#[from] RunnerError),
    #[error("batch already exists with id {0}")]
    BatchAlreadyExists(String),
    #[error("batch not found with id {0}")]
    BatchNotFound(String),
}

/// Fired exactly once when the batch transitions to `Completed`.
pub type BatchCompletionHook = Box<dyn FnOnce(&BatchRecord) + Send>;

/// One item of a fan-out: its submission spec plus the work to run.
pub struct BatchItem {
    pub spec: TaskSpec,
    pub work: Arc<dyn Work>,
}

enum BatchEvent {
    Register {
        batch_id: String,
        on_complete: BatchCompletionHook,
    },
    ItemComplete {
        batch_id: String,
    },
}

/// Splits a batch into independent runner tasks and aggregates their
/// completions into a single batch-completion event.
pub struct BatchCoordinator {
    storage: Arc<dyn Storage>,
    runner: Arc<TaskRunner>,
    clock: Arc<dyn Clock>,
    metrics: Option<Metrics>,
    events: mpsc::UnboundedSender<BatchEvent>,
}

impl BatchCoordinator {
    pub fn new(
        storage: Arc<dyn Storage>,
        runner: Arc<TaskRunner>,
        clock: Arc<dyn Clock>,
        metrics: Option<Metrics>,
    ) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        tokio::spawn(aggregate(
            Arc::clone(&storage),
            metrics.clone(),
            rx,
        ));
        Arc::new(Self {
            storage,
            runner,
            clock,
            metrics,
            events,
        })
    }

    /// Fan a batch of items out as independent tasks. Dispatch order is not
    /// preserved in completion order. An empty batch completes immediately.
    pub async fn dispatch(
        &self,
        items: Vec<BatchItem>,
        on_complete: BatchCompletionHook,
    ) -> Result<String, BatchError> {
        let batch_id = Uuid::new_v4().to_string();
        let now = self.clock.now_epoch_ms();
        let mut record = BatchRecord {
            id: batch_id.clone(),
            total_items: items.len() as u32,
            completed_items: 0,
            status: BatchStatus::Processing,
            created_at_ms: now,
        };

        if items.is_empty() {
            record.status = BatchStatus::Completed;
            self.create_record(&record).await?;
            if let Some(m) = &self.metrics {
                m.record_batch_dispatch();
                m.record_batch_completion();
            }
            info!(batch_id = %batch_id, "empty batch completed at dispatch");
            on_complete(&record);
            return Ok(batch_id);
        }

        self.create_record(&record).await?;
        if let Some(m) = &self.metrics {
            m.record_batch_dispatch();
        }
        // Register before any item can complete.
        let _ = self.events.send(BatchEvent::Register {
            batch_id: batch_id.clone(),
            on_complete,
        });

        for (index, item) in items.into_iter().enumerate() {
            let mut spec = item.spec;
            spec.batch_id = Some(batch_id.clone());
            if spec.id.is_none() {
                spec.id = Some(format!("{}/{}", batch_id, index));
            }
            let events = self.events.clone();
            let hook_batch_id = batch_id.clone();
            let hook: CompletionHook = Box::new(move |_record: &TaskRecord| {
                let _ = events.send(BatchEvent::ItemComplete {
                    batch_id: hook_batch_id,
                });
            });
            self.runner.submit(spec, item.work, Some(hook)).await?;
        }

        debug!(batch_id = %batch_id, total = record.total_items, "batch dispatched");
        Ok(batch_id)
    }

    /// Fetch a batch record by id.
    pub async fn batch(&self, id: &str) -> Result<Option<BatchRecord>, BatchError> {
        match self.storage.get(&batch_key(id)).await? {
            Some(raw) => Ok(Some(decode_batch_record(&raw)?)),
            None => Ok(None),
        }
    }

    /// List all batch records.
    pub async fn batches(&self) -> Result<Vec<BatchRecord>, BatchError> {
        let mut out = Vec::new();
        for (_, raw) in self.storage.scan_prefix(BATCH_PREFIX).await? {
            out.push(decode_batch_record(&raw)?);
        }
        Ok(out)
    }

    async fn create_record(&self, record: &BatchRecord) -> Result<(), BatchError> {
        let encoded = encode_batch_record(record)?;
        match self.storage.create(&batch_key(&record.id), &encoded).await {
            Ok(()) => Ok(()),
            Err(StorageError::AlreadyExists(_)) => {
                Err(BatchError::BatchAlreadyExists(record.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Single-writer aggregation loop. Owns all batch counter increments and
/// the exactly-once completion firing. Ends when the coordinator is
/// dropped and the channel closes.
async fn aggregate(
    storage: Arc<dyn Storage>,
    metrics: Option<Metrics>,
    mut rx: mpsc::UnboundedReceiver<BatchEvent>,
) {
    let mut hooks: HashMap<String, BatchCompletionHook> = HashMap::new();
    while let Some(event) = rx.recv().await {
        match event {
            BatchEvent::Register {
                batch_id,
                on_complete,
            } => {
                hooks.insert(batch_id, on_complete);
            }
            BatchEvent::ItemComplete { batch_id } => {
                if let Err(err) =
                    apply_completion(&storage, metrics.as_ref(), &mut hooks, &batch_id).await
                {
                    error!(batch_id = %batch_id, error = %err, "failed to apply item completion");
                }
            }
        }
    }
}

async fn apply_completion(
    storage: &Arc<dyn Storage>,
    metrics: Option<&Metrics>,
    hooks: &mut HashMap<String, BatchCompletionHook>,
    batch_id: &str,
) -> Result<(), BatchError> {
    let key = batch_key(batch_id);
    let raw = storage
        .get(&key)
        .await?
        .ok_or_else(|| BatchError::BatchNotFound(batch_id.to_string()))?;
    let mut record = decode_batch_record(&raw)?;
    if record.status == BatchStatus::Completed {
        // An item completing twice is a contract violation upstream.
        error!(batch_id = %batch_id, "item completion reported for completed batch");
        return Ok(());
    }
    record.completed_items += 1;
    if record.completed_items >= record.total_items {
        record.status = BatchStatus::Completed;
    }
    storage.put(&key, &encode_batch_record(&record)?).await?;
    debug!(
        batch_id = %batch_id,
        completed = record.completed_items,
        total = record.total_items,
        "item completed"
    );
    if record.status == BatchStatus::Completed {
        if let Some(hook) = hooks.remove(batch_id) {
            hook(&record);
        }
        if let Some(m) = metrics {
            m.record_batch_completion();
        }
        info!(batch_id = %batch_id, total = record.total_items, "batch completed");
    }
    Ok(())
}
