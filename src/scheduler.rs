//! Delayed-callback scheduling collaborator.
//!
//! The runner never blocks a thread through a backoff interval: it records
//! the pending state durably, hands a callback to the scheduler, and ends
//! its current invocation. `TokioScheduler` rides the tokio timer wheel for
//! production; `ManualScheduler` holds callbacks in a time-ordered map and
//! runs them when a test advances virtual time, which keeps retry tests
//! deterministic and instant.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::clock::{Clock, ManualClock};

/// A deferred invocation. Returns its own future so schedulers stay
/// object-safe.
pub type ScheduledCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Opaque handle for cancelling a scheduled invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScheduleHandle(u64);

/// Durable-delay collaborator contract: re-invoke a callback at or after a
/// given time, or cancel it before it fires.
pub trait Scheduler: Send + Sync {
    fn schedule_at(&self, when_ms: i64, callback: ScheduledCallback) -> ScheduleHandle;
    fn cancel(&self, handle: &ScheduleHandle);
}

/// Adapt an async closure into a `ScheduledCallback`.
pub fn callback<F, Fut>(f: F) -> ScheduledCallback
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move || -> BoxFuture<'static, ()> { Box::pin(f()) })
}

/// Production scheduler backed by `tokio::time`.
pub struct TokioScheduler {
    clock: Arc<dyn Clock>,
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<u64, tokio::task::JoinHandle<()>>>>,
}

impl TokioScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            next_id: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn pending_len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_at(&self, when_ms: i64, callback: ScheduledCallback) -> ScheduleHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let delay_ms = (when_ms - self.clock.now_epoch_ms()).max(0) as u64;
        let tasks = Arc::clone(&self.tasks);
        // Hold the registry lock across spawn so the spawned task's
        // self-removal cannot race the insertion below.
        let mut guard = self.tasks.lock().unwrap();
        let handle = tokio::spawn(async move {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            callback().await;
            tasks.lock().unwrap().remove(&id);
        });
        guard.insert(id, handle);
        ScheduleHandle(id)
    }

    fn cancel(&self, handle: &ScheduleHandle) {
        if let Some(task) = self.tasks.lock().unwrap().remove(&handle.0) {
            task.abort();
        }
    }
}

/// Virtual-time scheduler for tests and simulation. Callbacks run inline,
/// one at a time, when `advance_to` crosses their due time, so attempt
/// interleavings are fully deterministic.
pub struct ManualScheduler {
    clock: Arc<ManualClock>,
    next_id: AtomicU64,
    queue: Mutex<BTreeMap<(i64, u64), ScheduledCallback>>,
}

impl ManualScheduler {
    pub fn new(clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            next_id: AtomicU64::new(1),
            queue: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn clock(&self) -> Arc<ManualClock> {
        Arc::clone(&self.clock)
    }

    /// Number of callbacks still waiting to fire.
    pub fn pending_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Due time of the earliest pending callback, if any.
    pub fn next_due_ms(&self) -> Option<i64> {
        self.queue.lock().unwrap().keys().next().map(|(at, _)| *at)
    }

    /// Move virtual time forward to `when_ms`, running every callback due on
    /// the way in due-time order. Callbacks scheduled during the advance are
    /// included if they fall within the window.
    pub async fn advance_to(&self, when_ms: i64) {
        loop {
            let next = {
                let mut queue = self.queue.lock().unwrap();
                match queue.keys().next().copied() {
                    Some(key) if key.0 <= when_ms => queue.remove_entry(&key),
                    _ => None,
                }
            };
            let Some(((due_ms, _), callback)) = next else {
                break;
            };
            if due_ms > self.clock.now_epoch_ms() {
                self.clock.set(due_ms);
            }
            callback().await;
        }
        if when_ms > self.clock.now_epoch_ms() {
            self.clock.set(when_ms);
        }
    }

    /// Run everything currently scheduled, however far out.
    pub async fn drain(&self) {
        while let Some(due) = self.next_due_ms() {
            self.advance_to(due).await;
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_at(&self, when_ms: i64, callback: ScheduledCallback) -> ScheduleHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.queue
            .lock()
            .unwrap()
            .insert((when_ms, id), callback);
        ScheduleHandle(id)
    }

    fn cancel(&self, handle: &ScheduleHandle) {
        self.queue
            .lock()
            .unwrap()
            .retain(|(_, id), _| *id != handle.0);
    }
}
