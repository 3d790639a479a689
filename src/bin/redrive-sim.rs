//! End-to-end simulation: submit a batch of flaky tasks and watch the
//! runner drive them to terminal outcomes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{broadcast, oneshot};

use redrive::backoff::RetryPolicy;
use redrive::batch::{BatchCoordinator, BatchItem};
use redrive::clock::SystemClock;
use redrive::runner::TaskRunner;
use redrive::scheduler::TokioScheduler;
use redrive::settings::AppConfig;
use redrive::storage::MemoryStorage;
use redrive::task::{TaskSpec, TaskState, Work, WorkError};

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    /// Number of tasks to dispatch in the batch
    #[arg(long, default_value = "40")]
    tasks: usize,
    /// Probability that any given attempt fails retryably
    #[arg(long, default_value = "0.3")]
    failure_rate: f64,
    /// Probability that a task fails fatally on its first attempt
    #[arg(long, default_value = "0.05")]
    fatal_rate: f64,
    /// Attempts allowed per task
    #[arg(long, default_value = "5")]
    max_attempts: u32,
    /// Base backoff delay in milliseconds
    #[arg(long, default_value = "25")]
    base_ms: i64,
    /// Jitter upper bound in milliseconds
    #[arg(long, default_value = "10")]
    jitter_max_ms: i64,
    /// Seed for the failure-injection RNG
    #[arg(long, default_value = "42")]
    seed: u64,
    /// Path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

/// Work that fails retryably a predetermined number of times, or fatally
/// up front, then succeeds.
struct FlakyWork {
    failures_before_success: u32,
    fatal: bool,
    attempts_seen: AtomicU32,
}

#[async_trait]
impl Work for FlakyWork {
    async fn run(&self) -> Result<Vec<u8>, WorkError> {
        let attempt = self.attempts_seen.fetch_add(1, Ordering::SeqCst);
        if self.fatal {
            return Err(WorkError::Fatal("permanent rejection".to_string()));
        }
        if attempt < self.failures_before_success {
            return Err(WorkError::Retryable(format!(
                "transient failure on attempt {}",
                attempt
            )));
        }
        Ok(b"done".to_vec())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = AppConfig::load(args.config.as_deref())?;
    redrive::trace::init(cfg.log_format);

    let metrics = redrive::metrics::init()?;
    let (shutdown_tx, _) = broadcast::channel(1);
    if let Some(addr) = &cfg.metrics_addr {
        let addr = addr.parse()?;
        let server_metrics = metrics.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) =
                redrive::metrics::run_metrics_server(addr, server_metrics, shutdown_rx).await
            {
                eprintln!("metrics server error: {e}");
            }
        });
    }

    let storage = MemoryStorage::shared();
    let clock = SystemClock::shared();
    let scheduler = TokioScheduler::new(clock.clone());
    let runner = TaskRunner::new(
        storage.clone(),
        scheduler.clone(),
        clock.clone(),
        Some(metrics.clone()),
    );
    let coordinator = BatchCoordinator::new(
        storage.clone(),
        runner.clone(),
        clock.clone(),
        Some(metrics.clone()),
    );

    let policy = RetryPolicy {
        max_attempts: args.max_attempts,
        base_ms: args.base_ms,
        jitter_max_ms: args.jitter_max_ms,
        ..RetryPolicy::default()
    };

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut items = Vec::with_capacity(args.tasks);
    for i in 0..args.tasks {
        let fatal = rng.gen::<f64>() < args.fatal_rate;
        let mut failures = 0u32;
        while failures < args.max_attempts && rng.gen::<f64>() < args.failure_rate {
            failures += 1;
        }
        items.push(BatchItem {
            spec: TaskSpec {
                id: Some(format!("sim-task-{i}")),
                payload: serde_json::to_vec(&serde_json::json!({ "item": i }))?,
                policy,
                idempotency_key: Some(format!("sim-op-{i}")),
                ..TaskSpec::default()
            },
            work: Arc::new(FlakyWork {
                failures_before_success: failures,
                fatal,
                attempts_seen: AtomicU32::new(0),
            }),
        });
    }

    let (done_tx, done_rx) = oneshot::channel();
    let batch_id = coordinator
        .dispatch(
            items,
            Box::new(move |record| {
                let _ = done_tx.send(record.total_items);
            }),
        )
        .await?;

    let total = tokio::time::timeout(Duration::from_secs(120), done_rx).await??;
    println!("batch {batch_id} completed with {total} items");

    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut total_attempts = 0u64;
    for record in runner.tasks().await? {
        total_attempts += u64::from(record.attempt) + 1;
        match record.state {
            TaskState::Succeeded { .. } => succeeded += 1,
            TaskState::FailedTerminal { .. } => failed += 1,
            _ => {}
        }
    }
    println!("succeeded: {succeeded}  failed: {failed}  attempts: {total_attempts}");

    let _ = shutdown_tx.send(());
    Ok(())
}
