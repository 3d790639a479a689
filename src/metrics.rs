//! Prometheus metrics for redrive.
//!
//! This module provides:
//! - Prometheus metrics using the `prometheus` crate
//! - Pre-defined metric instruments for key operations
//! - An HTTP server for the `/metrics` endpoint
//!
//! # Usage
//!
//! Initialize metrics once at startup:
//! ```ignore
//! let metrics = redrive::metrics::init()?;
//! ```
//!
//! Then start the metrics server:
//! ```ignore
//! redrive::metrics::run_metrics_server(addr, metrics.clone(), shutdown_rx).await;
//! ```
//!
//! Record metrics in your code:
//! ```ignore
//! metrics.record_attempt(true);
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    core::Collector, Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Histogram buckets for retry delays (in milliseconds) - covers sub-second
/// jitter up to capped exponential backoff.
const RETRY_DELAY_BUCKETS: &[f64] = &[
    10.0, 50.0, 100.0, 500.0, 1_000.0, 5_000.0, 15_000.0, 60_000.0, 300_000.0, 1_800_000.0,
];

/// Redrive metrics handle containing all metric instruments.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Task metrics
    tasks_submitted: Counter,
    task_attempts: CounterVec,
    tasks_completed: CounterVec,
    retries_scheduled: Counter,
    retry_delay_ms: Histogram,

    // Ledger metrics
    ledger_begin: CounterVec,

    // Batch metrics
    batches_dispatched: Counter,
    batches_completed: Counter,
}

impl Metrics {
    /// Get the prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a task submission.
    pub fn record_submit(&self) {
        self.tasks_submitted.inc();
    }

    /// Record a task attempt starting execution.
    /// `is_retry` should be true if the attempt number is greater than 0.
    pub fn record_attempt(&self, is_retry: bool) {
        let is_retry_str = if is_retry { "true" } else { "false" };
        self.task_attempts.with_label_values(&[is_retry_str]).inc();
    }

    /// Record a task reaching a terminal state.
    /// `outcome` is one of "succeeded", "failed", "cancelled".
    pub fn record_completion(&self, outcome: &str) {
        self.tasks_completed.with_label_values(&[outcome]).inc();
    }

    /// Record a retry being scheduled, with its computed backoff delay.
    pub fn record_retry_scheduled(&self, delay_ms: i64) {
        self.retries_scheduled.inc();
        self.retry_delay_ms.observe(delay_ms as f64);
    }

    /// Record an idempotency ledger claim outcome.
    /// `disposition` is one of "new", "replayed", "in_flight".
    pub fn record_ledger_begin(&self, disposition: &str) {
        self.ledger_begin.with_label_values(&[disposition]).inc();
    }

    /// Record a batch dispatch.
    pub fn record_batch_dispatch(&self) {
        self.batches_dispatched.inc();
    }

    /// Record a batch completion.
    pub fn record_batch_completion(&self) {
        self.batches_completed.inc();
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        // Log but don't fail - metric may already be registered
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Initialize the metrics system with a Prometheus registry.
///
/// Returns a `Metrics` handle that can be cloned and passed to components.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let tasks_submitted = register(
        &registry,
        Counter::new(
            "redrive_tasks_submitted_total",
            "Total number of tasks submitted",
        )?,
    );

    let task_attempts = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "redrive_task_attempts_total",
                "Total number of task attempts started",
            ),
            &["is_retry"],
        )?,
    );

    let tasks_completed = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "redrive_tasks_completed_total",
                "Total number of tasks reaching a terminal state (succeeded, failed, cancelled)",
            ),
            &["outcome"],
        )?,
    );

    let retries_scheduled = register(
        &registry,
        Counter::new(
            "redrive_retries_scheduled_total",
            "Total number of retries scheduled after retryable failures",
        )?,
    );

    let retry_delay_ms = register(
        &registry,
        Histogram::with_opts(
            HistogramOpts::new(
                "redrive_retry_delay_ms",
                "Computed backoff delay for scheduled retries, in milliseconds",
            )
            .buckets(RETRY_DELAY_BUCKETS.to_vec()),
        )?,
    );

    let ledger_begin = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "redrive_ledger_begin_total",
                "Idempotency ledger claim outcomes (new, replayed, in_flight)",
            ),
            &["disposition"],
        )?,
    );

    let batches_dispatched = register(
        &registry,
        Counter::new(
            "redrive_batches_dispatched_total",
            "Total number of batches dispatched",
        )?,
    );

    let batches_completed = register(
        &registry,
        Counter::new(
            "redrive_batches_completed_total",
            "Total number of batches that reached Completed",
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        tasks_submitted,
        task_attempts,
        tasks_completed,
        retries_scheduled,
        retry_delay_ms,
        ledger_begin,
        batches_dispatched,
        batches_completed,
    })
}

/// Axum handler for the `/metrics` endpoint.
async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Run the Prometheus metrics HTTP server.
///
/// Listens on the given address and serves metrics at `/metrics`.
/// Shuts down gracefully when shutdown signal is received.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            debug!("metrics server shutting down");
        })
        .await?;

    Ok(())
}
