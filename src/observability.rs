// Observability for pbtrees
// Logging setup, per-operation contexts, and process-wide counters for the
// structural events of the engine (splits, loads, commits, conflicts).

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

// Global atomic counters for metrics
static OPERATION_COUNTER: AtomicU64 = AtomicU64::new(0);
static ERROR_COUNTER: AtomicU64 = AtomicU64::new(0);
static SPLIT_COUNTER: AtomicU64 = AtomicU64::new(0);
static ROOT_SPLIT_COUNTER: AtomicU64 = AtomicU64::new(0);
static LOAD_COUNTER: AtomicU64 = AtomicU64::new(0);
static COMMIT_COUNTER: AtomicU64 = AtomicU64::new(0);
static CONFLICT_COUNTER: AtomicU64 = AtomicU64::new(0);
static MERGE_COUNTER: AtomicU64 = AtomicU64::new(0);

// Last reported gauge values
static RESIDENT_NODES: AtomicU64 = AtomicU64::new(0);

pub const DEFAULT_FILTER: &str = "pbtrees=warn,error";
pub const VERBOSE_FILTER: &str = "pbtrees=debug,info";
pub const QUIET_FILTER: &str = "error";

/// Initialize logging with the default filter; safe to call repeatedly
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging. `quiet` wins over both `verbose` and `RUST_LOG`.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    let env_filter = if quiet {
        EnvFilter::new(QUIET_FILTER)
    } else {
        let fallback = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_line_number(!quiet)
        .with_file(!quiet);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            if !quiet {
                info!("pbtrees observability initialized");
            }
            Ok(())
        }
        // a subscriber is already installed, e.g. by another test
        Err(_) => Ok(()),
    }
}

/// Operations that get a structured log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    Insert { key: String },
    Delete { key: String },
    Lookup { key: String, found: bool },
    RangeScan { result_count: usize },
    SetOperation { name: String, result_count: usize },
    Commit { objects: usize },
    Load { oid: u64 },
    Check { items: usize },
}

#[derive(Debug, Clone)]
pub enum MetricType {
    Counter { name: &'static str, value: u64 },
    Gauge { name: &'static str, value: u64 },
    Timer { name: &'static str, duration: Duration },
}

/// Identity and start time of one logged operation
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub operation: String,
    pub start_time: Instant,
}

impl OperationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            operation: operation.into(),
            start_time: Instant::now(),
        }
    }

    /// Same operation, reported under an existing trace
    pub fn in_trace(trace_id: Uuid, operation: impl Into<String>) -> Self {
        Self {
            trace_id,
            ..Self::new(operation)
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Log an operation outcome with its context and count it
#[instrument(skip(ctx, result))]
pub fn log_operation<T, E: fmt::Display>(
    ctx: &OperationContext,
    op: &Operation,
    result: &std::result::Result<T, E>,
) {
    let elapsed_us = ctx.elapsed().as_micros();
    match result {
        Ok(_) => {
            debug!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                operation = %ctx.operation,
                elapsed_us,
                "Operation completed: {:?}", op
            );
            OPERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            error!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                operation = %ctx.operation,
                elapsed_us,
                error = %e,
                "Operation failed: {:?}", op
            );
            ERROR_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn counter_for(name: &str) -> Option<&'static AtomicU64> {
    match name {
        "btree.splits" => Some(&SPLIT_COUNTER),
        "btree.root_splits" => Some(&ROOT_SPLIT_COUNTER),
        "btree.conflicts" => Some(&CONFLICT_COUNTER),
        "persistence.loads" => Some(&LOAD_COUNTER),
        "persistence.commits" => Some(&COMMIT_COUNTER),
        "setops.merges" => Some(&MERGE_COUNTER),
        _ => None,
    }
}

fn gauge_for(name: &str) -> Option<&'static AtomicU64> {
    match name {
        "persistence.resident_nodes" => Some(&RESIDENT_NODES),
        _ => None,
    }
}

/// Record a metric. Known counter and gauge names feed `get_metrics`.
pub fn record_metric(metric: MetricType) {
    match metric {
        MetricType::Counter { name, value } => {
            if let Some(counter) = counter_for(name) {
                counter.fetch_add(value, Ordering::Relaxed);
            }
            trace!("metric.counter {} += {}", name, value);
        }
        MetricType::Gauge { name, value } => {
            if let Some(gauge) = gauge_for(name) {
                gauge.store(value, Ordering::Relaxed);
            }
            trace!("metric.gauge {} = {}", name, value);
        }
        MetricType::Timer { name, duration } => {
            trace!("metric.timer {} = {:?}", name, duration);
        }
    }
}

/// Current counter snapshot
pub fn get_metrics() -> serde_json::Value {
    serde_json::json!({
        "operations": {
            "total": OPERATION_COUNTER.load(Ordering::Relaxed),
            "errors": ERROR_COUNTER.load(Ordering::Relaxed),
        },
        "btree": {
            "splits": SPLIT_COUNTER.load(Ordering::Relaxed),
            "root_splits": ROOT_SPLIT_COUNTER.load(Ordering::Relaxed),
            "conflicts": CONFLICT_COUNTER.load(Ordering::Relaxed),
            "set_operations": MERGE_COUNTER.load(Ordering::Relaxed),
        },
        "persistence": {
            "loads": LOAD_COUNTER.load(Ordering::Relaxed),
            "commits": COMMIT_COUNTER.load(Ordering::Relaxed),
            "resident_nodes": RESIDENT_NODES.load(Ordering::Relaxed),
        },
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// Log the whole context chain of a wrapped error
pub fn log_error_with_context(error: &anyhow::Error, ctx: &OperationContext) {
    let error_chain = error
        .chain()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(" -> ");

    error!(
        trace_id = %ctx.trace_id,
        span_id = %ctx.span_id,
        operation = %ctx.operation,
        error_chain = %error_chain,
        "Error occurred during operation"
    );
}

/// Logs the elapsed time of a scope when dropped
pub struct PerfTimer {
    ctx: OperationContext,
}

impl PerfTimer {
    pub fn new(name: impl Into<String>) -> Self {
        let ctx = OperationContext::new(name);
        trace!(trace_id = %ctx.trace_id, "Timer started: {}", ctx.operation);
        Self { ctx }
    }

    pub fn elapsed(&self) -> Duration {
        self.ctx.elapsed()
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        let elapsed = self.ctx.elapsed();
        debug!(
            trace_id = %self.ctx.trace_id,
            elapsed_us = elapsed.as_micros(),
            "Timer completed: {}", self.ctx.operation
        );
        record_metric(MetricType::Timer {
            name: "perf.timer",
            duration: elapsed,
        });
    }
}
