//! Prometheus metrics for the job queue.
//!
//! Compiled only with the `metrics` feature. Handlers for these live in
//! [`crate::telemetry`], which calls in here when the feature is on.
//!
//! # Metrics
//!
//! ## Counters
//! - `reverie_jobs_enqueued_total` - Jobs newly inserted (idempotent hits excluded)
//! - `reverie_jobs_finished_total` - Execution attempts by final status
//! - `reverie_jobs_reaped_total` - Stuck jobs returned to pending
//!
//! ## Gauges
//! - `reverie_queue_depth` - Rows per status at the last stats sample
//!
//! ## Histograms
//! - `reverie_job_duration_seconds` - Handler execution time
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, Counter, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

use crate::job::JobStatus;
use crate::queue::QueueStats;

/// Global Prometheus registry for reverie metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `job_type`.
pub static JOBS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("reverie_jobs_enqueued_total", "Total number of jobs enqueued");
    CounterVec::new(opts, &["job_type"])
        .expect("reverie_jobs_enqueued_total metric creation failed")
});

/// Labels: `job_type`, `status` (completed, retrying, dead_letter).
pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "reverie_jobs_finished_total",
        "Total number of job execution attempts by outcome",
    );
    CounterVec::new(opts, &["job_type", "status"])
        .expect("reverie_jobs_finished_total metric creation failed")
});

pub static JOBS_REAPED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "reverie_jobs_reaped_total",
        "Total number of stuck jobs returned to pending",
    )
    .expect("reverie_jobs_reaped_total metric creation failed")
});

/// Labels: `status`.
pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("reverie_queue_depth", "Number of jobs per status");
    GaugeVec::new(opts, &["status"]).expect("reverie_queue_depth metric creation failed")
});

/// Labels: `job_type`, `status`.
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "reverie_job_duration_seconds",
        "Job execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["job_type", "status"])
        .expect("reverie_job_duration_seconds metric creation failed")
});

/// Register all metrics with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(JOBS_REAPED_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_enqueued(job_type: &str) {
    JOBS_ENQUEUED_TOTAL.with_label_values(&[job_type]).inc();
}

pub fn record_job_finished(job_type: &str, status: &str) {
    JOBS_FINISHED_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
}

pub fn record_jobs_reaped(count: u64) {
    JOBS_REAPED_TOTAL.inc_by(count as f64);
}

pub fn set_queue_depth(stats: &QueueStats) {
    for status in [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::DeadLetter,
    ] {
        QUEUE_DEPTH
            .with_label_values(&[status.as_str()])
            .set(stats.count(status) as f64);
    }
}

pub fn observe_job_duration(job_type: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[job_type, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization_is_repeatable() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn test_set_queue_depth() {
        let mut stats = QueueStats::new(chrono::Utc::now());
        stats.add(JobStatus::Pending, 4);
        set_queue_depth(&stats);
        assert_eq!(QUEUE_DEPTH.with_label_values(&["pending"]).get(), 4.0);
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_enqueued("interpret_event");
        record_job_finished("interpret_event", "completed");
        record_jobs_reaped(1);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("reverie_jobs_enqueued_total"));
        assert!(output.contains("reverie_jobs_finished_total"));
        assert!(output.contains("reverie_jobs_reaped_total"));
    }
}
