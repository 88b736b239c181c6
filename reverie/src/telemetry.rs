//! Tracing and telemetry instrumentation for reverie.
//!
//! This module provides helper functions for creating tracing spans and recording
//! metrics during job lifecycle events. All functions work both with and without
//! the `metrics` feature flag.
//!
//! # Example
//!
//! ```ignore
//! use reverie::telemetry::{job_dispatch_span, record_job_finished};
//!
//! let span = job_dispatch_span(job_id.to_string(), "interpret_event");
//! let _enter = span.enter();
//! // ... handler execution
//! record_job_finished(job_id.to_string(), "interpret_event", "completed");
//! ```

use std::future::Future;
use tracing::{info_span, Instrument, Span};

use crate::queue::QueueStats;

/// Create a tracing span for job dispatch operations.
///
/// The span includes the job_id and job_type as fields for observability.
#[must_use]
pub fn job_dispatch_span(job_id: impl AsRef<str>, job_type: impl AsRef<str>) -> Span {
    info_span!(
        "reverie.dispatch",
        job_id = %job_id.as_ref(),
        job_type = %job_type.as_ref(),
    )
}

/// Create a tracing span for a claim attempt by one worker.
#[must_use]
pub fn job_claim_span(worker_id: impl AsRef<str>) -> Span {
    info_span!("reverie.claim", worker_id = %worker_id.as_ref())
}

/// Create a tracing span for job enqueue operations.
#[must_use]
pub fn job_enqueue_span(job_type: impl AsRef<str>, priority: i32) -> Span {
    info_span!(
        "reverie.enqueue",
        job_type = %job_type.as_ref(),
        priority = priority,
    )
}

/// Create a tracing span for finalizing a job (complete, retry, dead-letter).
#[must_use]
pub fn job_complete_span(
    job_id: impl AsRef<str>,
    job_type: impl AsRef<str>,
    status: impl AsRef<str>,
) -> Span {
    info_span!(
        "reverie.complete",
        job_id = %job_id.as_ref(),
        job_type = %job_type.as_ref(),
        status = %status.as_ref(),
    )
}

/// Create a tracing span for a stuck-job sweep.
#[must_use]
pub fn job_reap_span(stuck_job_timeout_minutes: u64) -> Span {
    info_span!(
        "reverie.reap",
        stuck_job_timeout_minutes = stuck_job_timeout_minutes,
    )
}

/// Instrument a future with a job dispatch span.
pub fn instrument_dispatch<F>(
    job_id: impl AsRef<str>,
    job_type: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let span = job_dispatch_span(job_id, job_type);
    future.instrument(span)
}

/// Record a job enqueue event.
///
/// `created` is false when the idempotency key matched an existing job.
pub fn record_job_enqueued(job_id: impl AsRef<str>, job_type: impl AsRef<str>, created: bool) {
    if created {
        tracing::info!(
            job_id = %job_id.as_ref(),
            job_type = %job_type.as_ref(),
            "job enqueued"
        );
        #[cfg(feature = "metrics")]
        crate::metrics::record_job_enqueued(job_type.as_ref());
    } else {
        tracing::debug!(
            job_id = %job_id.as_ref(),
            job_type = %job_type.as_ref(),
            "enqueue resolved to existing job"
        );
    }
}

/// Record the final status of one execution attempt.
///
/// `status` is one of `completed`, `retrying`, `dead_letter`.
pub fn record_job_finished(
    job_id: impl AsRef<str>,
    job_type: impl AsRef<str>,
    status: impl AsRef<str>,
) {
    tracing::info!(
        job_id = %job_id.as_ref(),
        job_type = %job_type.as_ref(),
        status = %status.as_ref(),
        "job finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(job_type.as_ref(), status.as_ref());
}

/// Record the result of a stuck-job sweep.
pub fn record_jobs_reaped(count: u64) {
    if count > 0 {
        tracing::warn!(count, "recovered stuck jobs");
    } else {
        tracing::debug!("no stuck jobs found");
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_jobs_reaped(count);
}

/// Update the queue depth gauges from a stats snapshot.
pub fn set_queue_depth(stats: &QueueStats) {
    tracing::debug!(
        pending = stats.pending,
        processing = stats.processing,
        completed = stats.completed,
        failed = stats.failed,
        dead_letter = stats.dead_letter,
        "queue depth updated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(stats);
}

/// Observe the duration of a job execution.
pub fn observe_job_duration(
    job_type: impl AsRef<str>,
    status: impl AsRef<str>,
    duration_secs: f64,
) {
    tracing::debug!(
        job_type = %job_type.as_ref(),
        status = %status.as_ref(),
        duration_secs = duration_secs,
        "job duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(job_type.as_ref(), status.as_ref(), duration_secs);
}

/// Record the start of job execution for duration tracking.
///
/// Returns an opaque handle that should be passed to `record_job_end`.
pub fn record_job_start(job_id: impl AsRef<str>) -> JobTimingHandle {
    JobTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Record the end of job execution and update duration metrics.
pub fn record_job_end(handle: JobTimingHandle, job_type: impl AsRef<str>, status: impl AsRef<str>) {
    let duration_secs = handle.start.elapsed().as_secs_f64();
    observe_job_duration(job_type, status, duration_secs);
}

/// Handle for tracking job execution duration.
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: String,
    start: std::time::Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Later calls are no-ops.
#[cfg(feature = "subscriber")]
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_dispatch_span() {
        let span = job_dispatch_span("job-123", "interpret_event");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "reverie.dispatch");
        }
    }

    #[test]
    fn test_job_claim_span() {
        let span = job_claim_span("worker-1");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "reverie.claim");
        }
    }

    #[test]
    fn test_timing_handle() {
        let handle = record_job_start("job-123");
        assert_eq!(handle.job_id(), "job-123");

        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(handle.elapsed().as_nanos() > 0);

        record_job_end(handle, "interpret_event", "completed");
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_job_enqueued("job-1", "detect_patterns", true);
        record_job_enqueued("job-1", "detect_patterns", false);
        record_job_finished("job-1", "detect_patterns", "retrying");
        record_jobs_reaped(0);
        record_jobs_reaped(2);
        set_queue_depth(&QueueStats::new(chrono::Utc::now()));
    }
}
