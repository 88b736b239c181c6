use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::job::{EnqueueOptions, JobHandle, JobId, JobKind, JobPayload, JobRecord, JobStatus, NewJob};
use crate::retry::RetryPolicy;
use crate::telemetry;

/// Trait for stores that persist jobs and arbitrate claims between workers.
///
/// Implementors must make `claim` a single atomic select-and-mark: two
/// concurrent callers never receive the same row, and a caller never waits
/// on a row another caller is in the middle of claiming.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job. With an idempotency key, a concurrent or earlier insert
    /// with the same key resolves to the existing row.
    async fn enqueue(&self, job: NewJob) -> anyhow::Result<JobHandle>;

    /// Atomically take the highest-priority eligible `Pending` job.
    async fn claim(&self, worker_id: &str) -> anyhow::Result<Option<JobRecord>>;

    /// Mark a `Processing` job as completed.
    async fn complete(&self, job_id: JobId) -> anyhow::Result<()>;

    /// Record a failure and either schedule a retry under `retry` or
    /// dead-letter the job.
    ///
    /// Returns `None` when the job was not `Processing` (already finished or
    /// reclaimed by the reaper).
    async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        should_retry: bool,
        retry: &RetryPolicy,
    ) -> anyhow::Result<Option<FailureOutcome>>;

    /// Look up a single job.
    async fn get_job(&self, job_id: JobId) -> anyhow::Result<Option<JobRecord>>;

    /// Count jobs per status, plus pending jobs per type.
    async fn queue_stats(&self) -> anyhow::Result<QueueStats>;

    /// Delete `Completed`/`DeadLetter` jobs finished more than `older_than_days` ago.
    async fn cleanup_old_jobs(&self, older_than_days: u32) -> anyhow::Result<u64>;
}

/// Trait for sweeping jobs abandoned by crashed workers.
///
/// Implementors reset `Processing` jobs whose lock is older than the timeout
/// back to `Pending`, clearing the lock and recording a diagnostic error.
#[async_trait]
pub trait StuckJobScanner: Send + Sync {
    async fn recover_stuck_jobs(&self, stuck_job_timeout_minutes: u64) -> anyhow::Result<u64>;
}

/// A complete queue backend.
pub trait QueueBackend: JobStore + StuckJobScanner {}

impl<T: JobStore + StuckJobScanner> QueueBackend for T {}

/// Result of [`JobStore::fail`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FailureOutcome {
    /// Back to `Pending`, claimable from `available_at`.
    Retrying {
        attempts: i32,
        delay_ms: u64,
        available_at: DateTime<Utc>,
    },
    /// Terminal.
    DeadLettered { attempts: i32 },
}

impl FailureOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            FailureOutcome::Retrying { .. } => JobStatus::Pending,
            FailureOutcome::DeadLettered { .. } => JobStatus::DeadLetter,
        }
    }
}

/// Snapshot of queue state at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueStats {
    pub sampled_at: DateTime<Utc>,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_letter: u64,
    /// Pending backlog per job type.
    pub by_type: HashMap<JobKind, u64>,
}

impl QueueStats {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 0,
            dead_letter: 0,
            by_type: HashMap::new(),
        }
    }

    /// Add `count` rows in `status` to the matching counter.
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::DeadLetter => self.dead_letter += count,
        }
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::DeadLetter => self.dead_letter,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.dead_letter
    }
}

/// Cheaply cloneable handle over a queue backend.
///
/// This is what producers, handlers (for pipeline chaining), and workers
/// hold. It adds typed enqueue, configured defaults, and telemetry on top of
/// the raw [`JobStore`] operations.
#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    config: QueueConfig,
    retry: RetryPolicy,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
        let retry = RetryPolicy::from(&config);
        Self {
            backend,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn backend(&self) -> Arc<dyn QueueBackend> {
        Arc::clone(&self.backend)
    }

    /// Options carrying this queue's default `max_attempts`.
    pub fn default_options(&self) -> EnqueueOptions {
        EnqueueOptions::new().with_max_attempts(self.config.default_max_attempts)
    }

    /// Enqueue a typed job.
    ///
    /// The payload's user id is used as the grouping tag unless the options
    /// carry one.
    pub async fn enqueue(
        &self,
        payload: &JobPayload,
        mut options: EnqueueOptions,
    ) -> anyhow::Result<JobHandle> {
        if options.user_id.is_none() {
            options.user_id = Some(payload.user_id().to_string());
        }
        let job = NewJob::from_payload(payload, options)?;
        self.enqueue_job(job).await
    }

    /// Enqueue a raw JSON payload for a kind.
    ///
    /// The payload is not validated against the kind's schema here; a
    /// mismatch surfaces as a non-retryable failure at dispatch.
    pub async fn enqueue_raw(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> anyhow::Result<JobHandle> {
        self.enqueue_job(NewJob::new(kind, payload, options)).await
    }

    async fn enqueue_job(&self, job: NewJob) -> anyhow::Result<JobHandle> {
        if job.max_attempts < 1 {
            return Err(QueueError::InvalidConfig(format!(
                "max_attempts must be at least 1, got {}",
                job.max_attempts
            ))
            .into());
        }

        let kind = job.kind;
        let span = telemetry::job_enqueue_span(kind.as_str(), job.priority);
        let handle = self.backend.enqueue(job).instrument(span).await?;
        telemetry::record_job_enqueued(handle.id.to_string(), kind.as_str(), handle.created);
        Ok(handle)
    }

    pub async fn claim(&self, worker_id: &str) -> anyhow::Result<Option<JobRecord>> {
        let span = telemetry::job_claim_span(worker_id);
        self.backend.claim(worker_id).instrument(span).await
    }

    pub async fn complete(&self, job_id: JobId) -> anyhow::Result<()> {
        self.backend.complete(job_id).await
    }

    pub async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        should_retry: bool,
    ) -> anyhow::Result<Option<FailureOutcome>> {
        self.backend
            .fail(job_id, error, should_retry, &self.retry)
            .await
    }

    pub async fn get_job(&self, job_id: JobId) -> anyhow::Result<Option<JobRecord>> {
        self.backend.get_job(job_id).await
    }

    /// Like [`JobQueue::get_job`] but missing rows are an error.
    pub async fn require_job(&self, job_id: JobId) -> anyhow::Result<JobRecord> {
        self.backend
            .get_job(job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(job_id).into())
    }

    /// Reclaim `Processing` jobs locked for longer than the timeout.
    pub async fn recover_stuck_jobs(&self, stuck_job_timeout_minutes: u64) -> anyhow::Result<u64> {
        let span = telemetry::job_reap_span(stuck_job_timeout_minutes);
        let recovered = self
            .backend
            .recover_stuck_jobs(stuck_job_timeout_minutes)
            .instrument(span)
            .await?;
        telemetry::record_jobs_reaped(recovered);
        Ok(recovered)
    }

    pub async fn queue_stats(&self) -> anyhow::Result<QueueStats> {
        let stats = self.backend.queue_stats().await?;
        telemetry::set_queue_depth(&stats);
        Ok(stats)
    }

    pub async fn cleanup_old_jobs(&self, older_than_days: u32) -> anyhow::Result<u64> {
        let deleted = self.backend.cleanup_old_jobs(older_than_days).await?;
        if deleted > 0 {
            tracing::info!(deleted, older_than_days, "cleaned up finished jobs");
        }
        Ok(deleted)
    }

    /// Cleanup with the configured retention window.
    pub async fn cleanup_expired(&self) -> anyhow::Result<u64> {
        self.cleanup_old_jobs(self.config.retention_days).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_add_and_total() {
        let mut stats = QueueStats::new(Utc::now());
        stats.add(JobStatus::Pending, 3);
        stats.add(JobStatus::Processing, 1);
        stats.add(JobStatus::DeadLetter, 2);
        stats.add(JobStatus::Pending, 1);

        assert_eq!(stats.count(JobStatus::Pending), 4);
        assert_eq!(stats.count(JobStatus::Completed), 0);
        assert_eq!(stats.total(), 7);
    }

    #[test]
    fn failure_outcome_reports_resulting_status() {
        let retry = FailureOutcome::Retrying {
            attempts: 1,
            delay_ms: 10_000,
            available_at: Utc::now(),
        };
        assert_eq!(retry.status(), JobStatus::Pending);
        assert_eq!(
            FailureOutcome::DeadLettered { attempts: 3 }.status(),
            JobStatus::DeadLetter
        );
    }
}
