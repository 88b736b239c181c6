use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::QueueError;
use crate::job::JobRecord;
use crate::queue::{FailureOutcome, JobQueue};
use crate::telemetry;

use super::builder::WorkerBuilder;
use super::worker::{PollBackoff, WorkerConfig};

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let mut notified = std::pin::pin!(self.inner.notify.notified());
        // Register interest before the flag check so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for dispatching claimed jobs to handlers.
///
/// Implementors never let a handler failure escape: every outcome, including
/// a panic, is folded into a [`DispatchStatus`].
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job: &JobRecord, queue: &JobQueue) -> DispatchStatus;
}

/// Result of job dispatch execution.
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchStatus {
    /// Handler succeeded; the job is marked completed.
    Success { data: Option<serde_json::Value> },
    /// Retried with backoff while attempts remain.
    RetryableFailure { error: String },
    /// Dead-lettered immediately.
    PermanentFailure { error: String },
}

/// How [`WorkerHandle::stop`] returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopOutcome {
    /// The loop exited; any in-flight job finished first.
    Drained,
    /// The timeout elapsed with a job still running. It is left to finish
    /// (or to be reaped) in the background.
    TimedOut,
    /// Non-graceful stop; no waiting was done.
    Immediate,
}

#[derive(Debug)]
struct WorkerState {
    running: AtomicBool,
    processing: AtomicBool,
    poll_interval_ms: AtomicU64,
}

/// A single polling worker, ready to start.
///
/// One worker processes one job at a time. Run several workers (in one
/// process or many) for concurrency; the store's atomic claim keeps them
/// from ever sharing a job.
pub struct Worker {
    worker_id: String,
    config: WorkerConfig,
    queue: JobQueue,
    dispatcher: Arc<dyn JobDispatcher>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.worker_id)
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new()
    }

    pub fn new(
        queue: JobQueue,
        dispatcher: Arc<dyn JobDispatcher>,
        config: WorkerConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            worker_id: config.resolve_worker_id(),
            config,
            queue,
            dispatcher,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Reap once, then spawn the poll loop and the periodic reaper.
    pub async fn start(self) -> WorkerHandle {
        let worker_id = self.worker_id.clone();

        match self
            .queue
            .recover_stuck_jobs(self.config.stuck_job_timeout_minutes)
            .await
        {
            Ok(recovered) => {
                tracing::info!(worker_id = %worker_id, recovered, "startup reap complete")
            }
            Err(err) => {
                tracing::warn!(worker_id = %worker_id, error = %err, "startup reap failed")
            }
        }

        let shutdown = ShutdownToken::new();
        let state = Arc::new(WorkerState {
            running: AtomicBool::new(true),
            processing: AtomicBool::new(false),
            poll_interval_ms: AtomicU64::new(self.config.poll_interval_min_ms),
        });

        let reaper = spawn_reaper(
            worker_id.clone(),
            self.queue.clone(),
            self.config.clone(),
            shutdown.clone(),
        );

        let poll_loop = tokio::spawn(worker_loop(
            self,
            Arc::clone(&state),
            shutdown.clone(),
        ));

        WorkerHandle {
            worker_id,
            state,
            shutdown,
            poll_loop: Some(poll_loop),
            reaper: Some(reaper),
        }
    }
}

/// Handle to a running worker.
///
/// Dropping the handle without calling [`WorkerHandle::stop`] behaves like a
/// non-graceful stop: no further jobs are claimed, and an in-flight handler
/// finishes in the background.
#[derive(Debug)]
pub struct WorkerHandle {
    worker_id: String,
    state: Arc<WorkerState>,
    shutdown: ShutdownToken,
    poll_loop: Option<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Interval the worker will sleep before its next claim.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.state.poll_interval_ms.load(Ordering::SeqCst))
    }

    /// Whether a handler is executing right now.
    pub fn is_processing(&self) -> bool {
        self.state.processing.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Token observed by this worker's tasks; cancelling it stops claiming.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Stop claiming new jobs.
    ///
    /// With `graceful`, waits up to `timeout` for the in-flight job (if any)
    /// to finish. A running handler is never interrupted.
    pub async fn stop(&mut self, graceful: bool, timeout: Duration) -> StopOutcome {
        tracing::info!(worker_id = %self.worker_id, graceful, "stopping worker");
        self.state.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        // The reaper exits on its own once cancelled.
        drop(self.reaper.take());

        if !graceful {
            return StopOutcome::Immediate;
        }

        let Some(mut poll_loop) = self.poll_loop.take() else {
            return StopOutcome::Drained;
        };

        match tokio::time::timeout(timeout, &mut poll_loop).await {
            Ok(Ok(())) => StopOutcome::Drained,
            Ok(Err(err)) => {
                tracing::warn!(worker_id = %self.worker_id, error = ?err, "worker task failed");
                StopOutcome::Drained
            }
            Err(_) => {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for in-flight job"
                );
                StopOutcome::TimedOut
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if !self.shutdown.is_cancelled() {
            tracing::debug!(worker_id = %self.worker_id, "worker handle dropped, stopping worker");
            self.state.running.store(false, Ordering::SeqCst);
            self.shutdown.cancel();
        }
    }
}

struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn worker_loop(worker: Worker, state: Arc<WorkerState>, shutdown: ShutdownToken) {
    let mut backoff = PollBackoff::from_config(&worker.config);
    tracing::info!(worker_id = %worker.worker_id, "worker started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let interval_ms = match poll_once(&worker, &state).await {
            Ok(true) => backoff.on_job(),
            Ok(false) => backoff.on_empty(),
            Err(err) => {
                tracing::error!(
                    worker_id = %worker.worker_id,
                    error = %err,
                    "poll cycle failed"
                );
                backoff.on_error()
            }
        };
        state.poll_interval_ms.store(interval_ms, Ordering::SeqCst);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
        }
    }

    state.running.store(false, Ordering::SeqCst);
    tracing::info!(worker_id = %worker.worker_id, "worker stopped");
}

/// Claim and process at most one job. `Ok(true)` when a job was claimed.
async fn poll_once(worker: &Worker, state: &WorkerState) -> anyhow::Result<bool> {
    let Some(job) = worker.queue.claim(&worker.worker_id).await? else {
        return Ok(false);
    };

    let _processing = ProcessingGuard::enter(&state.processing);
    process_job(worker, job).await?;
    Ok(true)
}

async fn process_job(worker: &Worker, job: JobRecord) -> anyhow::Result<()> {
    let job_id = job.id.to_string();
    let kind = job.kind.as_str();
    tracing::debug!(
        job_id = %job_id,
        job_type = kind,
        attempt = job.attempts,
        max_attempts = job.max_attempts,
        "claimed job"
    );

    let timing = telemetry::record_job_start(&job_id);
    let status = telemetry::instrument_dispatch(
        &job_id,
        kind,
        worker.dispatcher.dispatch(&job, &worker.queue),
    )
    .await;

    let (error, should_retry) = match status {
        DispatchStatus::Success { .. } => {
            worker
                .queue
                .complete(job.id)
                .instrument(telemetry::job_complete_span(&job_id, kind, "completed"))
                .await?;
            telemetry::record_job_finished(&job_id, kind, "completed");
            telemetry::record_job_end(timing, kind, "completed");
            return Ok(());
        }
        DispatchStatus::RetryableFailure { error } => (error, true),
        DispatchStatus::PermanentFailure { error } => (error, false),
    };

    let outcome = worker
        .queue
        .fail(job.id, &error, should_retry)
        .instrument(telemetry::job_complete_span(&job_id, kind, "failed"))
        .await?;

    let status = match outcome {
        Some(FailureOutcome::Retrying {
            attempts,
            delay_ms,
            available_at,
        }) => {
            tracing::warn!(
                job_id = %job_id,
                job_type = kind,
                attempts,
                delay_ms,
                %available_at,
                error = %error,
                "job failed, retry scheduled"
            );
            "retrying"
        }
        Some(FailureOutcome::DeadLettered { attempts }) => {
            tracing::error!(
                job_id = %job_id,
                job_type = kind,
                attempts,
                error = %error,
                "job moved to dead letter"
            );
            "dead_letter"
        }
        None => {
            tracing::warn!(
                job_id = %job_id,
                job_type = kind,
                "job was no longer processing when its failure was recorded"
            );
            return Ok(());
        }
    };

    telemetry::record_job_finished(&job_id, kind, status);
    telemetry::record_job_end(timing, kind, status);
    Ok(())
}

/// Spawn the periodic stuck-job sweep (and optional retention cleanup).
fn spawn_reaper(
    worker_id: String,
    queue: JobQueue,
    config: WorkerConfig,
    shutdown: ShutdownToken,
) -> JoinHandle<()> {
    let interval = Duration::from_millis(config.reaper_interval_ms);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(worker_id = %worker_id, "reaper shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = queue
                        .recover_stuck_jobs(config.stuck_job_timeout_minutes)
                        .await
                    {
                        tracing::warn!(worker_id = %worker_id, error = %err, "stuck job sweep failed");
                    }
                    if config.run_cleanup {
                        if let Err(err) = queue.cleanup_expired().await {
                            tracing::warn!(worker_id = %worker_id, error = %err, "retention cleanup failed");
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn cancel_before_wait_resolves_immediately() {
        let token = ShutdownToken::default();
        assert!(!token.is_cancelled());
        assert!(token.cancelled().now_or_never().is_none());

        token.clone().cancel();
        assert!(token.is_cancelled());
        assert!(token.cancelled().now_or_never().is_some());
    }

    #[tokio::test]
    async fn cancel_interrupts_idle_sleep_in_every_task() {
        let token = ShutdownToken::new();
        let idle = |token: ShutdownToken| async move {
            tokio::select! {
                _ = token.cancelled() => true,
                _ = tokio::time::sleep(Duration::from_secs(3_600)) => false,
            }
        };
        let poller = tokio::spawn(idle(token.clone()));
        let reaper = tokio::spawn(idle(token.clone()));
        tokio::task::yield_now().await;

        token.cancel();

        assert!(poller.await.unwrap(), "poll loop slept through shutdown");
        assert!(reaper.await.unwrap(), "reaper slept through shutdown");
    }

    #[test]
    fn processing_guard_clears_flag_on_drop() {
        let flag = AtomicBool::new(false);
        {
            let _guard = ProcessingGuard::enter(&flag);
            assert!(flag.load(Ordering::SeqCst));
        }
        assert!(!flag.load(Ordering::SeqCst));
    }
}
