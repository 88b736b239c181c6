use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use reverie::retry::{
    checked_delay, decide_failure, next_available_at, retention_cutoff, stuck_cutoff,
    FailureDecision, RetryPolicy,
};
use reverie::*;

/// In-memory [`JobStore`] with the same transition rules as the Postgres
/// store.
///
/// A single mutex makes every operation atomic, which gives claim the
/// exclusivity the database gets from `FOR UPDATE SKIP LOCKED`. The store's
/// clock can be moved forward so tests can step through backoff delays and
/// stuck-job timeouts without sleeping.
#[derive(Clone)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<StoreState>>,
    clock_offset: Arc<Mutex<Duration>>,
    claim_calls: Arc<AtomicUsize>,
    claim_errors: Arc<AtomicUsize>,
}

#[derive(Default)]
struct StoreState {
    jobs: HashMap<JobId, JobRecord>,
    keys: HashMap<String, JobId>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            clock_offset: Arc::new(Mutex::new(Duration::zero())),
            claim_calls: Arc::new(AtomicUsize::new(0)),
            claim_errors: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A [`JobQueue`] backed by a clone of this store.
    pub fn queue(&self) -> JobQueue {
        self.queue_with_config(QueueConfig::default())
    }

    pub fn queue_with_config(&self, config: QueueConfig) -> JobQueue {
        JobQueue::new(Arc::new(self.clone()), config)
    }

    /// The store's notion of "now".
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + *self.clock_offset.lock()
    }

    /// Move the store's clock forward.
    pub fn advance_clock(&self, by: Duration) {
        *self.clock_offset.lock() += by;
    }

    /// Number of `claim` calls served so far, including failed ones.
    pub fn claim_calls(&self) -> usize {
        self.claim_calls.load(Ordering::SeqCst)
    }

    /// Make the next `count` claims fail as if the store were unreachable.
    pub fn fail_next_claims(&self, count: usize) {
        self.claim_errors.store(count, Ordering::SeqCst);
    }

    pub fn job(&self, job_id: JobId) -> Option<JobRecord> {
        self.state.lock().jobs.get(&job_id).cloned()
    }

    /// All jobs, oldest first.
    pub fn jobs(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<_> = self.state.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|job| (job.created_at, job.id.0));
        jobs
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<JobRecord> {
        self.jobs()
            .into_iter()
            .filter(|job| job.status == status)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make a pending job claimable right away.
    pub fn make_available(&self, job_id: JobId) -> bool {
        let now = self.now();
        self.update(job_id, |job| job.available_at = now)
    }

    pub fn set_available_at(&self, job_id: JobId, at: DateTime<Utc>) -> bool {
        self.update(job_id, |job| job.available_at = at)
    }

    pub fn set_locked_at(&self, job_id: JobId, at: DateTime<Utc>) -> bool {
        self.update(job_id, |job| job.locked_at = Some(at))
    }

    pub fn set_completed_at(&self, job_id: JobId, at: DateTime<Utc>) -> bool {
        self.update(job_id, |job| job.completed_at = Some(at))
    }

    fn update(&self, job_id: JobId, f: impl FnOnce(&mut JobRecord)) -> bool {
        match self.state.lock().jobs.get_mut(&job_id) {
            Some(job) => {
                f(job);
                true
            }
            None => false,
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobStore")
            .field("jobs", &self.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> anyhow::Result<JobHandle> {
        let now = self.now();
        let mut state = self.state.lock();

        if let Some(key) = &job.idempotency_key {
            if let Some(existing) = state.keys.get(key).and_then(|id| state.jobs.get(id)) {
                return Ok(JobHandle {
                    id: existing.id,
                    kind: existing.kind,
                    created: false,
                });
            }
        }

        let available_at = checked_delay(now, job.delay_ms).ok_or_else(|| {
            anyhow::anyhow!("enqueue delay of {}ms is out of range", job.delay_ms)
        })?;
        let record = JobRecord {
            id: JobId::new(),
            kind: job.kind,
            payload: job.payload,
            status: JobStatus::Pending,
            priority: job.priority,
            available_at,
            attempts: 0,
            max_attempts: job.max_attempts,
            idempotency_key: job.idempotency_key,
            user_id: job.user_id,
            locked_at: None,
            locked_by: None,
            last_error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        };

        let handle = JobHandle {
            id: record.id,
            kind: record.kind,
            created: true,
        };
        if let Some(key) = &record.idempotency_key {
            state.keys.insert(key.clone(), record.id);
        }
        state.jobs.insert(record.id, record);
        Ok(handle)
    }

    async fn claim(&self, worker_id: &str) -> anyhow::Result<Option<JobRecord>> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .claim_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            anyhow::bail!("injected claim failure");
        }

        let now = self.now();
        let mut state = self.state.lock();

        let next = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.available_at <= now)
            .min_by_key(|job| (std::cmp::Reverse(job.priority), job.available_at, job.created_at))
            .map(|job| job.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        job.status = JobStatus::Processing;
        job.locked_at = Some(now);
        job.locked_by = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.attempts += 1;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: JobId) -> anyhow::Result<()> {
        let now = self.now();
        let mut state = self.state.lock();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Completed;
                job.completed_at = Some(now);
                job.locked_at = None;
                job.locked_by = None;
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        should_retry: bool,
        retry: &RetryPolicy,
    ) -> anyhow::Result<Option<FailureOutcome>> {
        let now = self.now();
        let mut state = self.state.lock();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Processing {
            return Ok(None);
        }

        // Resolve the retry time before touching the row so an out-of-range
        // delay leaves the job untouched.
        let retry_at = match decide_failure(job.attempts, job.max_attempts, should_retry, retry) {
            FailureDecision::Retry { delay_ms } => {
                let available_at = next_available_at(job.available_at, now, delay_ms)
                    .ok_or_else(|| anyhow::anyhow!("retry delay of {delay_ms}ms is out of range"))?;
                Some((delay_ms, available_at))
            }
            FailureDecision::DeadLetter => None,
        };

        job.last_error = Some(error.to_string());
        job.locked_at = None;
        job.locked_by = None;

        let outcome = match retry_at {
            Some((delay_ms, available_at)) => {
                job.status = JobStatus::Pending;
                job.available_at = available_at;
                FailureOutcome::Retrying {
                    attempts: job.attempts,
                    delay_ms,
                    available_at,
                }
            }
            None => {
                job.status = JobStatus::DeadLetter;
                job.completed_at = Some(now);
                FailureOutcome::DeadLettered {
                    attempts: job.attempts,
                }
            }
        };
        Ok(Some(outcome))
    }

    async fn get_job(&self, job_id: JobId) -> anyhow::Result<Option<JobRecord>> {
        Ok(self.job(job_id))
    }

    async fn queue_stats(&self) -> anyhow::Result<QueueStats> {
        let mut stats = QueueStats::new(self.now());
        for job in self.state.lock().jobs.values() {
            stats.add(job.status, 1);
            if job.status == JobStatus::Pending {
                *stats.by_type.entry(job.kind).or_default() += 1;
            }
        }
        Ok(stats)
    }

    async fn cleanup_old_jobs(&self, older_than_days: u32) -> anyhow::Result<u64> {
        let cutoff = retention_cutoff(self.now(), older_than_days);
        let mut state = self.state.lock();

        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| matches!(job.status, JobStatus::Completed | JobStatus::DeadLetter))
            .filter(|job| job.completed_at.is_some_and(|at| at < cutoff))
            .map(|job| job.id)
            .collect();

        for id in &expired {
            if let Some(job) = state.jobs.remove(id) {
                if let Some(key) = job.idempotency_key {
                    state.keys.remove(&key);
                }
            }
        }
        Ok(expired.len() as u64)
    }
}

#[async_trait]
impl StuckJobScanner for InMemoryJobStore {
    async fn recover_stuck_jobs(&self, stuck_job_timeout_minutes: u64) -> anyhow::Result<u64> {
        let cutoff = stuck_cutoff(self.now(), stuck_job_timeout_minutes);
        let mut state = self.state.lock();
        let mut recovered = 0;

        for job in state.jobs.values_mut() {
            let stuck = job.status == JobStatus::Processing
                && job.locked_at.is_some_and(|at| at < cutoff);
            if !stuck {
                continue;
            }
            job.last_error = Some(format!(
                "recovered by reaper: locked by {} for more than {} minutes",
                job.locked_by.as_deref().unwrap_or("unknown worker"),
                stuck_job_timeout_minutes
            ));
            job.status = JobStatus::Pending;
            job.locked_at = None;
            job.locked_by = None;
            recovered += 1;
        }
        Ok(recovered)
    }
}
