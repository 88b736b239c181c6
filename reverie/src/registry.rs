//! Handler registration and dispatch.
//!
//! A [`HandlerRegistry`] maps every [`JobKind`] to one [`JobHandler`]. It is
//! built once through [`HandlerRegistryBuilder`] and is immutable afterwards;
//! the worker holds it behind an `Arc` and calls it through the
//! [`JobDispatcher`] trait.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::job::{JobId, JobKind, JobPayload, JobRecord};
use crate::queue::JobQueue;
use crate::runtime::{DispatchStatus, JobDispatcher};

/// Result a handler reports for one execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub data: Option<serde_json::Value>,
    /// Ignored on success. Defaults to `true` on failure.
    pub should_retry: bool,
}

impl JobOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
            data: None,
            should_retry: true,
        }
    }

    pub fn success_with(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Self::success()
        }
    }

    /// A transient failure; retried with backoff while attempts remain.
    pub fn retry(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            data: None,
            should_retry: true,
        }
    }

    /// An unrecoverable failure; the job is dead-lettered immediately.
    pub fn permanent(error: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            ..Self::retry(error)
        }
    }
}

/// Per-execution context handed to a handler.
///
/// Cloning is cheap; clones share the successor buffer.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    kind: JobKind,
    attempts: i32,
    max_attempts: i32,
    user_id: Option<String>,
    queue: JobQueue,
    chained: Arc<Mutex<Vec<JobPayload>>>,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("kind", &self.kind)
            .field("attempts", &self.attempts)
            .field("max_attempts", &self.max_attempts)
            .field("user_id", &self.user_id)
            .field("chained", &self.chained.lock().len())
            .finish_non_exhaustive()
    }
}

impl JobContext {
    pub fn new(job: &JobRecord, queue: JobQueue) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            user_id: job.user_id.clone(),
            queue,
            chained: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// 1-based number of the current attempt.
    pub fn attempt(&self) -> i32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Queue handle for anything beyond deferred chaining.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Buffer a downstream job. It is enqueued only if this handler succeeds.
    pub fn chain(&self, payload: JobPayload) {
        self.chained.lock().push(payload);
    }

    /// Jobs buffered via [`JobContext::chain`] so far.
    pub fn chained(&self) -> Vec<JobPayload> {
        self.chained.lock().clone()
    }

    fn take_chained(&self) -> Vec<JobPayload> {
        std::mem::take(&mut *self.chained.lock())
    }

    /// Enqueue buffered successors with their stage keys.
    async fn flush_chained(&self) -> anyhow::Result<usize> {
        let chained = self.take_chained();
        let count = chained.len();
        for payload in chained {
            let mut options = self
                .queue
                .default_options()
                .with_idempotency_key(payload.pipeline_key());
            if let Some(user_id) = &self.user_id {
                options = options.with_user_id(user_id.clone());
            }
            let handle = self.queue.enqueue(&payload, options).await?;
            tracing::debug!(
                parent = %self.job_id,
                job_id = %handle.id,
                job_type = %handle.kind,
                created = handle.created,
                "chained successor job"
            );
        }
        Ok(count)
    }
}

/// Processes jobs of one kind.
///
/// Returning `Err` is treated like [`JobOutcome::retry`]; so is a panic.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, payload: JobPayload) -> anyhow::Result<JobOutcome>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext, JobPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<JobOutcome>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, JobPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<JobOutcome>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, payload: JobPayload) -> anyhow::Result<JobOutcome> {
        (self.0)(ctx, payload).await
    }
}

/// Builder for [`HandlerRegistry`].
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    duplicates: Vec<JobKind>,
}

impl fmt::Debug for HandlerRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistryBuilder")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .field("duplicates", &self.duplicates)
            .finish()
    }
}

impl HandlerRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `kind`. Registering a kind twice makes
    /// [`HandlerRegistryBuilder::build`] fail.
    pub fn register<H>(mut self, kind: JobKind, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.register_arc(kind, Arc::new(handler));
        self
    }

    pub fn register_arc(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        if self.handlers.insert(kind, handler).is_some() {
            self.duplicates.push(kind);
        }
    }

    /// Build a registry that may leave kinds unhandled.
    ///
    /// Jobs of an unhandled kind are dead-lettered at dispatch.
    pub fn build(self) -> Result<HandlerRegistry, QueueError> {
        if let Some(kind) = self.duplicates.first() {
            return Err(QueueError::DuplicateHandler(*kind));
        }
        Ok(HandlerRegistry {
            handlers: self.handlers,
        })
    }

    /// Build a registry that covers every [`JobKind`].
    pub fn build_complete(self) -> Result<HandlerRegistry, QueueError> {
        let registry = self.build()?;
        let missing = registry.missing_kinds();
        if !missing.is_empty() {
            return Err(QueueError::MissingHandlers(missing));
        }
        Ok(registry)
    }
}

/// Immutable mapping from job kind to handler.
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().map(JobKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("HandlerRegistry").field("kinds", &kinds).finish()
    }
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::new()
    }

    pub fn get(&self, kind: JobKind) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(&kind)
    }

    pub fn contains(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn missing_kinds(&self) -> Vec<JobKind> {
        JobKind::ALL
            .iter()
            .copied()
            .filter(|kind| !self.handlers.contains_key(kind))
            .collect()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[async_trait]
impl JobDispatcher for HandlerRegistry {
    async fn dispatch(&self, job: &JobRecord, queue: &JobQueue) -> DispatchStatus {
        let Some(handler) = self.handlers.get(&job.kind) else {
            return DispatchStatus::PermanentFailure {
                error: format!("no handler registered for job type {}", job.kind),
            };
        };

        let payload = match job.decode_payload() {
            Ok(payload) => payload,
            Err(err) => {
                return DispatchStatus::PermanentFailure {
                    error: err.to_string(),
                }
            }
        };

        let ctx = JobContext::new(job, queue.clone());
        let result = AssertUnwindSafe(handler.handle(ctx.clone(), payload))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                return DispatchStatus::RetryableFailure {
                    error: format!("{err:#}"),
                }
            }
            Err(panic) => {
                return DispatchStatus::RetryableFailure {
                    error: format!("handler panicked: {}", panic_message(panic.as_ref())),
                }
            }
        };

        if !outcome.success {
            let error = outcome
                .error
                .unwrap_or_else(|| "handler reported failure".to_string());
            return if outcome.should_retry {
                DispatchStatus::RetryableFailure { error }
            } else {
                DispatchStatus::PermanentFailure { error }
            };
        }

        if let Err(err) = ctx.flush_chained().await {
            return DispatchStatus::RetryableFailure {
                error: format!("failed to enqueue successor job: {err:#}"),
            };
        }

        DispatchStatus::Success { data: outcome.data }
    }
}
