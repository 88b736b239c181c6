use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reverie::*;
use tokio::sync::{Notify, Semaphore};

/// One scripted reaction of a [`MockHandler`].
#[derive(Clone, Debug)]
pub enum MockStep {
    Succeed,
    SucceedWith(serde_json::Value),
    /// Report a failure the worker should retry.
    Retry(String),
    /// Report a failure that dead-letters the job.
    Permanent(String),
    /// Return `Err` from the handler.
    Error(String),
    Panic(String),
}

#[derive(Clone, Debug)]
pub struct HandlerCall {
    pub job_id: JobId,
    pub kind: JobKind,
    pub attempt: i32,
    pub payload: JobPayload,
}

/// Handler that records every call and plays back a script.
///
/// Once the script runs out it keeps succeeding. Successors registered with
/// [`MockHandler::chaining`] are passed to [`JobContext::chain`] on every
/// call, whatever the step's outcome, so tests can check that only
/// successful runs actually enqueue them.
#[derive(Clone, Default)]
pub struct MockHandler {
    calls: Arc<Mutex<Vec<HandlerCall>>>,
    script: Arc<Mutex<VecDeque<MockStep>>>,
    successors: Arc<Mutex<Vec<JobPayload>>>,
    gate: Option<Arc<Semaphore>>,
    started: Arc<Notify>,
}

impl MockHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(steps: impl IntoIterator<Item = MockStep>) -> Self {
        let handler = Self::new();
        handler.script.lock().extend(steps);
        handler
    }

    /// Block each call until [`MockHandler::release`] is called.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn chaining(self, payload: JobPayload) -> Self {
        self.successors.lock().push(payload);
        self
    }

    /// Let one gated call finish.
    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    /// Resolves once a call has started.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn calls(&self) -> Vec<HandlerCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(
            actual, expected,
            "Expected {} handler calls, got {}",
            expected, actual
        );
    }
}

#[async_trait]
impl JobHandler for MockHandler {
    async fn handle(&self, ctx: JobContext, payload: JobPayload) -> anyhow::Result<JobOutcome> {
        self.calls.lock().push(HandlerCall {
            job_id: ctx.job_id(),
            kind: ctx.kind(),
            attempt: ctx.attempt(),
            payload,
        });
        self.started.notify_one();

        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }

        for successor in self.successors.lock().iter() {
            ctx.chain(successor.clone());
        }

        let step = self.script.lock().pop_front().unwrap_or(MockStep::Succeed);
        match step {
            MockStep::Succeed => Ok(JobOutcome::success()),
            MockStep::SucceedWith(data) => Ok(JobOutcome::success_with(data)),
            MockStep::Retry(error) => Ok(JobOutcome::retry(error)),
            MockStep::Permanent(error) => Ok(JobOutcome::permanent(error)),
            MockStep::Error(error) => Err(anyhow::anyhow!(error)),
            MockStep::Panic(message) => panic!("{message}"),
        }
    }
}

/// Records dispatched jobs and returns a fixed status, bypassing handlers.
#[derive(Clone)]
pub struct MockDispatcher {
    dispatches: Arc<Mutex<Vec<JobRecord>>>,
    result: Arc<Mutex<DispatchStatus>>,
}

impl MockDispatcher {
    pub fn with_result(result: DispatchStatus) -> Self {
        Self {
            dispatches: Arc::new(Mutex::new(Vec::new())),
            result: Arc::new(Mutex::new(result)),
        }
    }

    pub fn record(&self) -> Vec<JobRecord> {
        self.dispatches.lock().clone()
    }

    pub fn set_result(&self, result: DispatchStatus) {
        *self.result.lock() = result;
    }

    pub fn assert_dispatch_count_eq(&self, expected: usize) {
        let actual = self.dispatches.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} dispatches, got {}",
            expected, actual
        );
    }
}

#[async_trait]
impl JobDispatcher for MockDispatcher {
    async fn dispatch(&self, job: &JobRecord, _queue: &JobQueue) -> DispatchStatus {
        self.dispatches.lock().push(job.clone());
        self.result.lock().clone()
    }
}
