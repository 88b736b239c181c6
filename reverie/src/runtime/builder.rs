use std::fmt;
use std::sync::Arc;

use crate::queue::JobQueue;
use crate::registry::HandlerRegistry;

use super::supervisor::{JobDispatcher, Worker};
use super::worker::WorkerConfig;

/// Builder for constructing a [`Worker`] with explicit dependencies.
///
/// The builder validates that a queue and a dispatcher are provided before
/// constructing the worker, and validates the worker configuration.
///
/// # Example
///
/// ```ignore
/// use reverie::*;
///
/// let handle = Worker::builder()
///     .with_queue(queue)
///     .with_registry(registry)
///     .with_config(WorkerConfig::new().with_poll_interval(500, 5_000, 500))
///     .build()?
///     .start()
///     .await;
/// ```
#[derive(Default)]
pub struct WorkerBuilder {
    config: WorkerConfig,
    queue: Option<JobQueue>,
    dispatcher: Option<Arc<dyn JobDispatcher>>,
}

impl fmt::Debug for WorkerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerBuilder")
            .field("config", &self.config)
            .field("queue_set", &self.queue.is_some())
            .field("dispatcher_set", &self.dispatcher.is_some())
            .finish()
    }
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.config.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_queue(mut self, queue: JobQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Dispatch through an immutable handler registry.
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.dispatcher = Some(Arc::new(registry));
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn JobDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn build(self) -> anyhow::Result<Worker> {
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue dependency missing"))?;
        let dispatcher = self
            .dispatcher
            .ok_or_else(|| anyhow::anyhow!("dispatcher dependency missing"))?;

        Ok(Worker::new(queue, dispatcher, self.config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_queue_and_dispatcher() {
        let err = WorkerBuilder::new().build().unwrap_err();
        assert!(err.to_string().contains("queue dependency missing"));
    }

    #[test]
    fn debug_reports_missing_dependencies() {
        let rendered = format!("{:?}", WorkerBuilder::new().with_worker_id("w-1"));
        assert!(rendered.contains("queue_set: false"));
        assert!(rendered.contains("w-1"));
    }
}
