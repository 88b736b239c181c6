//! Reverie - durable job queue and worker runtime for the memory pipeline.
//!
//! Jobs live in a single Postgres table. Producers enqueue typed payloads,
//! any number of workers race to claim them through one atomic
//! select-and-mark statement, and handlers chain the next pipeline stage by
//! enqueueing it on success.
//!
//! # Core Concepts
//!
//! - **Job**: a row with a [`JobKind`], a typed [`JobPayload`] stored as JSON,
//!   a [`JobStatus`], priority, availability time and attempt counters.
//!
//! - **Store**: the [`JobStore`] and [`StuckJobScanner`] traits abstract the
//!   backend. [`JobQueue`] wraps one with telemetry and typed enqueue.
//!
//! - **Registry**: a [`HandlerRegistry`] maps each kind to a [`JobHandler`],
//!   built once and immutable afterwards.
//!
//! - **Worker**: a [`Worker`] polls with additive backoff, dispatches one job
//!   at a time, and runs the stuck-job reaper on a timer. Its
//!   [`WorkerHandle`] supports graceful stop.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL job store via sqlx
//! - `metrics` - Prometheus metrics support
//! - `subscriber` - `telemetry::init_tracing` for binaries
//!
//! # Example
//!
//! ```ignore
//! use reverie::*;
//!
//! let store = PostgresJobStore::new(pool);
//! store.migrate().await?;
//! let queue = JobQueue::new(Arc::new(store), QueueConfig::default());
//!
//! pipeline::start_event_pipeline(&queue, event_id, "user-1").await?;
//!
//! let registry = HandlerRegistry::builder()
//!     .register(JobKind::InterpretEvent, InterpretHandler::new(llm))
//!     .build()?;
//! let mut handle = Worker::builder()
//!     .with_queue(queue)
//!     .with_registry(registry)
//!     .build()?
//!     .start()
//!     .await;
//! handle.stop(true, Duration::from_secs(30)).await;
//! ```

/// Configuration structures for persistence, queue and retry settings.
pub mod config;

/// Typed errors for identifiable queue failures.
pub mod error;

/// Job identifiers, kinds, statuses, payloads and records.
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
pub mod persistence;

/// Entry points and successor payloads for the reference pipelines.
pub mod pipeline;

/// The store traits and the [`JobQueue`] facade.
pub mod queue;

/// Handler trait, execution context and the immutable registry.
pub mod registry;

/// Retry backoff and cutoff arithmetic shared by all stores.
pub mod retry;

/// Worker loop, reaper task, and shutdown handling.
pub mod runtime;

/// Tracing spans and metric recording helpers.
pub mod telemetry;

pub use config::*;
pub use error::QueueError;
pub use job::*;
#[cfg(feature = "postgres")]
pub use persistence::PostgresJobStore;
pub use queue::*;
pub use registry::*;
pub use retry::*;
pub use runtime::*;
