/// Builder for constructing workers.
pub mod builder;
/// Worker poll loop, reaper task, and shutdown handling.
pub mod supervisor;
/// Worker configuration and poll backoff.
pub mod worker;

pub use builder::WorkerBuilder;
pub use supervisor::{
    DispatchStatus, JobDispatcher, ShutdownToken, StopOutcome, Worker, WorkerHandle,
};
pub use worker::{generate_worker_id, PollBackoff, WorkerConfig};
