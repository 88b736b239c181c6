use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// Configuration for a single polling worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identifier recorded in `locked_by`. Generated when `None`.
    pub worker_id: Option<String>,
    /// Poll interval right after a job was claimed, in milliseconds.
    pub poll_interval_min_ms: u64,
    /// Ceiling for the idle poll interval, in milliseconds.
    pub poll_interval_max_ms: u64,
    /// Added to the poll interval after each empty poll, in milliseconds.
    pub poll_interval_step_ms: u64,
    /// Processing jobs locked for longer than this are reclaimed.
    pub stuck_job_timeout_minutes: u64,
    /// Interval between stuck-job sweeps, in milliseconds.
    pub reaper_interval_ms: u64,
    /// Delete terminal jobs past the queue's retention window on the reaper
    /// timer.
    pub run_cleanup: bool,
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Set the poll interval bounds and step.
    pub fn with_poll_interval(mut self, min_ms: u64, max_ms: u64, step_ms: u64) -> Self {
        self.poll_interval_min_ms = min_ms;
        self.poll_interval_max_ms = max_ms;
        self.poll_interval_step_ms = step_ms;
        self
    }

    pub fn with_stuck_job_timeout_minutes(mut self, minutes: u64) -> Self {
        self.stuck_job_timeout_minutes = minutes;
        self
    }

    pub fn with_reaper_interval(mut self, ms: u64) -> Self {
        self.reaper_interval_ms = ms;
        self
    }

    pub fn with_cleanup(mut self, enabled: bool) -> Self {
        self.run_cleanup = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.poll_interval_min_ms > self.poll_interval_max_ms {
            return Err(QueueError::InvalidConfig(format!(
                "poll_interval_min_ms ({}) exceeds poll_interval_max_ms ({})",
                self.poll_interval_min_ms, self.poll_interval_max_ms
            )));
        }
        if self.poll_interval_step_ms == 0 {
            return Err(QueueError::InvalidConfig(
                "poll_interval_step_ms must be greater than zero".into(),
            ));
        }
        if self.stuck_job_timeout_minutes == 0 {
            return Err(QueueError::InvalidConfig(
                "stuck_job_timeout_minutes must be greater than zero".into(),
            ));
        }
        if self.reaper_interval_ms == 0 {
            return Err(QueueError::InvalidConfig(
                "reaper_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// The configured id, or a fresh `worker-<pid>-<uuid-prefix>`.
    pub fn resolve_worker_id(&self) -> String {
        self.worker_id.clone().unwrap_or_else(generate_worker_id)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            poll_interval_min_ms: 1_000,
            poll_interval_max_ms: 10_000,
            poll_interval_step_ms: 1_000,
            stuck_job_timeout_minutes: 10,
            reaper_interval_ms: 5 * 60 * 1000,
            run_cleanup: false,
        }
    }
}

pub fn generate_worker_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}", std::process::id(), &uuid[..8])
}

/// Additive poll backoff bounded by `[min, max]`.
#[derive(Clone, Debug)]
pub struct PollBackoff {
    min_ms: u64,
    max_ms: u64,
    step_ms: u64,
    current_ms: u64,
}

impl PollBackoff {
    pub fn new(min_ms: u64, max_ms: u64, step_ms: u64) -> Self {
        Self {
            min_ms,
            max_ms,
            step_ms,
            current_ms: min_ms,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            config.poll_interval_min_ms,
            config.poll_interval_max_ms,
            config.poll_interval_step_ms,
        )
    }

    pub fn current_ms(&self) -> u64 {
        self.current_ms
    }

    pub fn current(&self) -> Duration {
        Duration::from_millis(self.current_ms)
    }

    /// A job was claimed.
    pub fn on_job(&mut self) -> u64 {
        self.current_ms = self.min_ms;
        self.current_ms
    }

    /// The queue had nothing eligible.
    pub fn on_empty(&mut self) -> u64 {
        self.current_ms = self
            .current_ms
            .saturating_add(self.step_ms)
            .min(self.max_ms);
        self.current_ms
    }

    /// The poll cycle itself failed (store unreachable and the like).
    pub fn on_error(&mut self) -> u64 {
        self.current_ms = self.max_ms;
        self.current_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval_min_ms, 1_000);
        assert_eq!(config.poll_interval_max_ms, 10_000);
        assert_eq!(config.stuck_job_timeout_minutes, 10);
        assert!(!config.run_cleanup);
    }

    #[test]
    fn validate_rejects_inverted_bounds_and_zero_step() {
        let inverted = WorkerConfig::new().with_poll_interval(500, 100, 10);
        assert!(matches!(inverted.validate(), Err(QueueError::InvalidConfig(_))));

        let zero_step = WorkerConfig::new().with_poll_interval(100, 500, 0);
        assert!(matches!(zero_step.validate(), Err(QueueError::InvalidConfig(_))));
    }

    #[test]
    fn generated_worker_ids_are_distinct_and_tagged_with_pid() {
        let a = WorkerConfig::new().resolve_worker_id();
        let b = WorkerConfig::new().resolve_worker_id();
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("worker-{}-", std::process::id())));
        assert_eq!(
            WorkerConfig::new().with_worker_id("w-1").resolve_worker_id(),
            "w-1"
        );
    }

    #[test]
    fn backoff_grows_by_step_and_clamps() {
        let mut backoff = PollBackoff::new(100, 450, 100);
        assert_eq!(backoff.current_ms(), 100);
        assert_eq!(backoff.on_empty(), 200);
        assert_eq!(backoff.on_empty(), 300);
        assert_eq!(backoff.on_empty(), 400);
        assert_eq!(backoff.on_empty(), 450);
        assert_eq!(backoff.on_empty(), 450);
        assert_eq!(backoff.on_job(), 100);
    }

    #[test]
    fn backoff_jumps_to_max_on_error() {
        let mut backoff = PollBackoff::new(100, 1_000, 100);
        backoff.on_empty();
        assert_eq!(backoff.on_error(), 1_000);
        assert_eq!(backoff.on_job(), 100);
    }
}
