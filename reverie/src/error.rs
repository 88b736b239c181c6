use thiserror::Error;

use crate::job::{JobId, JobKind};

/// Identifiable failures raised by the queue and the worker runtime.
///
/// Store and worker operations return `anyhow::Result`; these variants are
/// the ones callers may want to match on after downcasting.
#[derive(Error, Debug)]
pub enum QueueError {
    /// A status column held a value outside the known lifecycle states.
    #[error("unknown job status: {0}")]
    UnknownStatus(String),

    /// A `job_type` column held a value no [`JobKind`] maps to.
    #[error("unknown job type: {0}")]
    UnknownJobKind(String),

    /// The stored payload does not match the schema of its job type.
    #[error("payload for {kind} job could not be decoded: {source}")]
    PayloadDecode {
        kind: JobKind,
        #[source]
        source: serde_json::Error,
    },

    /// A handler was registered twice for the same job type.
    #[error("a handler is already registered for {0}")]
    DuplicateHandler(JobKind),

    /// `build_complete` was asked for a registry that leaves kinds uncovered.
    #[error("no handler registered for: {}", format_kinds(.0))]
    MissingHandlers(Vec<JobKind>),

    /// Lookup of a job that does not exist.
    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

fn format_kinds(kinds: &[JobKind]) -> String {
    kinds
        .iter()
        .map(|kind| kind.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_handlers_lists_every_kind() {
        let err = QueueError::MissingHandlers(vec![
            JobKind::GenerateReview,
            JobKind::SuggestUomUpdate,
        ]);
        assert_eq!(
            err.to_string(),
            "no handler registered for: generate_review, suggest_uom_update"
        );
    }
}
