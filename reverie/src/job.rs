use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// Unique identifier of a queued job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of pipeline stages a worker knows how to run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    InterpretEvent,
    DetectPatterns,
    GenerateInsights,
    GenerateReview,
    GenerateTomorrowPlan,
    SuggestUomUpdate,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::InterpretEvent,
        JobKind::DetectPatterns,
        JobKind::GenerateInsights,
        JobKind::GenerateReview,
        JobKind::GenerateTomorrowPlan,
        JobKind::SuggestUomUpdate,
    ];

    /// Stable name stored in the `job_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::InterpretEvent => "interpret_event",
            JobKind::DetectPatterns => "detect_patterns",
            JobKind::GenerateInsights => "generate_insights",
            JobKind::GenerateReview => "generate_review",
            JobKind::GenerateTomorrowPlan => "generate_tomorrow_plan",
            JobKind::SuggestUomUpdate => "suggest_uom_update",
        }
    }

    /// The stage a successful handler of this kind usually chains into.
    ///
    /// Event chain: interpret -> detect patterns -> insights.
    /// Review chain: review -> tomorrow plan -> baseline (UOM) suggestion.
    pub fn successor(&self) -> Option<JobKind> {
        match self {
            JobKind::InterpretEvent => Some(JobKind::DetectPatterns),
            JobKind::DetectPatterns => Some(JobKind::GenerateInsights),
            JobKind::GenerateInsights => None,
            JobKind::GenerateReview => Some(JobKind::GenerateTomorrowPlan),
            JobKind::GenerateTomorrowPlan => Some(JobKind::SuggestUomUpdate),
            JobKind::SuggestUomUpdate => None,
        }
    }
}

impl Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| QueueError::UnknownJobKind(s.to_string()))
    }
}

/// Lifecycle state of a job row.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    /// Intermediate marker kept for schema compatibility; the engine itself
    /// moves failures straight back to `Pending` or on to `DeadLetter`.
    Failed,
    DeadLetter,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    /// Terminal rows are the only ones retention cleanup may delete.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLetter)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead_letter" => Ok(JobStatus::DeadLetter),
            other => Err(QueueError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewType {
    Daily,
    Weekly,
    Monthly,
}

impl ReviewType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewType::Daily => "daily",
            ReviewType::Weekly => "weekly",
            ReviewType::Monthly => "monthly",
        }
    }
}

impl Display for ReviewType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpretEventPayload {
    pub event_id: Uuid,
    pub user_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectPatternsPayload {
    pub event_id: Uuid,
    pub user_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateInsightsPayload {
    pub event_id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub pattern_ids: Vec<Uuid>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateReviewPayload {
    pub user_id: String,
    pub review_type: ReviewType,
    /// Period identifier such as `2026-10-16`, `2026-W42` or `2026-10`.
    pub period_key: String,
    pub timezone: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateTomorrowPlanPayload {
    pub user_id: String,
    pub review_id: Uuid,
    pub plan_date: NaiveDate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestUomUpdatePayload {
    pub user_id: String,
    pub review_id: Uuid,
}

/// Typed payload of a job; the variant fixes the job's [`JobKind`].
///
/// Only the inner struct is persisted (as JSON in the `payload` column); the
/// variant is recovered from the `job_type` column by [`JobPayload::decode`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    InterpretEvent(InterpretEventPayload),
    DetectPatterns(DetectPatternsPayload),
    GenerateInsights(GenerateInsightsPayload),
    GenerateReview(GenerateReviewPayload),
    GenerateTomorrowPlan(GenerateTomorrowPlanPayload),
    SuggestUomUpdate(SuggestUomUpdatePayload),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::InterpretEvent(_) => JobKind::InterpretEvent,
            JobPayload::DetectPatterns(_) => JobKind::DetectPatterns,
            JobPayload::GenerateInsights(_) => JobKind::GenerateInsights,
            JobPayload::GenerateReview(_) => JobKind::GenerateReview,
            JobPayload::GenerateTomorrowPlan(_) => JobKind::GenerateTomorrowPlan,
            JobPayload::SuggestUomUpdate(_) => JobKind::SuggestUomUpdate,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            JobPayload::InterpretEvent(p) => &p.user_id,
            JobPayload::DetectPatterns(p) => &p.user_id,
            JobPayload::GenerateInsights(p) => &p.user_id,
            JobPayload::GenerateReview(p) => &p.user_id,
            JobPayload::GenerateTomorrowPlan(p) => &p.user_id,
            JobPayload::SuggestUomUpdate(p) => &p.user_id,
        }
    }

    /// Stage-specific idempotency key, derived from the stage and the entity
    /// the stage works on. Re-running a pipeline step resolves to the same
    /// downstream job instead of creating a duplicate.
    pub fn pipeline_key(&self) -> String {
        let kind = self.kind();
        match self {
            JobPayload::InterpretEvent(p) => format!("{kind}:{}", p.event_id),
            JobPayload::DetectPatterns(p) => format!("{kind}:{}", p.event_id),
            JobPayload::GenerateInsights(p) => format!("{kind}:{}", p.event_id),
            JobPayload::GenerateReview(p) => format!(
                "{kind}:{}:{}:{}",
                p.user_id, p.review_type, p.period_key
            ),
            JobPayload::GenerateTomorrowPlan(p) => format!("{kind}:{}", p.review_id),
            JobPayload::SuggestUomUpdate(p) => format!("{kind}:{}", p.review_id),
        }
    }

    /// Serialize the inner payload for storage.
    pub fn encode(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            JobPayload::InterpretEvent(p) => serde_json::to_value(p),
            JobPayload::DetectPatterns(p) => serde_json::to_value(p),
            JobPayload::GenerateInsights(p) => serde_json::to_value(p),
            JobPayload::GenerateReview(p) => serde_json::to_value(p),
            JobPayload::GenerateTomorrowPlan(p) => serde_json::to_value(p),
            JobPayload::SuggestUomUpdate(p) => serde_json::to_value(p),
        }
    }

    /// Rebuild a typed payload from its stored kind and JSON body.
    pub fn decode(kind: JobKind, value: &serde_json::Value) -> Result<Self, QueueError> {
        let decoded = match kind {
            JobKind::InterpretEvent => {
                serde_json::from_value(value.clone()).map(JobPayload::InterpretEvent)
            }
            JobKind::DetectPatterns => {
                serde_json::from_value(value.clone()).map(JobPayload::DetectPatterns)
            }
            JobKind::GenerateInsights => {
                serde_json::from_value(value.clone()).map(JobPayload::GenerateInsights)
            }
            JobKind::GenerateReview => {
                serde_json::from_value(value.clone()).map(JobPayload::GenerateReview)
            }
            JobKind::GenerateTomorrowPlan => {
                serde_json::from_value(value.clone()).map(JobPayload::GenerateTomorrowPlan)
            }
            JobKind::SuggestUomUpdate => {
                serde_json::from_value(value.clone()).map(JobPayload::SuggestUomUpdate)
            }
        };
        decoded.map_err(|source| QueueError::PayloadDecode { kind, source })
    }
}

/// Options accepted by enqueue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Higher values are claimed first.
    pub priority: i32,
    /// Delay before the job becomes claimable, in milliseconds.
    pub delay_ms: u64,
    pub max_attempts: i32,
    pub idempotency_key: Option<String>,
    pub user_id: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay_ms: 0,
            max_attempts: 3,
            idempotency_key: None,
            user_id: None,
        }
    }
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// A fully resolved insert request handed to a [`crate::JobStore`].
#[derive(Clone, Debug)]
pub struct NewJob {
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub delay_ms: u64,
    pub max_attempts: i32,
    pub idempotency_key: Option<String>,
    pub user_id: Option<String>,
}

impl NewJob {
    /// Build an insert request from a raw JSON payload.
    pub fn new(kind: JobKind, payload: serde_json::Value, options: EnqueueOptions) -> Self {
        Self {
            kind,
            payload,
            priority: options.priority,
            delay_ms: options.delay_ms,
            max_attempts: options.max_attempts,
            idempotency_key: options.idempotency_key,
            user_id: options.user_id,
        }
    }

    /// Build an insert request from a typed payload.
    pub fn from_payload(payload: &JobPayload, options: EnqueueOptions) -> serde_json::Result<Self> {
        Ok(Self::new(payload.kind(), payload.encode()?, options))
    }
}

/// Returned from enqueue.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub kind: JobKind,
    /// False when an existing job with the same idempotency key was returned.
    pub created: bool,
}

/// A persisted job row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub priority: i32,
    pub available_at: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub idempotency_key: Option<String>,
    pub user_id: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn decode_payload(&self) -> Result<JobPayload, QueueError> {
        JobPayload::decode(self.kind, &self.payload)
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review_payload() -> JobPayload {
        JobPayload::GenerateReview(GenerateReviewPayload {
            user_id: "user-1".into(),
            review_type: ReviewType::Weekly,
            period_key: "2026-W42".into(),
            timezone: "Europe/Berlin".into(),
        })
    }

    #[test]
    fn job_kind_round_trips_through_its_column_name() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        assert!(matches!(
            "send_email".parse::<JobKind>(),
            Err(QueueError::UnknownJobKind(_))
        ));
    }

    #[test]
    fn job_status_rejects_unknown_values() {
        assert_eq!("dead_letter".parse::<JobStatus>().unwrap(), JobStatus::DeadLetter);
        assert!("archived".parse::<JobStatus>().is_err());
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn successors_form_the_two_reference_chains() {
        assert_eq!(JobKind::InterpretEvent.successor(), Some(JobKind::DetectPatterns));
        assert_eq!(JobKind::DetectPatterns.successor(), Some(JobKind::GenerateInsights));
        assert_eq!(JobKind::GenerateInsights.successor(), None);
        assert_eq!(JobKind::GenerateReview.successor(), Some(JobKind::GenerateTomorrowPlan));
        assert_eq!(JobKind::GenerateTomorrowPlan.successor(), Some(JobKind::SuggestUomUpdate));
        assert_eq!(JobKind::SuggestUomUpdate.successor(), None);
    }

    #[test]
    fn payload_decodes_against_its_stored_kind() {
        let payload = review_payload();
        let stored = payload.encode().unwrap();
        assert!(stored.get("type").is_none(), "only the inner struct is stored");

        let decoded = JobPayload::decode(JobKind::GenerateReview, &stored).unwrap();
        assert_eq!(decoded, payload);

        let err = JobPayload::decode(JobKind::GenerateTomorrowPlan, &stored).unwrap_err();
        assert!(matches!(
            err,
            QueueError::PayloadDecode { kind: JobKind::GenerateTomorrowPlan, .. }
        ));
    }

    #[test]
    fn pipeline_keys_are_stage_specific() {
        let event_id = Uuid::new_v4();
        let interpret = JobPayload::InterpretEvent(InterpretEventPayload {
            event_id,
            user_id: "u".into(),
        });
        let detect = JobPayload::DetectPatterns(DetectPatternsPayload {
            event_id,
            user_id: "u".into(),
        });
        assert_eq!(interpret.pipeline_key(), format!("interpret_event:{event_id}"));
        assert_ne!(interpret.pipeline_key(), detect.pipeline_key());
        assert_eq!(
            review_payload().pipeline_key(),
            "generate_review:user-1:weekly:2026-W42"
        );
    }

    #[test]
    fn enqueue_options_default_to_three_attempts() {
        let options = EnqueueOptions::default();
        assert_eq!(options.priority, 0);
        assert_eq!(options.delay_ms, 0);
        assert_eq!(options.max_attempts, 3);
        assert!(options.idempotency_key.is_none());

        let options = options.with_priority(5).with_idempotency_key("k");
        assert_eq!(options.priority, 5);
        assert_eq!(options.idempotency_key.as_deref(), Some("k"));
    }
}
