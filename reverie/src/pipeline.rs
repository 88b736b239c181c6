//! Entry points for the two reference pipelines.
//!
//! There is no orchestrator: each stage's handler chains the next one via
//! [`crate::registry::JobContext::chain`]. These helpers only start a chain,
//! keyed so that starting the same pipeline twice yields one job.

use uuid::Uuid;

use crate::job::{
    DetectPatternsPayload, EnqueueOptions, GenerateInsightsPayload, GenerateReviewPayload,
    GenerateTomorrowPlanPayload, InterpretEventPayload, JobHandle, JobPayload,
    SuggestUomUpdatePayload,
};
use crate::queue::JobQueue;

/// Enqueue a payload under its stage key.
pub async fn enqueue_stage(
    queue: &JobQueue,
    payload: &JobPayload,
    options: EnqueueOptions,
) -> anyhow::Result<JobHandle> {
    let options = options.with_idempotency_key(payload.pipeline_key());
    queue.enqueue(payload, options).await
}

/// Start interpretation of a newly recorded event.
pub async fn start_event_pipeline(
    queue: &JobQueue,
    event_id: Uuid,
    user_id: impl Into<String>,
) -> anyhow::Result<JobHandle> {
    let payload = JobPayload::InterpretEvent(InterpretEventPayload {
        event_id,
        user_id: user_id.into(),
    });
    enqueue_stage(queue, &payload, queue.default_options()).await
}

/// Start review generation for a closed period.
pub async fn start_review_pipeline(
    queue: &JobQueue,
    review: GenerateReviewPayload,
) -> anyhow::Result<JobHandle> {
    enqueue_stage(
        queue,
        &JobPayload::GenerateReview(review),
        queue.default_options(),
    )
    .await
}

/// Payload for the stage after an interpreted event.
pub fn detect_patterns_for(event: &InterpretEventPayload) -> JobPayload {
    JobPayload::DetectPatterns(DetectPatternsPayload {
        event_id: event.event_id,
        user_id: event.user_id.clone(),
    })
}

/// Payload for insight generation once patterns are known.
pub fn insights_for(detect: &DetectPatternsPayload, pattern_ids: Vec<Uuid>) -> JobPayload {
    JobPayload::GenerateInsights(GenerateInsightsPayload {
        event_id: detect.event_id,
        user_id: detect.user_id.clone(),
        pattern_ids,
    })
}

/// Payload for planning the day after a review.
pub fn tomorrow_plan_for(
    review: &GenerateReviewPayload,
    review_id: Uuid,
    plan_date: chrono::NaiveDate,
) -> JobPayload {
    JobPayload::GenerateTomorrowPlan(GenerateTomorrowPlanPayload {
        user_id: review.user_id.clone(),
        review_id,
        plan_date,
    })
}

/// Payload for the baseline suggestion that follows a plan.
pub fn uom_suggestion_for(plan: &GenerateTomorrowPlanPayload) -> JobPayload {
    JobPayload::SuggestUomUpdate(SuggestUomUpdatePayload {
        user_id: plan.user_id.clone(),
        review_id: plan.review_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobKind, ReviewType};

    #[test]
    fn successor_payloads_follow_reference_chains() {
        let event = InterpretEventPayload {
            event_id: Uuid::new_v4(),
            user_id: "u1".into(),
        };
        let detect = detect_patterns_for(&event);
        assert_eq!(Some(detect.kind()), JobKind::InterpretEvent.successor());

        let JobPayload::DetectPatterns(detect) = detect else {
            panic!("expected detect payload");
        };
        let insights = insights_for(&detect, vec![Uuid::new_v4()]);
        assert_eq!(Some(insights.kind()), JobKind::DetectPatterns.successor());
        assert_eq!(insights.user_id(), "u1");

        let review = GenerateReviewPayload {
            user_id: "u1".into(),
            review_type: ReviewType::Daily,
            period_key: "2024-03-01".into(),
            timezone: "UTC".into(),
        };
        let review_id = Uuid::new_v4();
        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let plan = tomorrow_plan_for(&review, review_id, date);
        assert_eq!(Some(plan.kind()), JobKind::GenerateReview.successor());

        let JobPayload::GenerateTomorrowPlan(plan) = plan else {
            panic!("expected plan payload");
        };
        let uom = uom_suggestion_for(&plan);
        assert_eq!(Some(uom.kind()), JobKind::GenerateTomorrowPlan.successor());
        assert_eq!(uom.pipeline_key(), format!("suggest_uom_update:{review_id}"));
    }
}
