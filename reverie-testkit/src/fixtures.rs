//! Ready-made payloads for tests.

use chrono::NaiveDate;
use reverie::*;
use uuid::Uuid;

pub fn interpret_event(user_id: &str) -> JobPayload {
    interpret_event_for(Uuid::new_v4(), user_id)
}

pub fn interpret_event_for(event_id: Uuid, user_id: &str) -> JobPayload {
    JobPayload::InterpretEvent(InterpretEventPayload {
        event_id,
        user_id: user_id.to_string(),
    })
}

pub fn detect_patterns_for(event_id: Uuid, user_id: &str) -> JobPayload {
    JobPayload::DetectPatterns(DetectPatternsPayload {
        event_id,
        user_id: user_id.to_string(),
    })
}

pub fn generate_insights_for(event_id: Uuid, user_id: &str) -> JobPayload {
    JobPayload::GenerateInsights(GenerateInsightsPayload {
        event_id,
        user_id: user_id.to_string(),
        pattern_ids: Vec::new(),
    })
}

pub fn review(user_id: &str, review_type: ReviewType, period_key: &str) -> GenerateReviewPayload {
    GenerateReviewPayload {
        user_id: user_id.to_string(),
        review_type,
        period_key: period_key.to_string(),
        timezone: "UTC".to_string(),
    }
}

pub fn daily_review(user_id: &str, day: &str) -> JobPayload {
    JobPayload::GenerateReview(review(user_id, ReviewType::Daily, day))
}

pub fn tomorrow_plan(user_id: &str, review_id: Uuid, plan_date: NaiveDate) -> JobPayload {
    JobPayload::GenerateTomorrowPlan(GenerateTomorrowPlanPayload {
        user_id: user_id.to_string(),
        review_id,
        plan_date,
    })
}

pub fn uom_suggestion(user_id: &str, review_id: Uuid) -> JobPayload {
    JobPayload::SuggestUomUpdate(SuggestUomUpdatePayload {
        user_id: user_id.to_string(),
        review_id,
    })
}
