//! Queue semantics exercised through the in-memory store: idempotent and
//! race-safe enqueue, exclusive claims, retry/backoff progression, reaper
//! selectivity and the retention boundary.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use reverie::*;
use reverie_testkit::{fixtures, InMemoryJobStore};

fn raw_options() -> EnqueueOptions {
    EnqueueOptions::new()
}

#[tokio::test]
async fn enqueue_without_key_creates_distinct_jobs() {
    let store = InMemoryJobStore::new();
    let queue = store.queue();
    let payload = serde_json::json!({"x": 1});

    let first = queue
        .enqueue_raw(JobKind::InterpretEvent, payload.clone(), raw_options())
        .await
        .unwrap();
    let second = queue
        .enqueue_raw(JobKind::InterpretEvent, payload, raw_options())
        .await
        .unwrap();

    assert_ne!(first.id, second.id);
    assert!(first.created && second.created);
    assert_eq!(store.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enqueue_with_same_key_yields_one_job() {
    let store = InMemoryJobStore::new();
    let queue = store.queue();
    let payload = fixtures::interpret_event("u1");

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let queue = queue.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(&payload, EnqueueOptions::new().with_idempotency_key("k"))
                    .await
            })
        })
        .collect();

    let mut ids = HashSet::new();
    let mut created = 0;
    for task in tasks {
        let handle = task.await.unwrap().unwrap();
        ids.insert(handle.id);
        if handle.created {
            created += 1;
        }
    }

    assert_eq!(ids.len(), 1, "all callers must see the same job id");
    assert_eq!(created, 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_share_a_job() {
    let store = InMemoryJobStore::new();
    let queue = store.queue();

    for _ in 0..5 {
        queue
            .enqueue(&fixtures::interpret_event("u1"), EnqueueOptions::new())
            .await
            .unwrap();
    }

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim(&format!("worker-{i}")).await })
        })
        .collect();

    let mut claimed = Vec::new();
    for task in tasks {
        if let Some(job) = task.await.unwrap().unwrap() {
            claimed.push(job.id);
        }
    }

    let unique: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), 5);
    assert_eq!(unique.len(), 5);
    assert!(store
        .jobs()
        .iter()
        .all(|job| job.status == JobStatus::Processing && job.attempts == 1));
}

#[tokio::test]
async fn claim_marks_lock_and_counts_attempt() {
    let store = InMemoryJobStore::new();
    let queue = store.queue();
    let handle = queue
        .enqueue(&fixtures::interpret_event("u1"), EnqueueOptions::new())
        .await
        .unwrap();

    let job = queue.claim("worker-a").await.unwrap().unwrap();
    assert_eq!(job.id, handle.id);
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.locked_by.as_deref(), Some("worker-a"));
    assert!(job.locked_at.is_some() && job.started_at.is_some());
    assert_eq!(job.attempts, 1);
    assert_eq!(job.user_id.as_deref(), Some("u1"));

    queue.complete(job.id).await.unwrap();
    let done = queue.require_job(job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.completed_at.is_some());
    assert!(!done.is_locked());
}

#[tokio::test]
async fn retry_progression_doubles_delay_then_dead_letters() {
    let store = InMemoryJobStore::new();
    let queue = store.queue();
    let handle = queue
        .enqueue(
            &fixtures::interpret_event("u1"),
            EnqueueOptions::new().with_max_attempts(3),
        )
        .await
        .unwrap();

    let mut delays = Vec::new();
    let mut available = Vec::new();
    for attempt in 1..=2 {
        let job = queue.claim("w").await.unwrap().expect("job should be claimable");
        assert_eq!(job.attempts, attempt);

        match queue.fail(job.id, "dependency down", true).await.unwrap() {
            Some(FailureOutcome::Retrying {
                attempts,
                delay_ms,
                available_at,
            }) => {
                assert_eq!(attempts, attempt);
                delays.push(delay_ms);
                available.push(available_at);
            }
            other => panic!("expected retry, got {other:?}"),
        }

        let job = store.job(handle.id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.last_error.as_deref(), Some("dependency down"));
        assert!(queue.claim("w").await.unwrap().is_none(), "backoff must hold the job");

        let waited = *delays.last().unwrap();
        store.advance_clock(Duration::milliseconds(waited as i64 + 1));
    }

    let job = queue.claim("w").await.unwrap().unwrap();
    assert_eq!(job.attempts, 3);
    let outcome = queue.fail(job.id, "dependency down", true).await.unwrap();
    assert_eq!(outcome, Some(FailureOutcome::DeadLettered { attempts: 3 }));

    assert_eq!(delays, vec![10_000, 20_000]);
    assert!(available[1] > available[0]);

    let job = store.job(handle.id).unwrap();
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert!(job.completed_at.is_some());
    assert!(queue.claim("w").await.unwrap().is_none());
}

#[tokio::test]
async fn non_retryable_failure_dead_letters_immediately() {
    let store = InMemoryJobStore::new();
    let queue = store.queue();
    queue
        .enqueue(&fixtures::interpret_event("u1"), EnqueueOptions::new())
        .await
        .unwrap();

    let job = queue.claim("w").await.unwrap().unwrap();
    let outcome = queue.fail(job.id, "malformed input", false).await.unwrap();
    assert_eq!(outcome, Some(FailureOutcome::DeadLettered { attempts: 1 }));
    assert_eq!(
        store.job(job.id).unwrap().last_error.as_deref(),
        Some("malformed input")
    );
}

#[tokio::test]
async fn reaper_only_recovers_jobs_past_the_timeout() {
    let store = InMemoryJobStore::new();
    let queue = store.queue();

    for _ in 0..2 {
        queue
            .enqueue(&fixtures::interpret_event("u1"), EnqueueOptions::new())
            .await
            .unwrap();
    }
    let recent = queue.claim("w-recent").await.unwrap().unwrap();
    let stale = queue.claim("w-stale").await.unwrap().unwrap();

    let now = store.now();
    store.set_locked_at(recent.id, now - Duration::minutes(2));
    store.set_locked_at(stale.id, now - Duration::minutes(15));

    let recovered = queue.recover_stuck_jobs(10).await.unwrap();
    assert_eq!(recovered, 1);

    let recent = store.job(recent.id).unwrap();
    assert_eq!(recent.status, JobStatus::Processing);
    assert_eq!(recent.locked_by.as_deref(), Some("w-recent"));

    let stale = store.job(stale.id).unwrap();
    assert_eq!(stale.status, JobStatus::Pending);
    assert!(stale.locked_at.is_none() && stale.locked_by.is_none());
    assert!(stale.last_error.unwrap().contains("w-stale"));
    // The reclaimed run still counts against the budget.
    assert_eq!(stale.attempts, 1);
}

#[tokio::test]
async fn recovered_job_is_claimable_again() {
    let store = InMemoryJobStore::new();
    let queue = store.queue();
    queue
        .enqueue(&fixtures::interpret_event("u1"), EnqueueOptions::new())
        .await
        .unwrap();
    let job = queue.claim("crashed").await.unwrap().unwrap();

    store.advance_clock(Duration::minutes(11));
    assert_eq!(queue.recover_stuck_jobs(10).await.unwrap(), 1);

    let again = queue.claim("survivor").await.unwrap().unwrap();
    assert_eq!(again.id, job.id);
    assert_eq!(again.attempts, 2);

    queue.complete(again.id).await.unwrap();
    // A late failure report from the crashed worker is ignored.
    assert!(queue.fail(job.id, "late", true).await.unwrap().is_none());
    assert_eq!(store.job(job.id).unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn cleanup_respects_retention_boundary_and_status() {
    let store = InMemoryJobStore::new();
    let queue = store.queue();

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(
            queue
                .enqueue(&fixtures::interpret_event("u1"), EnqueueOptions::new())
                .await
                .unwrap()
                .id,
        );
    }

    // old completed, old dead letter, recent completed, old processing, old pending
    store.set_available_at(ids[4], store.now() + Duration::days(1));
    for _ in 0..4 {
        queue.claim("w").await.unwrap().unwrap();
    }
    queue.complete(ids[0]).await.unwrap();
    queue.fail(ids[1], "boom", false).await.unwrap();
    queue.complete(ids[2]).await.unwrap();

    let now = store.now();
    store.set_completed_at(ids[0], now - Duration::days(8));
    store.set_completed_at(ids[1], now - Duration::days(30));
    store.set_completed_at(ids[2], now - Duration::days(6));
    store.set_locked_at(ids[3], now - Duration::days(60));
    store.set_available_at(ids[4], now - Duration::days(60));

    let deleted = queue.cleanup_old_jobs(7).await.unwrap();
    assert_eq!(deleted, 2);

    assert!(store.job(ids[0]).is_none());
    assert!(store.job(ids[1]).is_none());
    assert!(store.job(ids[2]).is_some());
    assert_eq!(store.job(ids[3]).unwrap().status, JobStatus::Processing);
    assert_eq!(store.job(ids[4]).unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn stats_count_statuses_and_pending_backlog_per_type() {
    let store = InMemoryJobStore::new();
    let queue = store.queue();

    queue
        .enqueue(&fixtures::interpret_event("u1"), EnqueueOptions::new())
        .await
        .unwrap();
    queue
        .enqueue(&fixtures::interpret_event("u2"), EnqueueOptions::new())
        .await
        .unwrap();
    queue
        .enqueue(
            &fixtures::daily_review("u1", "2024-03-01"),
            EnqueueOptions::new().with_priority(10),
        )
        .await
        .unwrap();

    let review = queue.claim("w").await.unwrap().unwrap();
    assert_eq!(review.kind, JobKind::GenerateReview);
    queue.complete(review.id).await.unwrap();

    let stats = queue.queue_stats().await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.total(), 3);
    assert_eq!(stats.by_type.get(&JobKind::InterpretEvent), Some(&2));
    assert_eq!(stats.by_type.get(&JobKind::GenerateReview), None);
}

#[tokio::test]
async fn pipeline_start_is_idempotent() {
    let store = InMemoryJobStore::new();
    let queue = store.queue();
    let event_id = uuid::Uuid::new_v4();

    let first = pipeline::start_event_pipeline(&queue, event_id, "u1").await.unwrap();
    let second = pipeline::start_event_pipeline(&queue, event_id, "u1").await.unwrap();

    assert_eq!(first.id, second.id);
    assert!(first.created && !second.created);

    let job = store.job(first.id).unwrap();
    assert_eq!(
        job.idempotency_key,
        Some(format!("interpret_event:{event_id}"))
    );
    assert!(matches!(
        job.decode_payload().unwrap(),
        JobPayload::InterpretEvent(InterpretEventPayload { event_id: id, .. }) if id == event_id
    ));
}

#[tokio::test]
async fn enqueue_rejects_zero_max_attempts() {
    let store = InMemoryJobStore::new();
    let queue = store.queue();
    let err = queue
        .enqueue(
            &fixtures::interpret_event("u1"),
            EnqueueOptions::new().with_max_attempts(0),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<QueueError>(),
        Some(QueueError::InvalidConfig(_))
    ));
    assert!(store.is_empty());
}

#[tokio::test]
async fn require_job_reports_missing_rows() {
    let queue = JobQueue::new(Arc::new(InMemoryJobStore::new()), QueueConfig::default());
    let err = queue.require_job(JobId::new()).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<QueueError>(),
        Some(QueueError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn pipeline_start_uses_queue_default_max_attempts() {
    let store = InMemoryJobStore::new();
    let queue = store.queue_with_config(QueueConfig::default().with_default_max_attempts(5));

    let handle = pipeline::start_event_pipeline(&queue, uuid::Uuid::new_v4(), "u1")
        .await
        .unwrap();

    let record = queue.require_job(handle.id).await.unwrap();
    assert_eq!(record.max_attempts, 5);
    assert_eq!(record.user_id.as_deref(), Some("u1"));
}

#[tokio::test]
async fn cleanup_expired_uses_configured_retention() {
    let store = InMemoryJobStore::new();
    let queue = store.queue_with_config(QueueConfig::default().with_retention_days(3));
    let job = queue
        .enqueue(&fixtures::interpret_event("u1"), raw_options())
        .await
        .unwrap();
    queue.claim("w").await.unwrap().unwrap();
    queue.complete(job.id).await.unwrap();
    store.set_completed_at(job.id, store.now() - Duration::days(4));

    assert_eq!(queue.cleanup_expired().await.unwrap(), 1);
    assert!(queue.get_job(job.id).await.unwrap().is_none());
}

#[tokio::test]
async fn queue_config_drives_retry_backoff() {
    let store = InMemoryJobStore::new();
    let queue = store.queue_with_config(
        QueueConfig::default()
            .with_retry_base_delay_ms(1_000)
            .with_retry_max_delay_ms(3_000),
    );
    let handle = queue
        .enqueue(
            &fixtures::interpret_event("u1"),
            EnqueueOptions::new().with_max_attempts(5),
        )
        .await
        .unwrap();

    let mut delays = Vec::new();
    for _ in 0..3 {
        queue.claim("w").await.unwrap().unwrap();
        match queue.fail(handle.id, "flaky", true).await.unwrap() {
            Some(FailureOutcome::Retrying { delay_ms, .. }) => delays.push(delay_ms),
            other => panic!("expected retry, got {other:?}"),
        }
        store.make_available(handle.id);
    }

    assert_eq!(delays, vec![2_000, 3_000, 3_000]);
}

#[tokio::test]
async fn every_stage_key_is_distinct_and_idempotent() {
    let store = InMemoryJobStore::new();
    let queue = store.queue();
    let event_id = uuid::Uuid::new_v4();
    let review_id = uuid::Uuid::new_v4();
    let plan_date = chrono::NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
    let stages = vec![
        fixtures::interpret_event_for(event_id, "u1"),
        fixtures::detect_patterns_for(event_id, "u1"),
        fixtures::generate_insights_for(event_id, "u1"),
        fixtures::daily_review("u1", "2024-03-01"),
        fixtures::tomorrow_plan("u1", review_id, plan_date),
        fixtures::uom_suggestion("u1", review_id),
    ];

    let keys: HashSet<String> = stages.iter().map(|stage| stage.pipeline_key()).collect();
    assert_eq!(keys.len(), stages.len());

    for stage in &stages {
        let first = pipeline::enqueue_stage(&queue, stage, queue.default_options())
            .await
            .unwrap();
        let again = pipeline::enqueue_stage(&queue, stage, queue.default_options())
            .await
            .unwrap();
        assert!(first.created);
        assert!(!again.created);
        assert_eq!(first.id, again.id);
        assert_eq!(first.kind, stage.kind());
    }
    assert_eq!(store.len(), stages.len());
}
