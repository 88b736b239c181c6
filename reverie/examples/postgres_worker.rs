//! Postgres-backed worker running both memory pipelines with stub handlers.
//!
//! # Prerequisites
//!
//! A reachable PostgreSQL database. The table is created on startup.
//!
//! # Running the Example
//!
//! ```bash
//! export DATABASE_URL="postgres://localhost/reverie_example"
//! cargo run --example postgres_worker --features postgres,subscriber
//! ```
//!
//! Press Ctrl-C to stop; the in-flight job is allowed to finish.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reverie::*;
use uuid::Uuid;

/// Simulated stage that chains the next pipeline stage on success.
struct StageHandler {
    work: Duration,
}

#[async_trait]
impl JobHandler for StageHandler {
    async fn handle(&self, ctx: JobContext, payload: JobPayload) -> anyhow::Result<JobOutcome> {
        tracing::info!(
            job_id = %ctx.job_id(),
            job_type = %ctx.kind(),
            attempt = ctx.attempt(),
            user_id = payload.user_id(),
            "running stage"
        );
        tokio::time::sleep(self.work).await;

        match &payload {
            JobPayload::InterpretEvent(event) => ctx.chain(pipeline::detect_patterns_for(event)),
            JobPayload::DetectPatterns(detect) => {
                ctx.chain(pipeline::insights_for(detect, vec![Uuid::new_v4()]))
            }
            JobPayload::GenerateReview(review) => {
                let plan_date = chrono::Utc::now().date_naive() + chrono::Days::new(1);
                ctx.chain(pipeline::tomorrow_plan_for(review, Uuid::new_v4(), plan_date))
            }
            JobPayload::GenerateTomorrowPlan(plan) => ctx.chain(pipeline::uom_suggestion_for(plan)),
            JobPayload::GenerateInsights(_) | JobPayload::SuggestUomUpdate(_) => {}
        }

        Ok(JobOutcome::success())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("info,reverie=debug");

    let pool = PersistenceConfig::from_env()?.connect().await?;
    let config = QueueConfig::default();
    config.validate()?;
    let store = PostgresJobStore::new(pool);
    store.migrate().await?;
    let queue = JobQueue::new(Arc::new(store), config);

    let stage: Arc<dyn JobHandler> = Arc::new(StageHandler {
        work: Duration::from_millis(250),
    });
    let mut builder = HandlerRegistry::builder();
    for kind in JobKind::ALL {
        builder.register_arc(kind, Arc::clone(&stage));
    }
    let registry = builder.build_complete()?;

    pipeline::start_event_pipeline(&queue, Uuid::new_v4(), "demo-user").await?;
    pipeline::start_review_pipeline(
        &queue,
        GenerateReviewPayload {
            user_id: "demo-user".into(),
            review_type: ReviewType::Daily,
            period_key: chrono::Utc::now().format("%Y-%m-%d").to_string(),
            timezone: "UTC".into(),
        },
    )
    .await?;

    let mut handle = Worker::builder()
        .with_queue(queue.clone())
        .with_registry(registry)
        .with_config(WorkerConfig::new().with_poll_interval(200, 2_000, 200))
        .build()?
        .start()
        .await;
    tracing::info!(worker_id = handle.worker_id(), "worker running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    let outcome = handle.stop(true, Duration::from_secs(30)).await;
    let stats = queue.queue_stats().await?;
    tracing::info!(
        ?outcome,
        pending = stats.pending,
        completed = stats.completed,
        dead_letter = stats.dead_letter,
        "worker stopped"
    );
    Ok(())
}
