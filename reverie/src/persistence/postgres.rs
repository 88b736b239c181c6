use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::job::{JobHandle, JobId, JobKind, JobRecord, JobStatus, NewJob};
use crate::queue::{FailureOutcome, JobStore, QueueStats, StuckJobScanner};
use crate::retry::{decide_failure, FailureDecision, RetryPolicy};

const UNIQUE_VIOLATION: &str = "23505";

const JOB_COLUMNS: &str = r#"
    id, job_type, payload, status, priority, available_at, attempts, max_attempts,
    idempotency_key, user_id, locked_at, locked_by, last_error,
    created_at, started_at, completed_at
"#;

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS reverie_jobs (
        id UUID PRIMARY KEY,
        job_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending','processing','completed','failed','dead_letter')),
        priority INTEGER NOT NULL DEFAULT 0,
        available_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3,
        idempotency_key TEXT UNIQUE,
        user_id TEXT,
        locked_at TIMESTAMPTZ,
        locked_by TEXT,
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS reverie_jobs_claim_idx
        ON reverie_jobs (priority DESC, available_at ASC)
        WHERE status = 'pending'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS reverie_jobs_locked_idx
        ON reverie_jobs (locked_at)
        WHERE status = 'processing'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS reverie_jobs_finished_idx
        ON reverie_jobs (completed_at)
        WHERE status IN ('completed','dead_letter')
    "#,
];

/// PostgreSQL-backed job store.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of workers in any
/// number of processes can poll the same table without blocking each other.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the jobs table and its indexes if they do not exist.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("reverie_jobs schema is up to date");
        Ok(())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> anyhow::Result<Option<JobHandle>> {
        let row = sqlx::query("SELECT id, job_type FROM reverie_jobs WHERE idempotency_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> anyhow::Result<JobHandle> {
            let id: Uuid = row.try_get("id")?;
            let kind: String = row.try_get("job_type")?;
            Ok(JobHandle {
                id: JobId(id),
                kind: JobKind::from_str(&kind)?,
                created: false,
            })
        })
        .transpose()
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn job_from_row(row: &PgRow) -> anyhow::Result<JobRecord> {
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;

    Ok(JobRecord {
        id: JobId(row.try_get("id")?),
        kind: JobKind::from_str(&job_type)?,
        payload: row.try_get("payload")?,
        status: JobStatus::from_str(&status)?,
        priority: row.try_get("priority")?,
        available_at: row.try_get("available_at")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        idempotency_key: row.try_get("idempotency_key")?,
        user_id: row.try_get("user_id")?,
        locked_at: row.try_get("locked_at")?,
        locked_by: row.try_get("locked_by")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(&self, job: NewJob) -> anyhow::Result<JobHandle> {
        let job_id = JobId::new();

        let insert_res = sqlx::query(
            r#"
            INSERT INTO reverie_jobs (
                id, job_type, payload, status, priority, available_at,
                attempts, max_attempts, idempotency_key, user_id, created_at
            )
            VALUES (
                $1, $2, $3, 'pending', $4,
                NOW() + ($5::bigint) * INTERVAL '1 millisecond',
                0, $6, $7, $8, NOW()
            )
            "#,
        )
        .bind(job_id.0)
        .bind(job.kind.as_str())
        .bind(&job.payload)
        .bind(job.priority)
        .bind(to_i64(job.delay_ms))
        .bind(job.max_attempts)
        .bind(&job.idempotency_key)
        .bind(&job.user_id)
        .execute(&self.pool)
        .await;

        match insert_res {
            Ok(_) => Ok(JobHandle {
                id: job_id,
                kind: job.kind,
                created: true,
            }),
            Err(err) if is_unique_violation(&err) => {
                // Only idempotency_key can collide; id is a fresh v7 uuid.
                let Some(key) = job.idempotency_key.as_deref() else {
                    return Err(err.into());
                };
                match self.find_by_idempotency_key(key).await? {
                    Some(existing) => {
                        debug!(
                            job_id = %existing.id,
                            idempotency_key = key,
                            "idempotency key already enqueued"
                        );
                        Ok(existing)
                    }
                    None => Err(anyhow::anyhow!(
                        "enqueue conflict on idempotency key {key:?}: could not resolve existing row"
                    )),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn claim(&self, worker_id: &str) -> anyhow::Result<Option<JobRecord>> {
        let query = format!(
            r#"
            WITH next_job AS (
                SELECT id AS next_id
                FROM reverie_jobs
                WHERE status = 'pending'
                  AND available_at <= NOW()
                ORDER BY priority DESC, available_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE reverie_jobs
            SET status = 'processing',
                locked_at = NOW(),
                locked_by = $1,
                started_at = NOW(),
                attempts = reverie_jobs.attempts + 1
            FROM next_job
            WHERE reverie_jobs.id = next_job.next_id
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&query)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn complete(&self, job_id: JobId) -> anyhow::Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE reverie_jobs
            SET status = 'completed',
                completed_at = NOW(),
                locked_at = NULL,
                locked_by = NULL
            WHERE id = $1
              AND status = 'processing'
            "#,
        )
        .bind(job_id.0)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            warn!(%job_id, "complete ignored: job is not processing");
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        should_retry: bool,
        retry: &RetryPolicy,
    ) -> anyhow::Result<Option<FailureOutcome>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT attempts, max_attempts
            FROM reverie_jobs
            WHERE id = $1
              AND status = 'processing'
            FOR UPDATE
            "#,
        )
        .bind(job_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            drop(tx);
            warn!(%job_id, "fail ignored: job is not processing");
            return Ok(None);
        };

        let attempts: i32 = row.try_get("attempts")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;

        let outcome = match decide_failure(attempts, max_attempts, should_retry, retry) {
            FailureDecision::Retry { delay_ms } => {
                let available_at: DateTime<Utc> = sqlx::query_scalar(
                    r#"
                    UPDATE reverie_jobs
                    SET status = 'pending',
                        last_error = $2,
                        available_at = GREATEST(
                            available_at,
                            NOW() + ($3::bigint) * INTERVAL '1 millisecond'
                        ),
                        locked_at = NULL,
                        locked_by = NULL
                    WHERE id = $1
                    RETURNING available_at
                    "#,
                )
                .bind(job_id.0)
                .bind(error)
                .bind(to_i64(delay_ms))
                .fetch_one(&mut *tx)
                .await?;

                FailureOutcome::Retrying {
                    attempts,
                    delay_ms,
                    available_at,
                }
            }
            FailureDecision::DeadLetter => {
                sqlx::query(
                    r#"
                    UPDATE reverie_jobs
                    SET status = 'dead_letter',
                        last_error = $2,
                        completed_at = NOW(),
                        locked_at = NULL,
                        locked_by = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(job_id.0)
                .bind(error)
                .execute(&mut *tx)
                .await?;

                FailureOutcome::DeadLettered { attempts }
            }
        };

        tx.commit().await?;
        Ok(Some(outcome))
    }

    async fn get_job(&self, job_id: JobId) -> anyhow::Result<Option<JobRecord>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM reverie_jobs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn queue_stats(&self) -> anyhow::Result<QueueStats> {
        let mut stats = QueueStats::new(Utc::now());

        let rows = sqlx::query(
            "SELECT status, COUNT(*)::bigint AS count FROM reverie_jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            stats.add(JobStatus::from_str(&status)?, count.max(0) as u64);
        }

        let rows = sqlx::query(
            r#"
            SELECT job_type, COUNT(*)::bigint AS count
            FROM reverie_jobs
            WHERE status = 'pending'
            GROUP BY job_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let job_type: String = row.try_get("job_type")?;
            let count: i64 = row.try_get("count")?;
            match JobKind::from_str(&job_type) {
                Ok(kind) => {
                    stats.by_type.insert(kind, count.max(0) as u64);
                }
                Err(err) => warn!(job_type = %job_type, error = %err, "skipping unknown job type in stats"),
            }
        }

        Ok(stats)
    }

    async fn cleanup_old_jobs(&self, older_than_days: u32) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM reverie_jobs
            WHERE status IN ('completed','dead_letter')
              AND completed_at < NOW() - ($1::bigint) * INTERVAL '1 day'
            "#,
        )
        .bind(i64::from(older_than_days))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}

#[async_trait]
impl StuckJobScanner for PostgresJobStore {
    async fn recover_stuck_jobs(&self, stuck_job_timeout_minutes: u64) -> anyhow::Result<u64> {
        // SET expressions read the pre-update row, so locked_by is still visible.
        let res = sqlx::query(
            r#"
            UPDATE reverie_jobs
            SET status = 'pending',
                last_error = 'recovered by reaper: locked by '
                    || COALESCE(locked_by, 'unknown worker')
                    || ' for more than ' || $1::bigint || ' minutes',
                locked_at = NULL,
                locked_by = NULL
            WHERE status = 'processing'
              AND locked_at < NOW() - ($1::bigint) * INTERVAL '1 minute'
            "#,
        )
        .bind(to_i64(stuck_job_timeout_minutes))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}
