//! Postgres-backed job queue with at-least-once delivery.
//!
//! Jobs carrying a `unique_key` are deduplicated while pending or running: a second
//! enqueue with the same key is a no-op. A claimed job holds its claim until
//! `locked_until`; after that another worker may reclaim it.

use crate::error::AppError;
use crate::retry::RetryConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 25;
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A unit of work to enqueue.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub unique_key: Option<String>,
    pub run_at: DateTime<Utc>,
    pub max_attempts: i32,
    pub claim_ttl: Duration,
}

impl JobSpec {
    pub fn new<T: Serialize>(queue: &str, name: &str, payload: &T) -> Result<Self, AppError> {
        Ok(Self {
            queue: queue.to_string(),
            name: name.to_string(),
            payload: serde_json::to_value(payload)?,
            unique_key: None,
            run_at: Utc::now(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            claim_ttl: DEFAULT_CLAIM_TTL,
        })
    }

    pub fn unique(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    /// Schedule after `delay`; used to debounce bursts of identical triggers.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.run_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = run_at;
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub unique_key: Option<String>,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub claim_ttl_seconds: i64,
    pub run_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn parsed_status(&self) -> Option<JobStatus> {
        JobStatus::from_string(&self.status)
    }

    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, AppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Retrying { run_at: DateTime<Utc> },
    Failed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Retrying { .. } => "retrying",
            Self::Failed => "failed",
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Returns `None` when an in-flight job with the same unique key exists.
    async fn enqueue(&self, spec: JobSpec) -> Result<Option<Uuid>, AppError>;

    async fn claim_next(&self, queues: &[String]) -> Result<Option<Job>, AppError>;

    async fn complete(&self, job: &Job) -> Result<(), AppError>;

    async fn fail(&self, job: &Job, err: &AppError) -> Result<JobOutcome, AppError>;
}

/// Executes one kind of job, selected by [`JobHandler::name`].
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, job: &Job) -> Result<(), AppError>;
}

const JOB_COLUMNS: &str = "id, queue, name, payload, unique_key, status, attempts, max_attempts, \
     claim_ttl_seconds, run_at, locked_until, last_error, created_at, updated_at";

#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue inside a caller-owned transaction so the job commits with its cause.
    #[instrument(skip(conn, spec), fields(queue = %spec.queue, job = %spec.name))]
    pub async fn enqueue_in(
        conn: &mut PgConnection,
        spec: &JobSpec,
    ) -> Result<Option<Uuid>, AppError> {
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (id, queue, name, payload, unique_key, max_attempts, claim_ttl_seconds, run_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (unique_key) WHERE unique_key IS NOT NULL AND status IN ('pending', 'running')
            DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&spec.queue)
        .bind(&spec.name)
        .bind(&spec.payload)
        .bind(&spec.unique_key)
        .bind(spec.max_attempts)
        .bind(spec.claim_ttl.as_secs().max(1) as i64)
        .bind(spec.run_at)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| AppError::from_db("Failed to enqueue job", e))?;

        match id {
            Some(id) => info!(job_id = %id, run_at = %spec.run_at, "Job enqueued"),
            None => info!(
                unique_key = spec.unique_key.as_deref().unwrap_or_default(),
                "Job already in flight, skipping enqueue"
            ),
        }

        Ok(id)
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<Job>, AppError> {
        sqlx::query_as::<_, Job>(&format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::from_db("Failed to load job", e))
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, spec: JobSpec) -> Result<Option<Uuid>, AppError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| AppError::from_db("Failed to acquire connection", e))?;
        Self::enqueue_in(&mut conn, &spec).await
    }

    #[instrument(skip(self))]
    async fn claim_next(&self, queues: &[String]) -> Result<Option<Job>, AppError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'running',
                attempts = attempts + 1,
                locked_until = NOW() + make_interval(secs => claim_ttl_seconds::double precision),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ANY($1)
                  AND ((status = 'pending' AND run_at <= NOW())
                       OR (status = 'running' AND locked_until < NOW()))
                ORDER BY run_at, created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(queues)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::from_db("Failed to claim job", e))?;

        if let Some(ref job) = job {
            if job.attempts > 1 {
                warn!(job_id = %job.id, job = %job.name, attempt = job.attempts, "Reclaimed job");
            }
        }

        Ok(job)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job = %job.name))]
    async fn complete(&self, job: &Job) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', locked_until = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to complete job", e))?;
        Ok(())
    }

    #[instrument(skip(self, job, err), fields(job_id = %job.id, job = %job.name))]
    async fn fail(&self, job: &Job, err: &AppError) -> Result<JobOutcome, AppError> {
        let retry = RetryConfig::for_jobs(job.max_attempts.max(1) as u32);
        let message = err.to_string();

        if retry.should_retry(job.attempts.max(0) as u32, err) {
            let backoff = retry.backoff_duration(job.attempts.saturating_sub(1).max(0) as u32);
            let run_at = Utc::now()
                + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());

            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'pending', run_at = $2, locked_until = NULL, last_error = $3, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job.id)
            .bind(run_at)
            .bind(&message)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::from_db("Failed to reschedule job", e))?;

            warn!(
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                code = err.error_code(),
                run_at = %run_at,
                "Job failed, rescheduled"
            );
            return Ok(JobOutcome::Retrying { run_at });
        }

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', locked_until = NULL, last_error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(&message)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to mark job failed", e))?;

        error!(
            attempt = job.attempts,
            code = err.error_code(),
            error = %message,
            "Job failed permanently"
        );
        Ok(JobOutcome::Failed)
    }
}
