use anyhow::{Result, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Pool, Postgres, postgres::PgPoolOptions};
use sqlx::types::Json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cli::config::StorageSettings;
use crate::dispatch::job::{Job, JobConfig, JobId, JobStatus, JobSubmission, Priority, StatusUpdate};
use crate::error::DispatchError;

/// Source of truth for job status
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// PENDING jobs due at `now`, highest priority first, then oldest due
    async fn list_eligible(&self, now: DateTime<Utc>, skip: usize, limit: usize) -> Result<Vec<Job>>;

    /// Atomic PENDING -> RUNNING; false if the job is not PENDING
    async fn try_start(&self, job_id: JobId) -> Result<bool>;

    /// Atomic partial update. Returns false without writing when the job's
    /// current status may not move to `update.status`.
    async fn update_status(&self, job_id: JobId, update: &StatusUpdate) -> Result<bool>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Store a new PENDING job
    async fn insert(&self, submission: &JobSubmission) -> Result<Job>;

    /// External cancellation of a PENDING or RUNNING job
    async fn cancel(&self, job_id: JobId) -> Result<bool>;

    /// Move RUNNING jobs untouched since `older_than` back to PENDING
    async fn reset_stale(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Create the task store named by the settings
pub async fn create_task_store(settings: &StorageSettings) -> Result<Arc<dyn TaskStore>> {
    match settings.task_store.as_str() {
        "memory" => Ok(Arc::new(MemoryTaskStore::new())),
        "postgresql" => {
            let store = PostgresTaskStore::new(&settings.database_url).await?;
            Ok(Arc::new(store))
        }
        other => anyhow::bail!("Unsupported task store: {}", other),
    }
}

#[derive(Default)]
struct MemoryJobs {
    jobs: BTreeMap<JobId, Job>,
    next_id: JobId,
}

/// In-process task store
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<MemoryJobs>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a job exactly as given, keeping its id
    pub async fn put(&self, job: Job) {
        let mut inner = self.inner.lock().await;
        inner.next_id = inner.next_id.max(job.id);
        inner.jobs.insert(job.id, job);
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn list_eligible(&self, now: DateTime<Utc>, skip: usize, limit: usize) -> Result<Vec<Job>> {
        let inner = self.inner.lock().await;
        let mut eligible: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.is_eligible(now))
            .cloned()
            .collect();

        eligible.sort_by(Job::dispatch_order);
        Ok(eligible.into_iter().skip(skip).take(limit).collect())
    }

    async fn try_start(&self, job_id: JobId) -> Result<bool> {
        self.update_status(job_id, &StatusUpdate::new(JobStatus::Running)).await
    }

    async fn update_status(&self, job_id: JobId, update: &StatusUpdate) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| DispatchError::NotFound(format!("job {}", job_id)))?;

        if !job.status.can_transition(update.status) {
            debug!("Job {} is {}, not moving to {}", job_id, job.status, update.status);
            return Ok(false);
        }

        job.apply(update, Utc::now());
        Ok(true)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.inner.lock().await.jobs.get(&job_id).cloned())
    }

    async fn insert(&self, submission: &JobSubmission) -> Result<Job> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;

        let job = Job::from_submission(inner.next_id, submission.clone(), Utc::now());
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn cancel(&self, job_id: JobId) -> Result<bool> {
        self.update_status(job_id, &StatusUpdate::new(JobStatus::Cancelled)).await
    }

    async fn reset_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let update = StatusUpdate::new(JobStatus::Pending).with_error("Reclaimed after stale run");

        let mut reset = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Running && job.updated_at < older_than {
                job.apply(&update, now);
                reset += 1;
            }
        }
        Ok(reset)
    }
}

/// Row shape of the `jobs` table
#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    name: String,
    url: String,
    schedule: Option<String>,
    status: String,
    priority: i16,
    config: Json<JobConfig>,
    headers: Json<HashMap<String, String>>,
    cookies: Json<HashMap<String, String>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    retry_count: i32,
    result: Option<Json<Value>>,
    error_message: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            url: row.url,
            schedule: row.schedule,
            status: row.status.parse()?,
            priority: Priority::from_rank(row.priority),
            config: row.config.0,
            headers: row.headers.0,
            cookies: row.cookies.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_run: row.last_run,
            next_run: row.next_run,
            retry_count: row.retry_count.max(0) as u32,
            result: row.result.map(|r| r.0),
            error_message: row.error_message,
        })
    }
}

/// PostgreSQL task store
pub struct PostgresTaskStore {
    pool: Pool<Postgres>,
}

impl PostgresTaskStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context(format!("Failed to connect to PostgreSQL: {}", database_url))?;

        let store = Self { pool };
        store.ensure_table().await?;

        info!("Connected to PostgreSQL task store");

        Ok(store)
    }

    async fn ensure_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                url TEXT NOT NULL,
                schedule TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                priority SMALLINT NOT NULL DEFAULT 2,
                config JSONB NOT NULL DEFAULT '{}',
                headers JSONB NOT NULL DEFAULT '{}',
                cookies JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_run TIMESTAMPTZ,
                next_run TIMESTAMPTZ,
                retry_count INTEGER NOT NULL DEFAULT 0,
                result JSONB,
                error_message TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create jobs table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS jobs_eligible_idx ON jobs (status, priority DESC, next_run)")
            .execute(&self.pool)
            .await
            .context("Failed to create jobs index")?;

        debug!("Ensured jobs table exists");

        Ok(())
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn list_eligible(&self, now: DateTime<Utc>, skip: usize, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs
             WHERE status = 'pending' AND (next_run IS NULL OR next_run <= $1)
             ORDER BY priority DESC, next_run ASC NULLS FIRST, id ASC
             OFFSET $2 LIMIT $3",
        )
        .bind(now)
        .bind(skip as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list eligible jobs")?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn try_start(&self, job_id: JobId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'running', updated_at = NOW()
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context(format!("Failed to start job {}", job_id))?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_status(&self, job_id: JobId, update: &StatusUpdate) -> Result<bool> {
        let sources: Vec<String> = JobStatus::sources(update.status)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let result = sqlx::query(
            "UPDATE jobs SET
                status = $2,
                updated_at = NOW(),
                error_message = COALESCE($3, error_message),
                retry_count = COALESCE($4, retry_count),
                next_run = CASE WHEN $5 THEN $6::timestamptz ELSE next_run END,
                last_run = COALESCE($7, last_run),
                result = COALESCE($8::jsonb, result)
             WHERE id = $1 AND status = ANY($9)",
        )
        .bind(job_id)
        .bind(update.status.as_str())
        .bind(update.error_message.as_deref())
        .bind(update.retry_count.map(|c| c as i32))
        .bind(update.next_run.is_some())
        .bind(update.next_run.flatten())
        .bind(update.last_run)
        .bind(update.result.as_ref().map(Json))
        .bind(&sources)
        .execute(&self.pool)
        .await
        .context(format!("Failed to update status of job {}", job_id))?;

        if result.rows_affected() == 0 {
            if self.get(job_id).await?.is_none() {
                return Err(DispatchError::NotFound(format!("job {}", job_id)).into());
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context(format!("Failed to load job {}", job_id))?;

        row.map(Job::try_from).transpose()
    }

    async fn insert(&self, submission: &JobSubmission) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            "INSERT INTO jobs (name, url, schedule, priority, config, headers, cookies)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING *",
        )
        .bind(&submission.name)
        .bind(&submission.url)
        .bind(submission.schedule.as_deref())
        .bind(submission.priority.rank())
        .bind(Json(&submission.config))
        .bind(Json(submission.headers.clone().unwrap_or_default()))
        .bind(Json(submission.cookies.clone().unwrap_or_default()))
        .fetch_one(&self.pool)
        .await
        .context(format!("Failed to insert job {}", submission.name))?;

        Job::try_from(row)
    }

    async fn cancel(&self, job_id: JobId) -> Result<bool> {
        self.update_status(job_id, &StatusUpdate::new(JobStatus::Cancelled)).await
    }

    async fn reset_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', updated_at = NOW(),
                error_message = 'Reclaimed after stale run'
             WHERE status = 'running' AND updated_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .context("Failed to reset stale jobs")?;

        Ok(result.rows_affected())
    }
}
