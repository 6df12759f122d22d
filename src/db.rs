use crate::gateway::{DataGateway, FileRecord, UserRecord};
use crate::queue::JobStore;
use crate::{Identifier, Job, JobRequest, Payload, Status};
use anyhow::{anyhow, Error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Executor;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, queue, payload, status, attempts, max_attempts, last_error, \
    created_at, run_at, started_at";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue: String,
    payload: Json<Payload>,
    status: Status,
    attempts: i32,
    max_attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    run_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            queue: row.queue,
            payload: row.payload.0,
            status: row.status,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            last_error: row.last_error,
            created_at: row.created_at,
            run_at: row.run_at,
            started_at: row.started_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct FileRow {
    id: String,
    user_id: String,
    name: String,
    local_path: String,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    email: String,
    name: Option<String>,
}

fn stored_id(raw: String) -> Result<Identifier, Error> {
    Identifier::parse(&raw).ok_or_else(|| anyhow!("stored identifier {raw:?} is malformed"))
}

/// Postgres connection pool shared by the queue and the record lookups.
#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
    max_attempts: i32,
}

impl DbHandle {
    pub async fn new(url: &str, max_attempts: i32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
            max_attempts,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl JobStore for DbHandle {
    async fn submit_job_request(&self, job: &JobRequest) -> Result<Uuid, Error> {
        debug!("Submitting job {:?}", job);
        let id = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO jobq \
            (id, queue, payload, status, max_attempts) \
            VALUES ($1, $2, $3, 'QUEUED', $4) \
            RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(&job.queue)
        .bind(Json(&job.payload))
        .bind(self.max_attempts)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    async fn claim_jobs(&self, queues: &[String], limit: i64) -> Result<Vec<Job>, Error> {
        debug!("Claiming up to {} queued jobs", limit);
        let sql = format!(
            "UPDATE jobq \
                SET status = 'PROCESSING', \
                attempts = attempts + 1, \
                started_at = now() \
            WHERE id IN ( \
                SELECT id FROM jobq \
                WHERE status = 'QUEUED' AND run_at <= now() AND queue = ANY($1) \
                ORDER BY run_at asc, created_at asc \
                LIMIT $2 \
                FOR UPDATE SKIP LOCKED) \
            RETURNING {JOB_COLUMNS}"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queues.to_vec())
            .bind(limit)
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows.into_iter().map(Job::from).collect())
    }

    async fn complete_job(&self, id: Uuid, attempt: i32) -> Result<(), Error> {
        sqlx::query(
            "UPDATE jobq \
                SET status = 'COMPLETED', \
                duration = extract(epoch from now() - started_at) \
            WHERE id = $1 AND attempts = $2 AND status = 'PROCESSING'",
        )
        .bind(id)
        .bind(attempt)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn retry_job(
        &self,
        id: Uuid,
        attempt: i32,
        msg: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE jobq \
                SET status = 'QUEUED', \
                duration = extract(epoch from now() - started_at), \
                last_error = $1, \
                run_at = $2 \
            WHERE id = $3 AND attempts = $4 AND status = 'PROCESSING'",
        )
        .bind(msg)
        .bind(run_at)
        .bind(id)
        .bind(attempt)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn fail_job(&self, id: Uuid, attempt: i32, msg: &str) -> Result<(), Error> {
        sqlx::query(
            "UPDATE jobq \
                SET status = 'FAILED', \
                duration = extract(epoch from now() - started_at), \
                last_error = $1 \
            WHERE id = $2 AND attempts = $3 AND status = 'PROCESSING'",
        )
        .bind(msg)
        .bind(id)
        .bind(attempt)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn release_job(&self, id: Uuid, attempt: i32) -> Result<(), Error> {
        sqlx::query(
            "UPDATE jobq \
                SET status = 'QUEUED', \
                attempts = attempts - 1, \
                started_at = NULL, \
                run_at = now() \
            WHERE id = $1 AND attempts = $2 AND status = 'PROCESSING'",
        )
        .bind(id)
        .bind(attempt)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn reclaim_stale_jobs(&self, timeout: Duration) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE jobq \
                SET status = CASE WHEN attempts >= max_attempts \
                    THEN 'FAILED'::queue_status_enum \
                    ELSE 'QUEUED'::queue_status_enum END, \
                last_error = 'job timed out', \
                run_at = now() \
            WHERE status = 'PROCESSING' \
                AND (started_at IS NULL OR started_at <= now() - make_interval(secs => $1))",
        )
        .bind(timeout.as_secs_f64())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn failed_jobs(&self, limit: i64) -> Result<Vec<Job>, Error> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobq \
            WHERE status = 'FAILED' \
            ORDER BY created_at asc \
            LIMIT $1"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows.into_iter().map(Job::from).collect())
    }

    async fn requeue_job(&self, id: Uuid) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE jobq \
                SET status = 'QUEUED', \
                attempts = 0, \
                run_at = now() \
            WHERE id = $1 AND status = 'FAILED'",
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn job(&self, id: Uuid) -> Result<Option<Job>, Error> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobq WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(row.map(Job::from))
    }
}

#[async_trait]
impl DataGateway for DbHandle {
    async fn find_file_by_id(
        &self,
        file_id: &Identifier,
        user_id: &Identifier,
    ) -> Result<Option<FileRecord>, Error> {
        let row = sqlx::query_as::<_, FileRow>(
            "SELECT id, user_id, name, local_path FROM files WHERE id = $1 AND user_id = $2",
        )
        .bind(file_id.as_str())
        .bind(user_id.as_str())
        .fetch_optional(&*self.pool)
        .await?;

        row.map(|row| {
            Ok(FileRecord {
                id: stored_id(row.id)?,
                user_id: stored_id(row.user_id)?,
                name: row.name,
                local_path: row.local_path.into(),
            })
        })
        .transpose()
    }

    async fn find_user_by_id(&self, user_id: &Identifier) -> Result<Option<UserRecord>, Error> {
        let row = sqlx::query_as::<_, UserRow>("SELECT id, email, name FROM users WHERE id = $1")
            .bind(user_id.as_str())
            .fetch_optional(&*self.pool)
            .await?;

        row.map(|row| {
            Ok(UserRecord {
                id: stored_id(row.id)?,
                email: row.email,
                name: row.name,
            })
        })
        .transpose()
    }
}
