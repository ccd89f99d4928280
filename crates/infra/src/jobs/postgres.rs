//! Postgres-backed job store.
//!
//! ## Claim protocol
//!
//! `claim_next` is one `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED
//! LIMIT 1) RETURNING *` statement. The subquery skips rows another in-flight
//! claim has locked instead of waiting on them, and the update runs in the
//! same implicit transaction, so two workers can never receive the same row.
//! If the statement fails nothing is written and `attempts` is untouched.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database | `40001` serialization failure | `Transient` |
//! | Database | `40P01` deadlock detected | `Transient` |
//! | Database | `55P03` lock not available | `Transient` |
//! | Database | `57P01` admin shutdown | `Transient` |
//! | Database | Any other | `Storage` |
//! | Io / PoolTimedOut / PoolClosed | N/A | `Transient` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use taskgate_core::{Clock, JobId, SharedClock, SystemClock};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobStats, JobStatus, to_chrono};

/// Idempotent DDL for the jobs table.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id          UUID PRIMARY KEY,
    job_type    TEXT NOT NULL,
    payload     JSONB NOT NULL DEFAULT '{}'::jsonb,
    status      TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'in_progress', 'completed', 'error', 'failed')),
    attempts    INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
    next_run_at TIMESTAMPTZ NOT NULL,
    last_error  TEXT,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS jobs_pending_next_run_at_idx
    ON jobs (next_run_at)
    WHERE status = 'pending';

CREATE INDEX IF NOT EXISTS jobs_status_created_at_idx
    ON jobs (status, created_at);
"#;

const JOB_COLUMNS: &str =
    "id, job_type, payload, status, attempts, next_run_at, last_error, created_at, updated_at";

/// Postgres-backed job store.
///
/// Cheap to clone; the pool is shared.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: Arc<PgPool>,
    clock: SharedClock,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, SystemClock::shared())
    }

    pub fn with_clock(pool: PgPool, clock: SharedClock) -> Self {
        Self {
            pool: Arc::new(pool),
            clock,
        }
    }

    /// Create the jobs table and indexes if they are missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    /// Distinguish "missing" from "wrong status" after a guarded update hit no rows.
    async fn explain_miss(&self, id: JobId, to: JobStatus) -> JobStoreError {
        match self.fetch(id).await {
            Ok(Some(job)) => JobStoreError::InvalidTransition {
                id,
                from: job.status,
                to,
            },
            Ok(None) => JobStoreError::NotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, payload), err)]
    async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<JobId, JobStoreError> {
        let job = Job::new(job_type, payload, run_at, self.clock.now());

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, payload, status, attempts,
                next_run_at, last_error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 0, $5, NULL, $6, $6)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.next_run_at)
        .bind(job.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(job.id)
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        let now = self.clock.now();

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'in_progress',
                attempts = attempts + 1,
                updated_at = $1
            WHERE id = (
                SELECT id
                FROM jobs
                WHERE status = 'pending' AND next_run_at <= $1
                ORDER BY next_run_at ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn complete(&self, id: JobId) -> Result<Job, JobStoreError> {
        let now = self.clock.now();

        // Completed rows keep their original updated_at so repeats are no-ops.
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'completed',
                last_error = NULL,
                updated_at = CASE WHEN status = 'completed' THEN updated_at ELSE $2 END
            WHERE id = $1 AND status <> 'failed'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        match row {
            Some(r) => decode_job(&r),
            None => Err(self.explain_miss(id, JobStatus::Completed).await),
        }
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn fail(
        &self,
        id: JobId,
        error: &str,
        max_attempts: u32,
        backoff: Duration,
    ) -> Result<Job, JobStoreError> {
        let now = self.clock.now();
        let retry_at = now + to_chrono(backoff);

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = CASE WHEN attempts >= $3 THEN 'failed' ELSE 'pending' END,
                next_run_at = CASE WHEN attempts >= $3 THEN next_run_at ELSE $4 END,
                last_error = $2,
                updated_at = $5
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(error)
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .bind(retry_at)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        match row {
            Some(r) => decode_job(&r),
            // Terminal rows are left alone.
            None => self.fetch(id).await?.ok_or(JobStoreError::NotFound(id)),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.fetch(id).await
    }

    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.iter().map(decode_job).collect()
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let n: i64 = row.try_get("n").map_err(decode_error)?;
            let status = JobStatus::parse(&status)
                .ok_or_else(|| JobStoreError::Storage(format!("unknown job status '{status}'")))?;
            stats.add(status, usize::try_from(n).unwrap_or(0));
        }
        Ok(stats)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn retry_failed(&self, id: JobId) -> Result<Job, JobStoreError> {
        let now = self.clock.now();

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempts = 0,
                next_run_at = $2,
                updated_at = $2
            WHERE id = $1 AND status IN ('failed', 'error')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("retry_failed", e))?;

        match row {
            Some(r) => decode_job(&r),
            None => Err(self.explain_miss(id, JobStatus::Pending).await),
        }
    }
}

/// Row mapping for the `jobs` table.
#[derive(Debug)]
struct JobRow {
    id: Uuid,
    job_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    next_run_at: DateTime<Utc>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            next_run_at: row.try_get("next_run_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| JobStoreError::Storage(format!("unknown job status '{}'", row.status)))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            job_type: row.job_type,
            payload: row.payload,
            status,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            next_run_at: row.next_run_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row).map_err(decode_error)?.try_into()
}

fn decode_error(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to decode job row: {err}"))
}

/// Postgres error codes that mean "try again", not "this job is broken".
const TRANSIENT_CODES: &[&str] = &["40001", "40P01", "55P03", "57P01"];

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if TRANSIENT_CODES.contains(&code.as_ref()) => {
                    JobStoreError::Transient(msg)
                }
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::Io(e) => {
            JobStoreError::Transient(format!("io error in {}: {}", operation, e))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Transient(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Transient(format!("connection pool closed in {}", operation))
        }
        other => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;
    use sqlx::postgres::PgPoolOptions;

    use super::*;

    #[test]
    fn pool_errors_are_transient() {
        assert!(map_sqlx_error("claim_next", sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_sqlx_error("claim_next", sqlx::Error::PoolClosed).is_transient());
        assert!(!map_sqlx_error("get", sqlx::Error::RowNotFound).is_transient());
    }

    async fn test_store() -> PgJobStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres tests");
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(&url)
            .await
            .expect("failed to connect to postgres");
        let store = PgJobStore::new(pool);
        store.ensure_schema().await.expect("schema");
        sqlx::query("TRUNCATE jobs")
            .execute(&*store.pool)
            .await
            .expect("truncate");
        store
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires DATABASE_URL"]
    async fn concurrent_claims_are_exclusive() {
        let store = test_store().await;
        for i in 0..100 {
            store.enqueue("sync", json!({"i": i}), None).await.unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    match store.claim_next().await {
                        Ok(Some(job)) => mine.push(job.id),
                        Ok(None) => break,
                        Err(e) if e.is_transient() => continue,
                        Err(e) => panic!("claim failed: {e}"),
                    }
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 100);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn failure_lifecycle_matches_in_memory_semantics() {
        let store = test_store().await;
        let id = store.enqueue("sync", json!({"table": "agents"}), None).await.unwrap();

        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 1);

        let retried = store.fail(id, "boom", 2, Duration::ZERO).await.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);

        store.claim_next().await.unwrap().unwrap();
        let failed = store.fail(id, "boom again", 2, Duration::ZERO).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(store.claim_next().await.unwrap().is_none());

        assert!(matches!(
            store.complete(id).await,
            Err(JobStoreError::InvalidTransition { .. })
        ));

        let requeued = store.retry_failed(id).await.unwrap();
        assert_eq!(requeued.attempts, 0);
        store.claim_next().await.unwrap().unwrap();
        let done = store.complete(id).await.unwrap();
        let again = store.complete(id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(again.status, JobStatus::Completed);
    }
}
