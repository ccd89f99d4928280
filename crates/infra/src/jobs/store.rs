//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taskgate_core::{Clock, JobId, SharedClock, SystemClock};

use super::types::{Job, JobStats, JobStatus};

/// Durable job table with an atomic claim primitive.
///
/// Implementations must guarantee that concurrent `claim_next` callers never
/// receive the same job, and that `attempts` grows by exactly one per claim.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job. `run_at` defaults to now.
    async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<JobId, JobStoreError>;

    /// Atomically claim the oldest eligible pending job.
    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError>;

    /// Mark a job completed. Idempotent.
    async fn complete(&self, id: JobId) -> Result<Job, JobStoreError>;

    /// Record a failed attempt: `failed` once `attempts >= max_attempts`,
    /// otherwise back to `pending` at `now + backoff`.
    async fn fail(
        &self,
        id: JobId,
        error: &str,
        max_attempts: u32,
        backoff: Duration,
    ) -> Result<Job, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Jobs ordered by creation time, optionally filtered by status.
    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Manual remediation: put a `failed` (or `error`) job back in the queue
    /// with a fresh retry budget.
    async fn retry_failed(&self, id: JobId) -> Result<Job, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    /// Contention or connectivity; retry later, not a job failure.
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, JobStoreError::Transient(_))
    }
}

/// In-memory job store for tests/dev.
///
/// Every operation runs under one mutex, which is what makes `claim_next`
/// exclusive.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    clock: SharedClock,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<JobId, JobStoreError> {
        let job = Job::new(job_type, payload, run_at, self.clock.now());
        let id = job.id;
        self.lock().insert(id, job);
        Ok(id)
    }

    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.lock();

        let next = jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .min_by_key(|j| (j.next_run_at, j.created_at, j.id))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            let job = jobs.get_mut(&id)?;
            job.mark_claimed(now);
            Some(job.clone())
        }))
    }

    async fn complete(&self, id: JobId) -> Result<Job, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.lock();
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;

        match job.status {
            JobStatus::Completed => {}
            JobStatus::Failed => {
                return Err(JobStoreError::InvalidTransition {
                    id,
                    from: job.status,
                    to: JobStatus::Completed,
                });
            }
            _ => job.mark_completed(now),
        }

        Ok(job.clone())
    }

    async fn fail(
        &self,
        id: JobId,
        error: &str,
        max_attempts: u32,
        backoff: Duration,
    ) -> Result<Job, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.lock();
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;

        if !job.status.is_terminal() {
            job.mark_failed(error, max_attempts, backoff, now);
        }

        Ok(job.clone())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.lock();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats::default();
        for job in self.lock().values() {
            stats.record(job.status);
        }
        Ok(stats)
    }

    async fn retry_failed(&self, id: JobId) -> Result<Job, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.lock();
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;

        if !matches!(job.status, JobStatus::Failed | JobStatus::Error) {
            return Err(JobStoreError::InvalidTransition {
                id,
                from: job.status,
                to: JobStatus::Pending,
            });
        }

        job.mark_requeued(now);
        Ok(job.clone())
    }
}
