//! Worker loop: claim → dispatch → complete/fail → notify.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::registry::{HandlerError, HandlerRegistry};
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobStatus, RetryPolicy};
use crate::publisher::EventPublisher;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Sleep between polls when the queue is empty
    pub poll_interval: Duration,
    pub retry_policy: RetryPolicy,
    /// Sleep after a transient store error
    pub transient_retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            poll_interval: Duration::from_secs(5),
            retry_policy: RetryPolicy::default(),
            transient_retry_delay: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_transient_retry_delay(mut self, delay: Duration) -> Self {
        self.transient_retry_delay = delay;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    /// Failed attempts that were rescheduled
    pub retried: u64,
    /// Failed attempts that exhausted the budget
    pub failed: u64,
    pub transient_errors: u64,
}

impl WorkerStats {
    fn merge(&mut self, other: &WorkerStats) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.failed += other.failed;
        self.transient_errors += other.transient_errors;
    }
}

/// Result of processing one claimed job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// The job as persisted after the attempt
    pub job: Job,
    /// Set when the handler did not succeed
    pub error: Option<HandlerError>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Single-threaded consumer of the job store.
///
/// Many workers, in one process or many, may share a store; the store's claim
/// guarantees each pending job is handed to exactly one of them.
pub struct JobWorker {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    publisher: Option<EventPublisher>,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
    shutdown: watch::Receiver<bool>,
    /// Keeps `shutdown` open until `spawn` hands a fresh sender to the handle.
    _shutdown_tx: Option<watch::Sender<bool>>,
}

impl JobWorker {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<HandlerRegistry>, config: WorkerConfig) -> Self {
        let (shutdown_tx, shutdown) = watch::channel(false);
        Self {
            store,
            registry,
            publisher: None,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            shutdown,
            _shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Announce job transitions after they are committed.
    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn stats(&self) -> WorkerStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim and process at most one job.
    ///
    /// `Ok(None)` means nothing was claimable. Store errors from the claim are
    /// returned as-is; a transient error leaves the queue untouched. Once a
    /// handler has run, transient errors persisting its outcome are retried
    /// until the write lands or the worker is told to shut down.
    ///
    /// The job event is sent in the background after the outcome is stored.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, JobStoreError> {
        let Some(job) = self.store.claim_next().await? else {
            return Ok(None);
        };

        debug!(
            worker = %self.config.name,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "claimed job"
        );

        let result = self.dispatch(&job).await;
        let outcome = self.finalize(&job, result).await?;
        self.record(&outcome);

        if let Some(publisher) = &self.publisher {
            publisher.publish_job_detached(&outcome.job);
        }

        Ok(Some(outcome))
    }

    /// Run the handler in its own task so a panic is contained.
    async fn dispatch(&self, job: &Job) -> Result<(), HandlerError> {
        let handler = self
            .registry
            .get(&job.job_type)
            .ok_or_else(|| HandlerError::UnknownJobType(job.job_type.clone()))?;

        let owned = job.clone();
        match tokio::spawn(async move { handler.handle(&owned).await }).await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                Err(HandlerError::Panicked(panic_message(join_error.into_panic())))
            }
            Err(join_error) => Err(HandlerError::Panicked(join_error.to_string())),
        }
    }

    async fn finalize(
        &self,
        job: &Job,
        result: Result<(), HandlerError>,
    ) -> Result<JobOutcome, JobStoreError> {
        let policy = &self.config.retry_policy;
        let mut shutdown = self.shutdown.clone();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let written = match &result {
                Ok(()) => self.store.complete(job.id).await,
                Err(handler_error) => {
                    let backoff = policy.delay_for_attempt(job.attempts);
                    self.store
                        .fail(job.id, &handler_error.to_string(), policy.max_attempts, backoff)
                        .await
                }
            };

            match written {
                Ok(updated) => {
                    return Ok(JobOutcome {
                        job: updated,
                        error: result.err(),
                    });
                }
                Err(e) if e.is_transient() => {
                    self.bump(|s| s.transient_errors += 1);
                    warn!(
                        worker = %self.config.name,
                        job_id = %job.id,
                        attempt,
                        error = %e,
                        "transient error recording job outcome, retrying"
                    );
                    if !pause(&mut shutdown, self.config.transient_retry_delay).await {
                        error!(
                            worker = %self.config.name,
                            job_id = %job.id,
                            error = %e,
                            "shutting down before job outcome was recorded; job stays in_progress"
                        );
                        return Err(e);
                    }
                }
                Err(e) => {
                    error!(
                        worker = %self.config.name,
                        job_id = %job.id,
                        error = %e,
                        "could not record job outcome; job stays in_progress"
                    );
                    return Err(e);
                }
            }
        }
    }

    fn record(&self, outcome: &JobOutcome) {
        let job = &outcome.job;
        match (&outcome.error, job.status) {
            (None, _) => {
                info!(worker = %self.config.name, job_id = %job.id, job_type = %job.job_type, "job completed");
            }
            (Some(e), JobStatus::Failed) => {
                error!(
                    worker = %self.config.name,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    error = %e,
                    "job failed permanently"
                );
            }
            (Some(e), _) => {
                warn!(
                    worker = %self.config.name,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    next_run_at = %job.next_run_at,
                    error = %e,
                    "job attempt failed, rescheduled"
                );
            }
        }

        self.bump(|s| {
            s.processed += 1;
            match (&outcome.error, job.status) {
                (None, _) => s.succeeded += 1,
                (Some(_), JobStatus::Failed) => s.failed += 1,
                (Some(_), _) => s.retried += 1,
            }
        });
    }

    fn bump(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Run the poll loop on the tokio runtime until shut down.
    pub fn spawn(mut self) -> JobWorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = shutdown_rx;
        self._shutdown_tx = None;

        let stats = self.stats.clone();
        let name = self.config.name.clone();
        let join = tokio::spawn(worker_loop(self));

        JobWorkerHandle {
            name,
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

async fn worker_loop(worker: JobWorker) {
    info!(worker = %worker.config.name, "job worker started");
    let mut shutdown = worker.shutdown.clone();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let delay = match worker.run_once().await {
            Ok(Some(_)) => continue,
            Ok(None) => worker.config.poll_interval,
            Err(e) if e.is_transient() => {
                worker.bump(|s| s.transient_errors += 1);
                warn!(worker = %worker.config.name, error = %e, "transient store error");
                worker.config.transient_retry_delay
            }
            Err(e) => {
                error!(worker = %worker.config.name, error = %e, "store error");
                worker.config.poll_interval
            }
        };

        if !pause(&mut shutdown, delay).await {
            break;
        }
    }

    info!(worker = %worker.config.name, "job worker stopped");
}

/// Sleep for `delay`. Returns `false` if shutdown was requested (or the handle
/// dropped) before or during the sleep.
async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct JobWorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl JobWorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> WorkerStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop polling and return the final statistics. A job already being
    /// handled is finished first.
    pub async fn shutdown(self) -> WorkerStats {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(worker = %self.name, error = %e, "job worker task ended abnormally");
        }
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fixed number of workers sharing one store and registry.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<JobWorkerHandle>,
}

impl WorkerPool {
    pub fn spawn(
        size: usize,
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        publisher: Option<EventPublisher>,
        config: WorkerConfig,
    ) -> Self {
        let workers = (0..size.max(1))
            .map(|i| {
                let config = config.clone().with_name(format!("{}-{i}", config.name));
                let mut worker = JobWorker::new(store.clone(), registry.clone(), config);
                if let Some(publisher) = &publisher {
                    worker = worker.with_publisher(publisher.clone());
                }
                worker.spawn()
            })
            .collect();

        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Combined statistics across workers.
    pub fn stats(&self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for worker in &self.workers {
            total.merge(&worker.stats());
        }
        total
    }

    /// Signal every worker, wait for all of them, and return the combined
    /// final statistics.
    pub async fn shutdown(self) -> WorkerStats {
        for worker in &self.workers {
            let _ = worker.shutdown.send(true);
        }
        let mut total = WorkerStats::default();
        for worker in self.workers {
            total.merge(&worker.shutdown().await);
        }
        total
    }
}
