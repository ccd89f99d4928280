//! Durable job queue with exclusive claims, retry and backoff.
//!
//! ## Design
//!
//! - Jobs are typed by a string tag and carry an opaque JSON payload
//! - `claim_next` hands each pending job to exactly one worker
//! - Failed attempts are rescheduled with backoff until the retry budget is
//!   spent, then parked as `failed` for an operator
//! - Notifications go out only after the new state is committed
//!
//! ## Components
//!
//! - `Job`, `JobStatus`, `RetryPolicy`: core types
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `HandlerRegistry`: job-type tag → handler
//! - `JobWorker` / `WorkerPool`: the claim → dispatch → finalize loop

pub mod postgres;
pub mod registry;
pub mod store;
pub mod types;
pub mod worker;

pub use postgres::PgJobStore;
pub use registry::{HandlerError, HandlerRegistry, JobHandler};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use taskgate_core::JobId;
pub use types::{BackoffStrategy, Job, JobStats, JobStatus, RetryPolicy};
pub use worker::{JobOutcome, JobWorker, JobWorkerHandle, WorkerConfig, WorkerPool, WorkerStats};
