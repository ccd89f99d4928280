//! Core job types and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskgate_core::JobId;

/// Persisted job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `next_run_at` and a free worker
    Pending,
    /// Claimed by exactly one worker
    InProgress,
    /// Handler succeeded
    Completed,
    /// Written by external tooling only; never claimed by workers
    Error,
    /// Retry budget exhausted, needs manual intervention
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Error,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Terminal statuses never move again through the worker path.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Routing tag for the handler registry
    pub job_type: String,
    /// Opaque to the core
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Number of claims so far
    pub attempts: u32,
    /// Earliest time the job may be claimed
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh pending job. `next_run_at` defaults to `now`.
    pub fn new(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            next_run_at: run_at.unwrap_or(now),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Eligible for `claim_next` at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_run_at <= now
    }

    pub(crate) fn mark_claimed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::InProgress;
        self.attempts += 1;
        self.updated_at = now;
    }

    pub(crate) fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.last_error = None;
        self.updated_at = now;
    }

    /// Record a failed attempt: terminal once `attempts` reaches the budget,
    /// otherwise back to pending after `backoff`.
    pub(crate) fn mark_failed(
        &mut self,
        error: &str,
        max_attempts: u32,
        backoff: Duration,
        now: DateTime<Utc>,
    ) {
        self.last_error = Some(error.to_string());
        self.updated_at = now;

        if self.attempts >= max_attempts {
            self.status = JobStatus::Failed;
        } else {
            self.status = JobStatus::Pending;
            self.next_run_at = now + to_chrono(backoff);
        }
    }

    /// Operator remediation: give a failed job a fresh retry budget.
    pub(crate) fn mark_requeued(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.next_run_at = now;
        self.updated_at = now;
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay after every failure
    #[default]
    Fixed,
    /// base * attempt
    Linear,
    /// base * 2^(attempt - 1)
    Exponential,
}

impl core::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff strategy '{other}'")),
        }
    }
}

/// Retry policy applied by workers when a handler fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total claims allowed before the job becomes `failed`
    pub max_attempts: u32,
    /// Base delay between attempts
    pub backoff: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(5 * 60))
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the next claim after failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => return self.backoff,
            BackoffStrategy::Linear => self.backoff.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.backoff.saturating_mul(factor)
            }
        };

        delay.min(self.max_delay.max(self.backoff))
    }

    /// Check if another attempt is allowed after `attempts` claims.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub error: usize,
    pub failed: usize,
}

impl JobStats {
    pub(crate) fn record(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub(crate) fn add(&mut self, status: JobStatus, n: usize) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::InProgress => &mut self.in_progress,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Error => &mut self.error,
            JobStatus::Failed => &mut self.failed,
        };
        *slot += n;
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.error + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(
            5,
            Duration::from_millis(100),
            Duration::from_secs(10),
        );

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::fixed(5, Duration::from_millis(100))
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("running"), None);
        assert_eq!(
            serde_json::to_value(JobStatus::InProgress).unwrap(),
            serde_json::json!("in_progress")
        );
    }

    #[test]
    fn failure_before_budget_reschedules() {
        let now = Utc::now();
        let mut job = Job::new("sync", serde_json::json!({}), None, now);
        job.mark_claimed(now);
        job.mark_failed("boom", 3, Duration::from_secs(60), now);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.next_run_at, now + chrono::Duration::seconds(60));
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(job.next_run_at));
    }

    #[test]
    fn failure_at_budget_is_terminal() {
        let now = Utc::now();
        let mut job = Job::new("sync", serde_json::json!({}), None, now);
        for _ in 0..3 {
            job.mark_claimed(now);
        }
        job.mark_failed("still broken", 3, Duration::from_secs(60), now);

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.status.is_terminal());
        assert!(!job.is_claimable(now + chrono::Duration::days(1)));
    }

    #[test]
    fn backoff_strategy_parses_case_insensitively() {
        assert_eq!("Fixed".parse::<BackoffStrategy>(), Ok(BackoffStrategy::Fixed));
        assert_eq!(" exponential ".parse::<BackoffStrategy>(), Ok(BackoffStrategy::Exponential));
        assert!("random".parse::<BackoffStrategy>().is_err());
    }

    proptest! {
        #[test]
        fn fixed_backoff_is_constant(attempt in 1u32..1_000, secs in 1u64..86_400) {
            let policy = RetryPolicy::fixed(5, Duration::from_secs(secs));
            prop_assert_eq!(policy.delay_for_attempt(attempt), Duration::from_secs(secs));
        }

        #[test]
        fn growing_backoff_is_monotonic_and_capped(attempt in 1u32..64, base_ms in 1u64..10_000) {
            let policy = RetryPolicy::exponential(
                10,
                Duration::from_millis(base_ms),
                Duration::from_secs(3_600),
            );
            let this = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            prop_assert!(next >= this);
            prop_assert!(next <= Duration::from_secs(3_600));
        }
    }
}
