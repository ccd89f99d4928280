//! Process-local sliding-window limiter.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taskgate_core::{Clock, SharedClock, SystemClock};

use super::types::{RateLimitDecision, RateLimitRule};
use super::{RateLimitError, RateLimiter};
use crate::jobs::types::to_chrono;

const DEFAULT_SWEEP_INTERVAL: u64 = 1_000;

#[derive(Debug, Default)]
struct Window {
    hits: VecDeque<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
}

/// Sliding-window limiter for a single process (tests, dev, single-node).
///
/// Each call runs in one critical section. Keys idle past their window are
/// swept every `sweep_interval` calls so memory stays bounded by the number of
/// recently active callers.
#[derive(Debug)]
pub struct InMemoryRateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    clock: SharedClock,
    sweep_interval: u64,
    calls: AtomicU64,
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::with_clock(SystemClock::shared())
    }
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            clock,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_sweep_interval(mut self, every: u64) -> Self {
        self.sweep_interval = every.max(1);
        self
    }

    /// Synchronous form of [`RateLimiter::is_allowed`].
    pub fn check(&self, key: &str, rule: &RateLimitRule) -> RateLimitDecision {
        let count = self.calls.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.sweep_interval == 0 {
            self.sweep();
        }

        let now = self.clock.now();
        let window = to_chrono(rule.window);
        let cutoff = now - window;

        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = windows.entry(key.to_string()).or_default();

        while entry.hits.front().is_some_and(|t| *t <= cutoff) {
            entry.hits.pop_front();
        }

        let request_count = u32::try_from(entry.hits.len()).unwrap_or(u32::MAX);
        if request_count < rule.max_requests {
            entry.hits.push_back(now);
        }
        entry.expires_at = Some(now + window);

        RateLimitDecision::from_window(rule, request_count, entry.hits.front().copied(), now)
    }

    /// Drop keys whose window has lapsed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|_, w| w.expires_at.is_some_and(|at| at > now));
        let removed = before - windows.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = windows.len(), "swept idle rate-limit keys");
        }
        removed
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn is_allowed(
        &self,
        key: &str,
        rule: &RateLimitRule,
    ) -> Result<RateLimitDecision, RateLimitError> {
        Ok(self.check(key, rule))
    }
}
