//! Rules, decisions and route policy for admission control.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::types::to_chrono;

/// `max_requests` per sliding `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitRule {
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub const fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }
}

/// Parses `max/window_secs`, e.g. `100/60`.
impl core::str::FromStr for RateLimitRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (max, secs) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("expected 'max/window_secs', got '{s}'"))?;

        let max_requests: u32 = max
            .trim()
            .parse()
            .map_err(|_| format!("invalid request count '{max}'"))?;
        let window_secs: u64 = secs
            .trim()
            .parse()
            .map_err(|_| format!("invalid window seconds '{secs}'"))?;

        if max_requests == 0 || window_secs == 0 {
            return Err(format!("rate limit '{s}' must be non-zero"));
        }

        Ok(Self::new(max_requests, Duration::from_secs(window_secs)))
    }
}

impl core::fmt::Display for RateLimitRule {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.window.as_secs())
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    /// Requests left in the current window after this one
    pub remaining: u32,
    /// When the oldest counted request leaves the window
    pub reset: DateTime<Utc>,
    /// Only set on denial
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    /// Build a decision from the window state observed by a backend.
    ///
    /// `request_count` is the number of in-window requests before this one;
    /// `oldest` is the oldest in-window timestamp after this one was (or was
    /// not) recorded.
    pub fn from_window(
        rule: &RateLimitRule,
        request_count: u32,
        oldest: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let allowed = request_count < rule.max_requests;
        let reset = oldest.unwrap_or(now) + to_chrono(rule.window);

        Self {
            allowed,
            limit: rule.max_requests,
            remaining: if allowed {
                rule.max_requests.saturating_sub(request_count + 1)
            } else {
                0
            },
            reset,
            retry_after: (!allowed).then(|| (reset - now).to_std().unwrap_or(Duration::ZERO)),
        }
    }

    /// `reset` as unix seconds, rounded up.
    pub fn reset_unix(&self) -> i64 {
        let secs = self.reset.timestamp();
        if self.reset.timestamp_subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }

    /// Whole seconds to wait before retrying; at least one on denial.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| {
            let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
            secs.max(1)
        })
    }
}

/// The rule applying to a request path, plus the counter scope it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteLimit<'a> {
    /// Override prefix, or `"default"`
    pub scope: &'a str,
    pub rule: RateLimitRule,
}

pub const DEFAULT_SCOPE: &str = "default";

/// Which rule applies to which path.
///
/// Overrides match by path prefix on segment boundaries; the longest matching
/// prefix wins. Exempt paths bypass admission entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    default_rule: RateLimitRule,
    overrides: Vec<(String, RateLimitRule)>,
    exempt: Vec<String>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::new(RateLimitRule::per_minute(100))
            .with_override("/api/auth", RateLimitRule::per_minute(5))
            .with_exempt("/health")
            .with_exempt("/docs")
            .with_exempt("/openapi.json")
    }
}

impl RateLimitPolicy {
    /// Policy with no overrides and no exempt paths.
    pub fn new(default_rule: RateLimitRule) -> Self {
        Self {
            default_rule,
            overrides: Vec::new(),
            exempt: Vec::new(),
        }
    }

    pub fn with_override(mut self, prefix: impl Into<String>, rule: RateLimitRule) -> Self {
        let prefix = normalize(prefix.into());
        self.overrides.retain(|(p, _)| *p != prefix);
        self.overrides.push((prefix, rule));
        self
    }

    pub fn with_exempt(mut self, path: impl Into<String>) -> Self {
        self.exempt.push(normalize(path.into()));
        self
    }

    pub fn default_rule(&self) -> RateLimitRule {
        self.default_rule
    }

    pub fn overrides(&self) -> impl Iterator<Item = (&str, RateLimitRule)> {
        self.overrides.iter().map(|(p, r)| (p.as_str(), *r))
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt.iter().any(|e| matches_prefix(path, e))
    }

    /// `None` for exempt paths.
    pub fn rule_for(&self, path: &str) -> Option<RouteLimit<'_>> {
        if self.is_exempt(path) {
            return None;
        }

        let route = self
            .overrides
            .iter()
            .filter(|(prefix, _)| matches_prefix(path, prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, rule)| RouteLimit {
                scope: prefix.as_str(),
                rule: *rule,
            })
            .unwrap_or(RouteLimit {
                scope: DEFAULT_SCOPE,
                rule: self.default_rule,
            });

        Some(route)
    }
}

fn normalize(path: String) -> String {
    match path.trim().trim_end_matches('/') {
        "" => "/".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// `/api/auth` matches `/api/auth` and `/api/auth/login`, not `/api/authz`.
fn matches_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}
