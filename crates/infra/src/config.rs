//! Process configuration from environment variables.

use std::time::Duration;

use taskgate_observability::LogFormat;

use crate::jobs::{BackoffStrategy, RetryPolicy, WorkerConfig};
use crate::ratelimit::{RateLimitPolicy, RateLimitRule};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var} ('{value}'): {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything a dispatch process needs to start.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub database_url: String,
    pub redis_url: String,
    pub database_max_connections: u32,
    pub poll_interval: Duration,
    pub retry_policy: RetryPolicy,
    pub worker_concurrency: usize,
    pub rate_limit: RateLimitPolicy,
    pub event_channel: String,
    pub log_format: LogFormat,
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let max_attempts: u32 = env.parse_or("JOB_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(invalid("JOB_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        let backoff = minutes(env.parse_or("JOB_BACKOFF_MINUTES", 5)?);
        let max_backoff = minutes(env.parse_or("JOB_BACKOFF_MAX_MINUTES", 60)?);
        let strategy: BackoffStrategy = env.parse_or("JOB_BACKOFF_STRATEGY", BackoffStrategy::Fixed)?;

        let worker_concurrency: usize = env.parse_or("WORKER_CONCURRENCY", 1)?;
        if worker_concurrency == 0 {
            return Err(invalid("WORKER_CONCURRENCY", "0", "must be at least 1"));
        }

        let poll_secs: u64 = env.parse_or("JOB_POLL_INTERVAL_SECS", 5)?;
        if poll_secs == 0 {
            return Err(invalid("JOB_POLL_INTERVAL_SECS", "0", "must be at least 1"));
        }

        Ok(Self {
            database_url: env.required("DATABASE_URL")?,
            redis_url: env.required("REDIS_URL")?,
            database_max_connections: env.parse_or("DATABASE_MAX_CONNECTIONS", 10)?,
            poll_interval: Duration::from_secs(poll_secs),
            retry_policy: RetryPolicy {
                max_attempts,
                backoff,
                max_delay: max_backoff.max(backoff),
                strategy,
            },
            worker_concurrency,
            rate_limit: rate_limit_policy(&env)?,
            event_channel: env
                .optional("EVENT_CHANNEL")
                .unwrap_or_else(|| "taskgate:events".to_string()),
            log_format: env.parse_or("LOG_FORMAT", LogFormat::Json)?,
        })
    }

    /// Worker settings derived from this configuration.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_interval(self.poll_interval)
            .with_retry_policy(self.retry_policy.clone())
    }
}

fn rate_limit_policy(env: &Env<'_>) -> Result<RateLimitPolicy, ConfigError> {
    let default_rule: RateLimitRule = env.parse_or("RATE_LIMIT_DEFAULT", RateLimitRule::per_minute(100))?;
    let mut policy = RateLimitPolicy::new(default_rule);

    let overrides = env
        .optional("RATE_LIMIT_OVERRIDES")
        .unwrap_or_else(|| "/api/auth=5/60".to_string());
    for entry in split_list(&overrides) {
        let (prefix, rule) = entry
            .split_once('=')
            .ok_or_else(|| invalid("RATE_LIMIT_OVERRIDES", entry, "expected 'prefix=max/secs'"))?;
        let rule: RateLimitRule = rule
            .parse()
            .map_err(|reason: String| invalid("RATE_LIMIT_OVERRIDES", entry, &reason))?;
        if !prefix.trim().starts_with('/') {
            return Err(invalid("RATE_LIMIT_OVERRIDES", entry, "prefix must start with '/'"));
        }
        policy = policy.with_override(prefix.trim(), rule);
    }

    let exempt = env
        .optional("RATE_LIMIT_EXEMPT")
        .unwrap_or_else(|| "/health,/docs,/openapi.json".to_string());
    for path in split_list(&exempt) {
        policy = policy.with_exempt(path);
    }

    Ok(policy)
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(60))
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    /// Unset and blank are the same.
    fn optional(&self, var: &'static str) -> Option<String> {
        (self.0)(var).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.optional(var).ok_or(ConfigError::Missing(var))
    }

    fn parse_or<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: core::str::FromStr,
        T::Err: core::fmt::Display,
    {
        match self.optional(var) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e: T::Err| invalid(var, &raw, &e.to_string())),
        }
    }
}
