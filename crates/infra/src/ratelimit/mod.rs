//! Admission control: per-caller sliding-window rate limiting.
//!
//! Only admitted requests are recorded in a window; a caller hammering a
//! closed window does not push its own reset further out.

pub mod key;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_window;
pub mod types;

use async_trait::async_trait;

pub use key::{ClientIdentity, ClientKey};
pub use memory::InMemoryRateLimiter;
#[cfg(feature = "redis")]
pub use redis_window::RedisRateLimiter;
pub use types::{DEFAULT_SCOPE, RateLimitDecision, RateLimitPolicy, RateLimitRule, RouteLimit};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit backend error: {0}")]
    Backend(String),
}

/// Atomic check-and-record against one key's window.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn is_allowed(
        &self,
        key: &str,
        rule: &RateLimitRule,
    ) -> Result<RateLimitDecision, RateLimitError>;
}
