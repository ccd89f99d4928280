//! Redis-backed sliding-window limiter shared by every process.
//!
//! Each key is a sorted set of request timestamps (ms). One Lua script per
//! call purges, counts, conditionally records and refreshes the TTL, so the
//! whole check is atomic on the Redis side.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use uuid::Uuid;

use taskgate_core::{Clock, SharedClock, SystemClock};

use super::types::{RateLimitDecision, RateLimitRule};
use super::{RateLimitError, RateLimiter};

const KEY_PREFIX: &str = "ratelimit:";

/// KEYS[1] window key; ARGV: now_ms, window_ms, max_requests, member.
/// Returns {allowed, count_before, oldest_ms}.
const SLIDING_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local allowed = 0
if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
  allowed = 1
end
redis.call('PEXPIRE', key, window)

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_ms = -1
if oldest[2] then
  oldest_ms = tonumber(oldest[2])
end
return {allowed, count, oldest_ms}
"#;

#[derive(Clone)]
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    script: Script,
    clock: SharedClock,
}

impl RedisRateLimiter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Script::new(SLIDING_WINDOW_LUA),
            clock: SystemClock::shared(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }
}

impl core::fmt::Debug for RedisRateLimiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisRateLimiter").finish_non_exhaustive()
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn is_allowed(
        &self,
        key: &str,
        rule: &RateLimitRule,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let window_ms = u64::try_from(rule.window.as_millis()).unwrap_or(u64::MAX).max(1);
        let member = format!("{now_ms}-{}", Uuid::now_v7());

        let mut conn = self.conn.clone();
        let (_allowed, count, oldest_ms): (i64, i64, i64) = self
            .script
            .key(format!("{KEY_PREFIX}{key}"))
            .arg(now_ms)
            .arg(window_ms)
            .arg(rule.max_requests)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;

        let oldest = (oldest_ms >= 0)
            .then(|| chrono::DateTime::from_timestamp_millis(oldest_ms))
            .flatten();
        let request_count = u32::try_from(count).unwrap_or(u32::MAX);

        Ok(RateLimitDecision::from_window(rule, request_count, oldest, now))
    }
}
