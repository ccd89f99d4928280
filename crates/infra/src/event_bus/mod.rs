//! Infrastructure event bus implementations.
//!
//! The bus abstraction lives in `taskgate-events` as pure mechanics. This
//! module provides the Redis-backed transport used in production.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::RedisPubSubEventBus;
