//! Connection setup for Postgres and Redis.
//!
//! Called once by process bootstrap; the resulting handles are injected into
//! the job store, rate limiter and event bus.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("postgres connection failed: {0}")]
    Postgres(#[from] sqlx::Error),

    #[cfg(feature = "redis")]
    #[error("redis connection failed: {0}")]
    Redis(#[from] redis::RedisError),
}

pub async fn connect_postgres(url: &str, max_connections: u32) -> Result<PgPool, ConnectError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(url)
        .await?;

    info!(max_connections, "connected to postgres");
    Ok(pool)
}

/// Redis handles: the client (for pub/sub listeners) and a reconnecting
/// managed connection (for commands).
#[cfg(feature = "redis")]
#[derive(Clone)]
pub struct RedisHandles {
    pub client: redis::Client,
    pub conn: redis::aio::ConnectionManager,
}

#[cfg(feature = "redis")]
pub async fn connect_redis(url: &str) -> Result<RedisHandles, ConnectError> {
    let client = redis::Client::open(url)?;
    let conn = client.get_connection_manager().await?;

    info!("connected to redis");
    Ok(RedisHandles { client, conn })
}
