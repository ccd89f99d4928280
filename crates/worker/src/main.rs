use std::sync::Arc;

use anyhow::Context;
use serde_json::json;

use taskgate_infra::DispatchConfig;
use taskgate_infra::connections::{connect_postgres, connect_redis};
use taskgate_infra::event_bus::RedisPubSubEventBus;
use taskgate_infra::jobs::{HandlerRegistry, JobStore, PgJobStore, WorkerPool};
use taskgate_infra::publisher::EventPublisher;

/// Handlers this process knows how to run.
fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("noop", |job| async move {
        tracing::debug!(job_id = %job.id, "noop job");
        Ok(())
    });
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DispatchConfig::from_env().context("loading configuration")?;
    taskgate_observability::init(config.log_format);

    let pool = connect_postgres(&config.database_url, config.database_max_connections)
        .await
        .context("connecting to postgres")?;
    let store = PgJobStore::new(pool);
    store.ensure_schema().await.context("applying job schema")?;

    let redis = connect_redis(&config.redis_url)
        .await
        .context("connecting to redis")?;
    let bus = RedisPubSubEventBus::new(redis.client, redis.conn, config.event_channel.clone());
    let publisher = EventPublisher::new(Arc::new(bus));

    let store: Arc<dyn JobStore> = Arc::new(store);
    let registry = Arc::new(registry());
    tracing::info!(
        concurrency = config.worker_concurrency,
        job_types = ?registry.job_types(),
        "starting job workers"
    );

    let pool = WorkerPool::spawn(
        config.worker_concurrency,
        store.clone(),
        registry,
        Some(publisher.clone()),
        config.worker_config(),
    );
    publisher
        .publish_agent_status(
            "taskgate-worker",
            "online",
            json!({ "workers": pool.len() }),
        )
        .await;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested, waiting for in-flight jobs");

    let stats = pool.shutdown().await;
    publisher
        .publish_agent_status("taskgate-worker", "offline", json!({ "stats": stats }))
        .await;

    match store.stats().await {
        Ok(queue) => tracing::info!(?stats, ?queue, "job workers stopped"),
        Err(e) => tracing::info!(?stats, error = %e, "job workers stopped"),
    }

    Ok(())
}
