//! Redis pub/sub-backed event bus.
//!
//! Redis pub/sub is not durable: subscribers that are offline when a message
//! is published never see it. That matches the at-most-once contract of
//! [`EventBus`]; job state itself lives in the job store.

use std::pin::pin;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use taskgate_events::{Event, EventBus, PublishError, Subscription};

/// Redis pub/sub bus for JSON event envelopes.
#[derive(Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
    conn: ConnectionManager,
    channel: String,
}

impl RedisPubSubEventBus {
    pub fn new(client: redis::Client, conn: ConnectionManager, channel: impl Into<String>) -> Self {
        Self {
            client,
            conn,
            channel: channel.into(),
        }
    }

    /// Open a client and a managed connection for `redis_url`.
    pub async fn connect(
        redis_url: impl AsRef<str>,
        channel: impl Into<String>,
    ) -> Result<Self, PublishError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        Ok(Self::new(client, conn, channel))
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl core::fmt::Debug for RedisPubSubEventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisPubSubEventBus")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventBus<Event> for RedisPubSubEventBus {
    async fn publish(&self, message: Event) -> Result<(), PublishError> {
        let payload =
            serde_json::to_string(&message).map_err(|e| PublishError::Serialize(e.to_string()))?;

        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(&self.channel, payload)
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        debug!(channel = %self.channel, event_type = %message.event_type, receivers, "published to redis");
        Ok(())
    }

    /// Spawns a listener task on the current tokio runtime. The subscription
    /// ends when the connection drops; callers resubscribe if they need to.
    fn subscribe(&self) -> Subscription<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let channel = self.channel.clone();

        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(p) => p,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "redis subscribe connection failed");
                    return;
                }
            };
            if let Err(e) = pubsub.subscribe(&channel).await {
                warn!(channel = %channel, error = %e, "redis subscribe failed");
                return;
            }

            let mut messages = pin!(pubsub.into_on_message());
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let event: Event = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(e) => {
                        debug!(channel = %channel, error = %e, "skipping undecodable message");
                        continue;
                    }
                };

                if tx.send(event).is_err() {
                    return;
                }
            }
            debug!(channel = %channel, "redis subscription closed");
        });

        Subscription::new(rx)
    }
}
