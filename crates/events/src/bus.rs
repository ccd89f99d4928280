//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is the transport for notifications *after* state has been
//! committed to the job store. It makes minimal promises:
//!
//! - **Broadcast**: every live subscription gets a copy of each message.
//! - **At-most-once**: a subscriber that is not connected when a message is
//!   published never sees it, and nothing is redelivered.
//! - **No ordering** across concurrent publishers or process restarts.
//!
//! Losing a message never corrupts job state; it only hides a transition from
//! observers until they poll.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Why a publish did not reach the transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

/// A subscription to the broadcast stream.
///
/// Intended for a single consuming task. Dropping it unsubscribes; the bus
/// prunes closed subscriptions on the next publish.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Take a message if one is already queued.
    pub fn try_recv(&mut self) -> Result<M, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait up to `timeout` for the next message.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<M> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Multi-writer, multi-reader broadcast transport.
#[async_trait]
pub trait EventBus<M>: Send + Sync
where
    M: Send + 'static,
{
    async fn publish(&self, message: M) -> Result<(), PublishError>;

    fn subscribe(&self) -> Subscription<M>;
}

#[async_trait]
impl<M, B> EventBus<M> for Arc<B>
where
    M: Send + 'static,
    B: EventBus<M> + ?Sized,
{
    async fn publish(&self, message: M) -> Result<(), PublishError> {
        (**self).publish(message).await
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
