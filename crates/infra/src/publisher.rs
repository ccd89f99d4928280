//! Best-effort notification publisher.
//!
//! Wraps an [`EventBus`] so callers never see a transport failure: every
//! publish resolves to `true` (handed to the transport) or `false` (dropped,
//! logged at warn). Publishing is always bounded by a timeout. The
//! `*_detached` variants run the send on its own task so the caller never
//! waits on the transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use taskgate_core::{Clock, SharedClock, SystemClock};
use taskgate_events::{Event, EventBus, Priority, PublishError, ROOM_ALL};

use crate::jobs::{Job, JobStatus};

/// Room for job lifecycle notifications.
pub const ROOM_JOBS: &str = "jobs";
/// Room for agent status notifications.
pub const ROOM_AGENTS: &str = "agents";

const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub published: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Cheap to clone; clones share the transport and counters.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn EventBus<Event>>,
    clock: SharedClock,
    timeout: Duration,
    counters: Arc<Counters>,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus<Event>>) -> Self {
        Self {
            bus,
            clock: SystemClock::shared(),
            timeout: DEFAULT_PUBLISH_TIMEOUT,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Publish to every room at normal priority.
    pub async fn publish(&self, event_type: &str, data: Value) -> bool {
        self.publish_to(event_type, data, ROOM_ALL, Priority::Normal)
            .await
    }

    pub async fn publish_to(
        &self,
        event_type: &str,
        data: Value,
        room: &str,
        priority: Priority,
    ) -> bool {
        let event = Event::new(event_type, data, self.clock.now())
            .in_room(room)
            .with_priority(priority);
        self.send(event).await
    }

    /// Hand a prepared event to the transport.
    pub async fn send(&self, event: Event) -> bool {
        let event_type = event.event_type.clone();

        let result = match tokio::time::timeout(self.timeout, self.bus.publish(event)).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(self.timeout)),
        };

        match result {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                debug!(event_type = %event_type, "published event");
                true
            }
            Err(error) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event_type = %event_type, error = %error, "dropping event");
                false
            }
        }
    }

    /// Send on a background task. The event is stamped now, not when the
    /// transport gets to it.
    pub fn send_detached(&self, event: Event) -> JoinHandle<bool> {
        let publisher = self.clone();
        tokio::spawn(async move { publisher.send(event).await })
    }

    /// Announce a job's current state to the `jobs` room.
    pub async fn publish_job(&self, job: &Job) -> bool {
        self.send(self.job_envelope(job)).await
    }

    /// Like [`publish_job`](Self::publish_job) without waiting on the transport.
    pub fn publish_job_detached(&self, job: &Job) -> JoinHandle<bool> {
        self.send_detached(self.job_envelope(job))
    }

    fn job_envelope(&self, job: &Job) -> Event {
        let (event_type, priority) = job_event(job);
        let data = json!({
            "job_id": job.id.to_string(),
            "job_type": job.job_type,
            "status": job.status.as_str(),
            "attempts": job.attempts,
            "last_error": job.last_error,
            "next_run_at": job.next_run_at,
        });
        Event::new(event_type, data, self.clock.now())
            .in_room(ROOM_JOBS)
            .with_priority(priority)
    }

    /// Announce an agent status change to the `agents` room.
    pub async fn publish_agent_status(&self, agent_id: &str, status: &str, detail: Value) -> bool {
        let data = json!({
            "agent_id": agent_id,
            "status": status,
            "detail": detail,
        });
        self.publish_to("agent.status", data, ROOM_AGENTS, Priority::Normal)
            .await
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.counters.published.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl core::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("timeout", &self.timeout)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// `job.<status>`; jobs needing an operator are high priority.
fn job_event(job: &Job) -> (String, Priority) {
    let priority = match job.status {
        JobStatus::Error | JobStatus::Failed => Priority::High,
        _ => Priority::Normal,
    };
    (format!("job.{}", job.status), priority)
}
