//! Integration tests for the dispatch pipeline.
//!
//! Tests: enqueue → claim → handler → complete/fail → event, plus admission
//! control through policy, key derivation and limiter together.
//!
//! Verifies:
//! - Success, retry-then-success and exhausted-retry paths end in the right state
//! - Events go out only after the store reflects the new state
//! - A route override is enforced per caller

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use taskgate_core::{Clock, ManualClock};
    use taskgate_events::{Event, EventBus, InMemoryEventBus, Priority, Subscription};

    use crate::jobs::{
        HandlerError, HandlerRegistry, InMemoryJobStore, JobStatus, JobStore, JobWorker,
        RetryPolicy, WorkerConfig,
    };
    use crate::publisher::{EventPublisher, ROOM_JOBS};
    use crate::ratelimit::{
        ClientIdentity, ClientKey, InMemoryRateLimiter, RateLimitPolicy, RateLimitRule,
        RateLimiter,
    };

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryJobStore>,
        events: Subscription<Event>,
        publisher: EventPublisher,
    }

    fn harness() -> Harness {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        let bus = Arc::new(InMemoryEventBus::<Event>::new());
        let events = bus.subscribe();
        let publisher = EventPublisher::new(bus).with_clock(clock.clone());

        Harness {
            clock,
            store,
            events,
            publisher,
        }
    }

    fn worker(h: &Harness, registry: HandlerRegistry, policy: RetryPolicy) -> JobWorker {
        JobWorker::new(
            h.store.clone(),
            Arc::new(registry),
            WorkerConfig::default().with_retry_policy(policy),
        )
        .with_publisher(h.publisher.clone())
    }

    /// Handler that fails its first `failures` invocations.
    fn flaky(failures: u32) -> (HandlerRegistry, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("flaky", move |_job| {
            let seen = seen.clone();
            async move {
                let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(HandlerError::failed(format!("attempt {n} failed")))
                } else {
                    Ok(())
                }
            }
        });
        (registry, calls)
    }

    #[tokio::test]
    async fn sync_job_completes_on_first_attempt() {
        let mut h = harness();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("sync", |job| async move {
            if job.payload["table"] == "agents" {
                Ok(())
            } else {
                Err(HandlerError::failed("unknown table"))
            }
        });
        let worker = worker(&h, registry, RetryPolicy::default());

        let id = h
            .store
            .enqueue("sync", json!({"table": "agents"}), None)
            .await
            .unwrap();
        worker.run_once().await.unwrap().unwrap();

        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.last_error, None);
        assert_eq!(job.attempts, 1);

        let event = h.events.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(event.event_type, "job.completed");
        assert_eq!(event.room, ROOM_JOBS);
        assert_eq!(event.data["job_id"], id.to_string());
        assert_eq!(event.timestamp, h.clock.now());
    }

    #[tokio::test]
    async fn transient_handler_failures_recover_within_budget() {
        let h = harness();
        let (registry, calls) = flaky(2);
        let backoff = Duration::from_secs(30);
        let worker = worker(&h, registry, RetryPolicy::fixed(5, backoff));

        let id = h.store.enqueue("flaky", json!({}), None).await.unwrap();

        for _ in 0..2 {
            let outcome = worker.run_once().await.unwrap().unwrap();
            assert_eq!(outcome.job.status, JobStatus::Pending);
            h.clock.advance(ChronoDuration::seconds(30));
        }
        let done = worker.run_once().await.unwrap().unwrap();

        assert!(done.succeeded());
        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn always_failing_job_parks_as_failed() {
        let mut h = harness();
        let (registry, calls) = flaky(u32::MAX);
        let worker = worker(&h, registry, RetryPolicy::fixed(3, Duration::from_secs(60)));

        let id = h.store.enqueue("flaky", json!({}), None).await.unwrap();

        let mut runs_at = Vec::new();
        while let Some(outcome) = worker.run_once().await.unwrap() {
            if outcome.job.status == JobStatus::Pending {
                runs_at.push(outcome.job.next_run_at);
                h.clock.set(outcome.job.next_run_at);
            }
        }

        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.as_deref(), Some("attempt 3 failed"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Retries spaced by the fixed backoff.
        assert_eq!(runs_at.len(), 2);
        assert_eq!(runs_at[1] - runs_at[0], ChronoDuration::seconds(60));

        // Never claimed again.
        h.clock.advance(ChronoDuration::days(1));
        assert!(worker.run_once().await.unwrap().is_none());

        // Sends are detached, so only the set of events is fixed.
        let mut kinds = Vec::new();
        while let Some(event) = h.events.recv_timeout(Duration::from_millis(200)).await {
            kinds.push((event.event_type, event.priority));
        }
        kinds.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            kinds,
            vec![
                ("job.failed".to_string(), Priority::High),
                ("job.pending".to_string(), Priority::Normal),
                ("job.pending".to_string(), Priority::Normal),
            ]
        );
    }

    #[tokio::test]
    async fn operator_can_requeue_a_failed_job() {
        let h = harness();
        let (registry, _calls) = flaky(1);
        let worker = worker(&h, registry, RetryPolicy::fixed(1, Duration::ZERO));

        let id = h.store.enqueue("flaky", json!({}), None).await.unwrap();
        let parked = worker.run_once().await.unwrap().unwrap();
        assert_eq!(parked.job.status, JobStatus::Failed);

        let requeued = h.store.retry_failed(id).await.unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.attempts, 0);

        let outcome = worker.run_once().await.unwrap().unwrap();
        assert_eq!(outcome.job.status, JobStatus::Completed);
        assert_eq!(outcome.job.attempts, 1);
    }

    #[tokio::test]
    async fn event_is_published_after_state_is_committed() {
        let mut h = harness();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("sync", |_job| async { Ok(()) });
        let worker = worker(&h, registry, RetryPolicy::default());
        let store = h.store.clone();

        let id = store.enqueue("sync", json!({}), None).await.unwrap();
        let observer = tokio::spawn(async move {
            let event = h.events.recv().await.unwrap();
            // By the time anyone hears about it, the store already agrees.
            let job = store.get(id).await.unwrap().unwrap();
            (event.data["status"].clone(), job.status)
        });

        worker.run_once().await.unwrap().unwrap();
        let (announced, stored) = observer.await.unwrap();
        assert_eq!(announced, "completed");
        assert_eq!(stored, JobStatus::Completed);
    }

    #[tokio::test]
    async fn auth_route_override_is_enforced_per_caller() {
        let clock = ManualClock::starting_now();
        let limiter = InMemoryRateLimiter::with_clock(clock.clone());
        let policy = RateLimitPolicy::new(RateLimitRule::per_minute(100))
            .with_override("/api/auth", RateLimitRule::per_minute(5));

        let caller = ClientKey::derive(&ClientIdentity {
            forwarded_for: Some("198.51.100.4"),
            ..Default::default()
        });
        let route = policy.rule_for("/api/auth/login").unwrap();
        let key = caller.scoped(route.scope);

        let mut decisions = Vec::new();
        for _ in 0..6 {
            decisions.push(limiter.is_allowed(&key, &route.rule).await.unwrap());
            clock.advance(ChronoDuration::seconds(2));
        }

        assert!(decisions[..5].iter().all(|d| d.allowed));
        assert!(!decisions[5].allowed);
        assert_eq!(decisions[5].retry_after_secs(), Some(50));

        // The same caller is unaffected on default routes.
        let other = policy.rule_for("/api/jobs").unwrap();
        let decision = limiter
            .is_allowed(&caller.scoped(other.scope), &other.rule)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 99);
    }
}
