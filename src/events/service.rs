//! Event broadcasting service
//!
//! Published events land in a five-tier [`PriorityRouter`]; a drain task takes them out one at a
//! time in tier order and starts one [`EventSink`] delivery per currently matching subscription.
//! Deliveries run as their own tasks, so a subscriber that is slow to acknowledge never holds
//! back later events; `max_concurrent_deliveries` bounds how many are in flight. A metrics task
//! refreshes throughput, purges expired subscriptions and notifies metrics observers.

use super::delivery::EventSink;
use super::metrics::EventStats;
use super::model::{
    EventDelivery, EventMetrics, EventSubscription, HealthLevel, NewEvent, PublishResult,
    PublishStatus, RealTimeEvent, SubscriptionRequest, SystemHealth,
};
use super::router::{DrainPolicy, PriorityRouter};
use super::subscriptions::SubscriptionIndex;
use crate::error::{MeshError, MeshResult};
use crate::observability::metrics;
use crate::observer::ObserverRegistry;
use crate::protocol::{now_millis, validate_identifier};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventServiceConfig {
    /// Maximum pending events per priority tier
    #[serde(default = "default_tier_capacity")]
    pub tier_capacity: usize,
    #[serde(default)]
    pub drain_policy: DrainPolicy,
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,
    /// Sink deliveries allowed in flight before the drain task waits for one to finish
    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,
}

fn default_tier_capacity() -> usize {
    10_000
}

fn default_metrics_interval_ms() -> u64 {
    10_000
}

fn default_max_concurrent_deliveries() -> usize {
    256
}

impl Default for EventServiceConfig {
    fn default() -> Self {
        Self {
            tier_capacity: default_tier_capacity(),
            drain_policy: DrainPolicy::default(),
            metrics_interval_ms: default_metrics_interval_ms(),
            max_concurrent_deliveries: default_max_concurrent_deliveries(),
        }
    }
}

struct EventState {
    running: bool,
    started_at: Option<Instant>,
    router: PriorityRouter,
    subscriptions: SubscriptionIndex,
    stats: EventStats,
}

struct Inner {
    config: EventServiceConfig,
    sink: Arc<dyn EventSink>,
    state: Mutex<EventState>,
    wake: Notify,
    deliveries: ObserverRegistry<EventDelivery>,
    metrics_updates: ObserverRegistry<EventMetrics>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    async fn drain_loop(self: Arc<Self>) {
        let limit = self.config.max_concurrent_deliveries.max(1);
        let mut in_flight = JoinSet::new();
        loop {
            let next = lock(&self.state).router.pop();
            match next {
                Some(event) => {
                    self.dispatch(event, &mut in_flight);
                    while in_flight.len() >= limit {
                        in_flight.join_next().await;
                    }
                }
                None => tokio::select! {
                    _ = self.wake.notified() => {}
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                },
            }
        }
    }

    /// Start one delivery task per matching subscription; the drain loop never waits on a sink
    fn dispatch(self: &Arc<Self>, event: RealTimeEvent, in_flight: &mut JoinSet<()>) {
        let span = crate::event_span!(event_id = %event.id, event_type = %event.event_type);
        let _entered = span.enter();

        let targets = lock(&self.state)
            .subscriptions
            .matching(&event, now_millis());
        if targets.is_empty() {
            debug!("no matching subscriptions");
            return;
        }
        debug!(targets = targets.len(), "event drained");

        let event = Arc::new(event);
        for subscription in targets {
            let inner = Arc::clone(self);
            let event = Arc::clone(&event);
            in_flight.spawn(
                async move { inner.deliver(subscription, &event).await }.instrument(span.clone()),
            );
        }
    }

    async fn deliver(&self, subscription: EventSubscription, event: &RealTimeEvent) {
        match self.sink.deliver(&subscription, event).await {
            Ok(()) => {
                let latency_ms = (now_millis() - event.timestamp).max(0) as f64;
                let updated = {
                    let mut state = lock(&self.state);
                    state.stats.record_delivered(latency_ms);
                    state.subscriptions.get_mut(&subscription.id).map(|sub| {
                        sub.record_delivery(latency_ms);
                        sub.clone()
                    })
                };
                metrics().events_delivered(1);
                self.deliveries.notify(&EventDelivery {
                    subscription: updated.unwrap_or(subscription),
                    event: event.clone(),
                });
            }
            Err(e) => {
                lock(&self.state).stats.record_failed();
                metrics().event_failed();
                warn!(subscription_id = %subscription.id, "event delivery failed: {}", e);
            }
        }
    }

    fn current_metrics(&self) -> EventMetrics {
        let state = lock(&self.state);
        state.stats.snapshot(
            state.subscriptions.active_count(now_millis()),
            state.router.depths(),
        )
    }

    fn refresh_metrics(&self) -> EventMetrics {
        let snapshot = {
            let mut state = lock(&self.state);
            let expired = state.subscriptions.purge_expired(now_millis());
            if !expired.is_empty() {
                info!(count = expired.len(), "expired subscriptions removed");
            }
            state.stats.sample_rate(Instant::now());
            state.stats.snapshot(
                state.subscriptions.active_count(now_millis()),
                state.router.depths(),
            )
        };
        self.metrics_updates.notify(&snapshot);
        snapshot
    }

    fn require_running(&self) -> MeshResult<()> {
        if lock(&self.state).running {
            Ok(())
        } else {
            Err(MeshError::invalid_state(
                "event broadcasting service is not running",
            ))
        }
    }
}

/// Priority-tiered event fan-out to subscriptions
pub struct EventBroadcastService {
    inner: Arc<Inner>,
}

impl EventBroadcastService {
    pub fn new(config: EventServiceConfig, sink: Arc<dyn EventSink>) -> Self {
        let router = PriorityRouter::new(config.tier_capacity, config.drain_policy.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                state: Mutex::new(EventState {
                    running: false,
                    started_at: None,
                    router,
                    subscriptions: SubscriptionIndex::new(),
                    stats: EventStats::new(),
                }),
                wake: Notify::new(),
                deliveries: ObserverRegistry::new(),
                metrics_updates: ObserverRegistry::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Notified once per successful delivery
    pub fn deliveries(&self) -> &ObserverRegistry<EventDelivery> {
        &self.inner.deliveries
    }

    /// Notified on every scheduled metrics refresh
    pub fn metrics_updates(&self) -> &ObserverRegistry<EventMetrics> {
        &self.inner.metrics_updates
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.state).running
    }

    /// Start the drain and metrics tasks. Must be called from within a Tokio runtime.
    pub fn start(&self) -> MeshResult<()> {
        {
            let mut state = lock(&self.inner.state);
            if state.running {
                return Err(MeshError::invalid_state(
                    "event broadcasting service is already running",
                ));
            }
            state.running = true;
            state.started_at = Some(Instant::now());
        }

        let mut tasks = lock(&self.inner.tasks);
        tasks.push(tokio::spawn(Arc::clone(&self.inner).drain_loop()));

        let every = Duration::from_millis(self.inner.config.metrics_interval_ms.max(1));
        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let snapshot = inner.refresh_metrics();
                debug!(
                    published = snapshot.events_published,
                    delivered = snapshot.events_delivered,
                    "event metrics updated"
                );
            }
        }));

        // Events published before a restart are still pending
        self.inner.wake.notify_one();
        info!(
            tier_capacity = self.inner.config.tier_capacity,
            "event broadcasting service started"
        );
        Ok(())
    }

    /// Stop the background tasks and drop pending events; subscriptions are kept
    pub fn stop(&self) -> MeshResult<()> {
        let dropped = {
            let mut state = lock(&self.inner.state);
            if !state.running {
                return Err(MeshError::invalid_state(
                    "event broadcasting service is not running",
                ));
            }
            state.running = false;
            state.started_at = None;
            state.router.clear()
        };

        for handle in lock(&self.inner.tasks).drain(..) {
            handle.abort();
        }
        info!(dropped, "event broadcasting service stopped");
        Ok(())
    }

    /// Queue an event for delivery
    ///
    /// The returned `delivered_to` lists the users whose subscriptions match right now; the drain
    /// task recomputes matches when the event is actually delivered.
    pub fn publish_event(&self, event: NewEvent) -> MeshResult<PublishResult> {
        let started = Instant::now();
        self.inner.require_running()?;

        if event.event_type.trim().is_empty() {
            return Err(MeshError::validation("event type is required"));
        }
        validate_identifier(&event.source.user_id)
            .map_err(|e| MeshError::validation(format!("invalid source userId: {e}")))?;

        let event = event.into_event();
        let event_id = event.id.clone();
        let priority = event.priority;

        let delivered_to = {
            let mut state = lock(&self.inner.state);
            let matches = state.subscriptions.matching(&event, now_millis());
            let pushed = state.router.push(event);
            if let Err(e) = pushed {
                state.stats.record_failed();
                drop(state);
                metrics().event_failed();
                warn!(event_id = %event_id, ?priority, "event rejected: {}", e);
                return Err(e);
            }
            state.stats.record_published();
            matches.into_iter().map(|sub| sub.user_id).collect::<Vec<_>>()
        };

        metrics().event_published();
        self.inner.wake.notify_one();

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(event_id = %event_id, ?priority, matched = delivered_to.len(), "event published");
        Ok(PublishResult {
            event_id,
            status: PublishStatus::Published,
            delivered_to,
            latency_ms,
        })
    }

    pub fn subscribe_to_events(
        &self,
        request: SubscriptionRequest,
    ) -> MeshResult<EventSubscription> {
        self.inner.require_running()?;

        validate_identifier(&request.user_id)
            .map_err(|e| MeshError::validation(format!("invalid userId: {e}")))?;
        validate_identifier(&request.device_id)
            .map_err(|e| MeshError::validation(format!("invalid deviceId: {e}")))?;
        if request.event_types.is_empty() || request.event_types.iter().any(|t| t.trim().is_empty())
        {
            return Err(MeshError::validation("subscription eventTypes are required"));
        }

        let subscription = EventSubscription::from_request(request);
        lock(&self.inner.state)
            .subscriptions
            .insert(subscription.clone());

        info!(
            subscription_id = %subscription.id,
            user_id = %subscription.user_id,
            event_types = ?subscription.event_types,
            "subscription created"
        );
        Ok(subscription)
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> MeshResult<EventSubscription> {
        self.inner.require_running()?;

        let removed = lock(&self.inner.state)
            .subscriptions
            .remove(subscription_id)
            .ok_or_else(|| MeshError::not_found(format!("subscription {subscription_id}")))?;
        info!(subscription_id, "subscription removed");
        Ok(removed)
    }

    pub fn get_subscription(&self, subscription_id: &str) -> Option<EventSubscription> {
        lock(&self.inner.state)
            .subscriptions
            .get(subscription_id)
            .cloned()
    }

    pub fn get_user_subscriptions(&self, user_id: &str) -> Vec<EventSubscription> {
        lock(&self.inner.state).subscriptions.for_user(user_id)
    }

    pub fn get_event_metrics(&self) -> EventMetrics {
        self.inner.current_metrics()
    }

    pub fn get_system_health(&self) -> SystemHealth {
        let metrics = self.inner.current_metrics();
        let (running, uptime_secs) = {
            let state = lock(&self.inner.state);
            (
                state.running,
                state
                    .started_at
                    .map(|at| at.elapsed().as_secs())
                    .unwrap_or(0),
            )
        };

        let status = if running {
            HealthLevel::from_metrics(&metrics)
        } else {
            HealthLevel::Unhealthy
        };
        SystemHealth {
            status,
            running,
            uptime_secs,
            error_rate: metrics.error_rate,
            average_latency_ms: metrics.average_latency_ms,
            throughput: metrics.events_per_second,
            active_subscriptions: metrics.active_subscriptions,
            queue_depths: metrics.queue_depths,
            last_health_check: now_millis(),
        }
    }
}

impl Drop for EventBroadcastService {
    fn drop(&mut self) {
        for handle in lock(&self.inner.tasks).drain(..) {
            handle.abort();
        }
    }
}
