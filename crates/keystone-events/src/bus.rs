//! The event bus: queueing, dispatch, retry, replay, and lifecycle.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use keystone_core::config::EventBusConfig;
use keystone_core::error::AppError;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::BusError;
use crate::event::{Event, EventMetadata};
use crate::filter::EventFilter;
use crate::handler::{EventHandler, handler_fn};
use crate::stats::{EventStats, StatsCollector};
use crate::store::EventStore;
use crate::subscription::{SubscribeOptions, Subscription, SubscriptionId, SubscriptionTable};

/// Lifecycle of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusState {
    /// Constructed; publishing works but the safety-net timer is not running.
    Created,
    /// Timer running.
    Running,
    /// Final drain in progress.
    ShuttingDown,
    /// Publishing is rejected.
    Stopped,
}

impl BusState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Running => 1,
            Self::ShuttingDown => 2,
            Self::Stopped => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

struct BusInner {
    config: EventBusConfig,
    store: Option<Arc<dyn EventStore>>,
    queue: Mutex<VecDeque<Event>>,
    subscriptions: RwLock<SubscriptionTable>,
    /// Set while a drain task owns the queue.
    draining: AtomicBool,
    /// Signalled whenever a drain task finishes.
    idle: Notify,
    stats: StatsCollector,
    listeners: broadcast::Sender<Event>,
    state: AtomicU8,
    cancel: CancellationToken,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Asynchronous publish/subscribe bus.
///
/// Cloning is cheap; clones share the same queue, subscriptions, and log.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("state", &self.state())
            .field("persist", &self.inner.config.persist)
            .field("store", &self.inner.store)
            .finish()
    }
}

impl EventBus {
    /// Create a bus without an event log. Replay is unavailable.
    pub fn new(config: EventBusConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a bus that appends published events to `store`.
    pub fn with_store(config: EventBusConfig, store: Arc<dyn EventStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: EventBusConfig, store: Option<Arc<dyn EventStore>>) -> Self {
        let (listeners, _) = broadcast::channel(config.listener_capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                config,
                store,
                queue: Mutex::new(VecDeque::new()),
                subscriptions: RwLock::new(SubscriptionTable::new()),
                draining: AtomicBool::new(false),
                idle: Notify::new(),
                stats: StatsCollector::new(),
                listeners,
                state: AtomicU8::new(BusState::Created.as_u8()),
                cancel: CancellationToken::new(),
                timer: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BusState {
        BusState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BusState) -> BusState {
        BusState::from_u8(self.inner.state.swap(state.as_u8(), Ordering::AcqRel))
    }

    /// Start the periodic safety-net drain.
    pub fn start(&self) {
        let transitioned = self
            .inner
            .state
            .compare_exchange(
                BusState::Created.as_u8(),
                BusState::Running.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !transitioned {
            debug!(state = ?self.state(), "Event bus already started");
            return;
        }

        let bus = self.clone();
        let cancel = self.inner.cancel.clone();
        let interval = self.inner.config.drain_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !bus.inner.draining.load(Ordering::Acquire) && bus.queue_len().await > 0 {
                            debug!("Safety-net timer resuming drain");
                            bus.trigger_drain();
                        }
                    }
                }
            }
        });

        if let Ok(mut timer) = self.inner.timer.lock() {
            *timer = Some(handle);
        }
        info!(
            interval_ms = self.inner.config.drain_interval_ms,
            retry_attempts = self.inner.config.retry_attempts,
            "Event bus started"
        );
    }

    /// Stop the timer, drain everything still queued, and drop all subscriptions.
    ///
    /// Publishing is rejected afterwards.
    pub async fn shutdown(&self) {
        let previous = self.set_state(BusState::ShuttingDown);
        if matches!(previous, BusState::ShuttingDown | BusState::Stopped) {
            self.set_state(previous);
            return;
        }
        info!("Event bus shutting down");

        self.inner.cancel.cancel();
        let timer = self.inner.timer.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = timer {
            if let Err(e) = handle.await {
                warn!(error = %e, "Drain timer task ended abnormally");
            }
        }

        self.flush().await;
        self.inner.subscriptions.write().await.clear();
        self.set_state(BusState::Stopped);
        info!("Event bus stopped");
    }

    /// Publish an event.
    ///
    /// The event is queued, appended to the log (best effort), counted, and
    /// broadcast to immediate listeners before a drain is triggered.
    pub async fn publish(
        &self,
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: Value,
        metadata: Option<EventMetadata>,
    ) -> Result<Event, BusError> {
        if self.state() == BusState::Stopped {
            return Err(BusError::Stopped);
        }

        let mut event = Event::new(event_type, source, payload);
        if let Some(metadata) = metadata {
            event = event.with_metadata(metadata);
        }

        self.inner.queue.lock().await.push_back(event.clone());

        if self.inner.config.persist {
            if let Some(store) = &self.inner.store {
                if let Err(e) = store.append(&event).await {
                    warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %e,
                        "Failed to persist event"
                    );
                }
            }
        }

        self.inner.stats.record_published(&event);
        // No receivers is not an error.
        let _ = self.inner.listeners.send(event.clone());

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            source = %event.source,
            "Event published"
        );

        self.trigger_drain();
        Ok(event)
    }

    /// Subscribe a handler to an event type.
    pub async fn subscribe(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let event_type = event_type.into();
        let (id, _) = self
            .inner
            .subscriptions
            .write()
            .await
            .insert(&event_type, handler, options);
        debug!(event_type = %event_type, subscription_id = %id, "Subscribed");
        id
    }

    /// Remove one subscription. Returns `false` if it did not exist.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscriptions.write().await.remove(id)
    }

    /// Remove every subscription registered under `subscriber`.
    pub async fn unsubscribe_subscriber(&self, subscriber: &str) -> usize {
        let removed = self
            .inner
            .subscriptions
            .write()
            .await
            .remove_subscriber(subscriber);
        if removed > 0 {
            debug!(subscriber = %subscriber, removed, "Removed subscriptions");
        }
        removed
    }

    /// Number of subscriptions, optionally for one event type.
    pub async fn subscription_count(&self, event_type: Option<&str>) -> usize {
        self.inner.subscriptions.read().await.count(event_type)
    }

    /// Receive every published event as it is published, before dispatch.
    pub fn listen(&self) -> broadcast::Receiver<Event> {
        self.inner.listeners.subscribe()
    }

    /// Wait for the next matching event of `event_type`.
    ///
    /// On timeout the pending subscription is cancelled and can no longer fire.
    pub async fn wait_for(
        &self,
        event_type: &str,
        timeout: Duration,
        filter: Option<EventFilter>,
    ) -> Result<Event, BusError> {
        let (tx, mut rx) = oneshot::channel::<Event>();
        let slot = Arc::new(std::sync::Mutex::new(Some(tx)));

        let handler = handler_fn(move |event| {
            if let Ok(mut slot) = slot.lock() {
                if let Some(tx) = slot.take() {
                    let _ = tx.send(event);
                }
            }
            async { Ok(()) }
        });

        let mut options = SubscribeOptions::new().once();
        if let Some(filter) = filter {
            options = options.filter(filter);
        }
        let (id, claimed) = self
            .inner
            .subscriptions
            .write()
            .await
            .insert(event_type, handler, options);

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(BusError::Stopped),
            Err(_) => {
                let won = claimed
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if won {
                    self.unsubscribe(id).await;
                    Err(BusError::Timeout {
                        event_type: event_type.to_string(),
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    })
                } else {
                    // Delivery claimed the subscription just before the deadline.
                    rx.await.map_err(|_| BusError::Stopped)
                }
            }
        }
    }

    /// Re-dispatch logged events to the current subscribers.
    ///
    /// Events are read in ascending timestamp order. Nothing is queued,
    /// appended to the log, or counted as published.
    pub async fn replay_events(
        &self,
        since: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        filter: Option<&EventFilter>,
    ) -> Result<Vec<Event>, BusError> {
        let store = self
            .inner
            .store
            .as_ref()
            .ok_or_else(|| BusError::Persistence(AppError::storage("No event log configured")))?;

        let events = store
            .query(since, until, filter)
            .await
            .map_err(BusError::Persistence)?;

        info!(count = events.len(), since = %since, "Replaying events");

        for event in &events {
            let subscriptions = self
                .inner
                .subscriptions
                .read()
                .await
                .matching(&event.event_type);
            self.dispatch(event, subscriptions).await;
        }

        Ok(events)
    }

    /// Snapshot of the delivery statistics.
    pub fn stats(&self) -> EventStats {
        self.inner.stats.snapshot()
    }

    /// Reset all statistics.
    pub fn clear_stats(&self) {
        self.inner.stats.clear();
    }

    /// Number of events waiting to be dispatched.
    pub async fn queue_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// Wait until the queue is empty and no drain is running.
    pub async fn flush(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let empty = self.inner.queue.lock().await.is_empty();
            let draining = self.inner.draining.load(Ordering::Acquire);
            if empty && !draining {
                return;
            }
            if !draining {
                self.trigger_drain();
            }
            notified.await;
        }
    }

    fn trigger_drain(&self) {
        if self.inner.draining.load(Ordering::Acquire) {
            return;
        }
        let bus = self.clone();
        tokio::spawn(async move {
            bus.drain().await;
        });
    }

    async fn drain(&self) {
        loop {
            if self
                .inner
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            let guard = DrainGuard(&*self.inner);
            loop {
                let next = self.inner.queue.lock().await.pop_front();
                let Some(event) = next else {
                    break;
                };
                self.process_event(&event).await;
            }
            drop(guard);

            // A publish may have landed between the last pop and the flag reset.
            if self.inner.queue.lock().await.is_empty() {
                return;
            }
        }
    }

    async fn process_event(&self, event: &Event) {
        let started = Instant::now();
        let subscriptions = self
            .inner
            .subscriptions
            .read()
            .await
            .matching(&event.event_type);
        self.dispatch(event, subscriptions).await;
        self.inner.stats.record_processed(started.elapsed());
    }

    async fn dispatch(&self, event: &Event, subscriptions: Vec<Subscription>) {
        for subscription in subscriptions {
            match std::panic::catch_unwind(AssertUnwindSafe(|| subscription.accepts(event))) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(panic) => {
                    self.inner.stats.record_failure();
                    error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        subscription_id = %subscription.id,
                        error = %panic_message(&*panic),
                        "Event filter panicked"
                    );
                    continue;
                }
            }
            if subscription.once {
                if !subscription.try_claim() {
                    continue;
                }
                self.inner
                    .subscriptions
                    .write()
                    .await
                    .remove(subscription.id);
            }

            if let Err(e) = self.execute_handler_with_retry(&subscription, event).await {
                self.inner.stats.record_failure();
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    subscription_id = %subscription.id,
                    subscriber = subscription.subscriber.as_deref().unwrap_or("-"),
                    error = %e,
                    "Event handler failed"
                );
            }
        }
    }

    async fn execute_handler_with_retry(
        &self,
        subscription: &Subscription,
        event: &Event,
    ) -> Result<(), BusError> {
        let attempts = self.inner.config.retry_attempts.max(1);
        let delay = self.inner.config.retry_delay();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let outcome = AssertUnwindSafe(subscription.handler.handle(event))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_error = e.message,
                Err(panic) => last_error = format!("handler panicked: {}", panic_message(&*panic)),
            }

            warn!(
                event_type = %event.event_type,
                subscription_id = %subscription.id,
                attempt,
                max = attempts,
                error = %last_error,
                "Event handler attempt failed"
            );

            if attempt < attempts {
                tokio::time::sleep(backoff(delay, attempt)).await;
            }
        }

        Err(BusError::Handler {
            event_type: event.event_type.clone(),
            attempts,
            message: last_error,
        })
    }
}

/// Linear backoff: attempt `n` waits `n × delay`.
fn backoff(delay: Duration, attempt: u32) -> Duration {
    delay.saturating_mul(attempt)
}

/// Releases the drain flag even if the drain task unwinds.
struct DrainGuard<'a>(&'a BusInner);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.draining.store(false, Ordering::Release);
        self.0.idle.notify_waiters();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fast_config() -> EventBusConfig {
        EventBusConfig {
            retry_attempts: 2,
            retry_delay_ms: 5,
            drain_interval_ms: 20,
            ..EventBusConfig::default()
        }
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            BusState::Created,
            BusState::Running,
            BusState::ShuttingDown,
            BusState::Stopped,
        ] {
            assert_eq!(BusState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*boxed), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*boxed), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7_u32);
        assert_eq!(panic_message(&*boxed), "unknown panic");
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(backoff(Duration::from_millis(5), 3), Duration::from_millis(15));
        assert_eq!(backoff(Duration::from_millis(u64::MAX), 4), Duration::MAX);
    }

    #[tokio::test]
    async fn test_listen_sees_publish() {
        let bus = EventBus::new(fast_config());
        let mut rx = bus.listen();
        bus.publish("ping", "test", json!({}), None).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "ping");
    }

    #[tokio::test]
    async fn test_replay_without_store_fails() {
        let bus = EventBus::new(fast_config());
        let err = bus.replay_events(Utc::now(), None, None).await.unwrap_err();
        assert!(matches!(err, BusError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let bus = EventBus::new(fast_config());
        bus.start();
        bus.start();
        assert_eq!(bus.state(), BusState::Running);
        bus.shutdown().await;
        assert_eq!(bus.state(), BusState::Stopped);
        bus.shutdown().await;
        assert_eq!(bus.state(), BusState::Stopped);
    }
}
