//! Subscription options and the priority-ordered subscription table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use crate::event::Event;
use crate::filter::EventFilter;
use crate::handler::EventHandler;

/// Identifier returned by [`crate::EventBus::subscribe`].
pub type SubscriptionId = Uuid;

/// Options for a subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Higher priorities run first.
    pub priority: i32,
    /// Events not matching the filter are skipped without side effects.
    pub filter: Option<EventFilter>,
    /// Remove the subscription after its first matching delivery.
    pub once: bool,
    /// Owner label, used for bulk removal.
    pub subscriber: Option<String>,
}

impl SubscribeOptions {
    /// Default options: priority 0, no filter, persistent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the filter.
    pub fn filter(mut self, filter: EventFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Marks the subscription as single-shot.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Sets the owning subscriber label.
    pub fn subscriber(mut self, subscriber: impl Into<String>) -> Self {
        self.subscriber = Some(subscriber.into());
        self
    }
}

/// A stored subscription.
#[derive(Clone)]
pub(crate) struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) priority: i32,
    pub(crate) filter: Option<EventFilter>,
    pub(crate) once: bool,
    pub(crate) subscriber: Option<String>,
    /// Registration order, used to break priority ties.
    seq: u64,
    /// Set once a single-shot subscription has been consumed.
    pub(crate) claimed: Arc<AtomicBool>,
}

impl Subscription {
    /// Returns whether the event passes this subscription's filter.
    pub(crate) fn accepts(&self, event: &Event) -> bool {
        self.filter.as_ref().is_none_or(|f| f.matches(event))
    }

    /// Consumes a single-shot subscription. Persistent subscriptions always succeed.
    pub(crate) fn try_claim(&self) -> bool {
        if !self.once {
            return true;
        }
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Event type → subscriptions sorted by descending priority, then registration order.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    by_type: HashMap<String, Vec<Subscription>>,
    next_seq: u64,
}

impl SubscriptionTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts a subscription and returns its ID and claim flag.
    pub(crate) fn insert(
        &mut self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> (SubscriptionId, Arc<AtomicBool>) {
        let id = Uuid::new_v4();
        let claimed = Arc::new(AtomicBool::new(false));
        let seq = self.next_seq;
        self.next_seq += 1;

        let entries = self.by_type.entry(event_type.to_string()).or_default();
        entries.push(Subscription {
            id,
            handler,
            priority: options.priority,
            filter: options.filter,
            once: options.once,
            subscriber: options.subscriber,
            seq,
            claimed: Arc::clone(&claimed),
        });
        entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));

        (id, claimed)
    }

    /// Removes exactly one subscription. Returns whether it existed.
    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for entries in self.by_type.values_mut() {
            if let Some(pos) = entries.iter().position(|s| s.id == id) {
                entries.remove(pos);
                removed = true;
                break;
            }
        }
        self.by_type.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// Removes every subscription owned by `subscriber`.
    pub(crate) fn remove_subscriber(&mut self, subscriber: &str) -> usize {
        let mut removed = 0;
        for entries in self.by_type.values_mut() {
            let before = entries.len();
            entries.retain(|s| s.subscriber.as_deref() != Some(subscriber));
            removed += before - entries.len();
        }
        self.by_type.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// Snapshot of the subscriptions for an event type, in dispatch order.
    pub(crate) fn matching(&self, event_type: &str) -> Vec<Subscription> {
        self.by_type.get(event_type).cloned().unwrap_or_default()
    }

    /// Number of subscriptions, optionally for one event type.
    pub(crate) fn count(&self, event_type: Option<&str>) -> usize {
        match event_type {
            Some(t) => self.by_type.get(t).map(Vec::len).unwrap_or(0),
            None => self.by_type.values().map(Vec::len).sum(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.by_type.clear();
    }
}
