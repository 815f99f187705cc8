//! Local publish/subscribe hubs.
//!
//! Engine components announce lifecycle events (a transaction was added, a
//! message needs signing) on named hubs. Hubs are looked up through the
//! [`HubRegistry`] at publish time, so wrapping a hub with
//! [`HubRegistry::decorate`] changes what every later publisher reaches
//! without touching the original hub.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde_json::Value;

pub type Subscriber = Arc<dyn Fn(&[Value]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver `args` to every subscriber, in subscription order, before returning.
    fn publish(&self, args: &[Value]);

    fn subscribe(&self, subscriber: Subscriber) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

pub struct EventHub {
    name: String,
    next: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
}

impl EventHub {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            next: AtomicU64::new(0),
            subscribers: RwLock::new(Vec::new()),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map_or_else(|p| p.into_inner().len(), |s| s.len())
    }
}

impl Publisher for EventHub {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, args: &[Value]) {
        // snapshot so a subscriber may (un)subscribe while being called
        let subscribers: Vec<Subscriber> = match self.subscribers.read() {
            Ok(list) => list.iter().map(|(_, s)| s.clone()).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|(_, s)| s.clone()).collect(),
        };
        for subscriber in subscribers {
            subscriber(args);
        }
    }

    fn subscribe(&self, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next.fetch_add(1, Ordering::Relaxed));
        match self.subscribers.write() {
            Ok(mut list) => list.push((id, subscriber)),
            Err(poisoned) => poisoned.into_inner().push((id, subscriber)),
        }
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut list = match self.subscribers.write() {
            Ok(list) => list,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        before != list.len()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("name", &self.name)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[derive(Default)]
pub struct HubRegistry {
    hubs: DashMap<String, Arc<dyn Publisher>>,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hub: Arc<dyn Publisher>) {
        self.hubs.insert(hub.name().to_owned(), hub);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Publisher>> {
        self.hubs.get(name).map(|hub| hub.clone())
    }

    /// Existing hub, or a fresh [`EventHub`] registered under `name`.
    pub fn get_or_create(&self, name: &str) -> Arc<dyn Publisher> {
        self.hubs
            .entry(name.to_owned())
            .or_insert_with(|| EventHub::new(name) as Arc<dyn Publisher>)
            .clone()
    }

    /// Publish on the named hub. Returns `false` if there is none.
    pub fn publish(&self, name: &str, args: &[Value]) -> bool {
        match self.get(name) {
            Some(hub) => {
                hub.publish(args);
                true
            }
            None => false,
        }
    }

    /// Replace the hub registered under `name` with `wrap(hub)`.
    pub fn decorate<F>(&self, name: &str, wrap: F) -> bool
    where
        F: FnOnce(Arc<dyn Publisher>) -> Arc<dyn Publisher>,
    {
        match self.hubs.get_mut(name) {
            Some(mut slot) => {
                let wrapped = wrap(slot.value().clone());
                *slot = wrapped;
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hubs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for HubRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
