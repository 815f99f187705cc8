use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum Slot {
    Callback(Listener),
    Channel(mpsc::UnboundedSender<Value>),
}

/// Persistent, per-category event listeners. Unlike pending calls these are
/// not consumed by delivery; every live listener of a category sees every
/// event of that category, in registration order.
#[derive(Default)]
pub struct EventListeners {
    next: AtomicU64,
    by_category: DashMap<String, Vec<(ListenerId, Arc<Slot>)>>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, category: impl Into<String>, slot: Slot) -> ListenerId {
        let id = ListenerId(self.next.fetch_add(1, Ordering::Relaxed));
        self.by_category
            .entry(category.into())
            .or_default()
            .push((id, Arc::new(slot)));
        id
    }

    pub fn add(&self, category: impl Into<String>, listener: Listener) -> ListenerId {
        self.insert(category, Slot::Callback(listener))
    }

    pub fn remove(&self, category: &str, id: ListenerId) -> bool {
        let Some(mut list) = self.by_category.get_mut(category) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        before != list.len()
    }

    /// Channel-backed listener. It is dropped from the category on the first
    /// event after its receiver went away.
    pub fn subscribe(&self, category: impl Into<String>) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(category, Slot::Channel(tx));
        rx
    }

    /// Invoke every live listener for `category`. Returns how many ran.
    pub fn dispatch(&self, category: &str, value: &Value) -> usize {
        // clone the list out so a listener may add listeners
        let listeners: Vec<(ListenerId, Arc<Slot>)> = match self.by_category.get(category) {
            Some(list) => list.clone(),
            None => return 0,
        };
        let mut delivered = 0;
        for (id, slot) in &listeners {
            match slot.as_ref() {
                Slot::Callback(listener) => listener(value),
                Slot::Channel(tx) => {
                    if tx.send(value.clone()).is_err() {
                        self.remove(category, *id);
                        continue;
                    }
                }
            }
            delivered += 1;
        }
        delivered
    }

    pub fn count(&self, category: &str) -> usize {
        self.by_category.get(category).map_or(0, |list| list.len())
    }
}

impl std::fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for entry in self.by_category.iter() {
            map.entry(entry.key(), &entry.value().len());
        }
        map.finish()
    }
}
