use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::message::CallId;

/// What a pending call eventually receives: the `ok` value or the `error` text.
pub type Completion = Result<Value, String>;

/// In-flight calls keyed by correlation id. One per side of the channel.
///
/// An entry is created by [`register`](Self::register) and removed exactly
/// once, by whichever of [`resolve`](Self::resolve), [`reject`](Self::reject)
/// or [`cancel`](Self::cancel) gets to it first. Later deliveries for the same
/// id find nothing and are ignored.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    inflight: DashMap<CallId, oneshot::Sender<Completion>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint an id that is not currently a key in the table.
    pub fn allocate(&self) -> CallId {
        loop {
            let id = Uuid::new_v4().to_string();
            if !self.inflight.contains_key(&id) {
                return id;
            }
        }
    }

    /// Store the completion handler for `id`. Returns `false` (and leaves the
    /// existing entry alone) if `id` is already in flight.
    pub fn register(&self, id: CallId, handler: oneshot::Sender<Completion>) -> bool {
        match self.inflight.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handler);
                true
            }
        }
    }

    /// Allocate an id and register a fresh completion channel under it.
    pub fn open(&self) -> (CallId, oneshot::Receiver<Completion>) {
        loop {
            let id = self.allocate();
            let (tx, rx) = oneshot::channel();
            if self.register(id.clone(), tx) {
                return (id, rx);
            }
        }
    }

    pub fn resolve(&self, id: &str, value: Value) -> bool {
        self.complete(id, Ok(value))
    }

    pub fn reject(&self, id: &str, error: impl Into<String>) -> bool {
        self.complete(id, Err(error.into()))
    }

    /// Drop the entry without notifying anyone (caller gave up).
    pub fn cancel(&self, id: &str) -> bool {
        self.inflight.remove(id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.inflight.len()
    }

    fn complete(&self, id: &str, outcome: Completion) -> bool {
        match self.inflight.remove(id) {
            Some((_, handler)) => {
                // the awaiting side may have been dropped; nothing to do then
                let _ = handler.send(outcome);
                true
            }
            None => {
                debug!(%id, "no pending call for response, ignoring");
                false
            }
        }
    }
}
