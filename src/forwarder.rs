//! Event Forwarder: turns worker-side activity into one-way frames.
//!
//! Sources:
//! * component state transitions → `state {key, state, overwrite}`
//! * hub publishes → `emit {key, args}` via the [`ForwardingHub`] decorator
//! * provider events → `provider_emit {key, type, args}`
//! * keyring lock hooks → `lock` / `unlock`
//! * explicit pushes from engine code → `notification`, `network_changed`, `end_network_change`
//!
//! Forwarding never fails the local side: a failed channel write is logged by
//! the bus and otherwise ignored.

use std::sync::{Arc, Mutex};

use bridge_protocol::{Bus, EventCategory};
use serde_json::{Value, json};
use tracing::debug;

use crate::engine::{LockHooks, ProviderSlot, StateChange, StatefulComponent};
use crate::hub::{HubRegistry, Publisher, Subscriber, SubscriptionId};

#[derive(Clone, Debug)]
pub struct Forwarder {
    bus: Bus,
}

impl Forwarder {
    pub fn new(bus: Bus) -> Self {
        Self { bus }
    }

    pub fn state(&self, key: &str, state: Value, overwrite: bool) -> bool {
        self.bus.emit_event(
            EventCategory::State,
            json!({ "key": key, "state": state, "overwrite": overwrite }),
        )
    }

    pub fn notification(&self, kind: &str, need_update: bool) -> bool {
        self.bus.emit_event(
            EventCategory::Notification,
            json!({ "type": kind, "needUpdate": need_update }),
        )
    }

    pub fn network_changed(&self, kind: &str, chain_id: Value) -> bool {
        self.bus.emit_event(
            EventCategory::NetworkChanged,
            json!({ "type": kind, "chainId": chain_id }),
        )
    }

    pub fn end_network_change(&self, kind: &str, provider_type: &str) -> bool {
        self.bus.emit_event(
            EventCategory::EndNetworkChange,
            json!({ "type": kind, "providerType": provider_type }),
        )
    }

    pub fn lock(&self) -> bool {
        self.bus.emit_signal(EventCategory::Lock)
    }

    pub fn unlock(&self) -> bool {
        self.bus.emit_signal(EventCategory::Unlock)
    }

    /// Subscribe to `component` and broadcast its current state once.
    ///
    /// Deltas are held back until the snapshot has been written, and the
    /// snapshot is read and written under the same lock the delta path takes,
    /// so the first `state` event for `key` always has `overwrite = true`.
    pub fn attach_component(&self, key: &str, component: Arc<dyn StatefulComponent>) {
        let primed = Arc::new(Mutex::new(false));

        let gate = primed.clone();
        let forwarder = self.clone();
        let name = key.to_owned();
        component.subscribe(Arc::new(move |change: &StateChange| {
            let ready = gate.lock().unwrap_or_else(|p| p.into_inner());
            if !*ready {
                debug!(component = %name, "state change before snapshot, covered by it");
                return;
            }
            forwarder.state(&name, change.delta(), false);
        }));

        let mut ready = primed.lock().unwrap_or_else(|p| p.into_inner());
        self.state(key, component.state(), true);
        *ready = true;
    }

    /// Wrap the hub named `name` so its publishes are also forwarded.
    pub fn decorate_hub(&self, hubs: &HubRegistry, name: &str) -> bool {
        let bus = self.bus.clone();
        hubs.decorate(name, move |inner| Arc::new(ForwardingHub::new(inner, bus)))
    }

    pub fn attach_provider(&self, slot: &ProviderSlot) {
        let bus = self.bus.clone();
        let controller = slot.controller.clone();
        let kind = slot.kind.clone();
        slot.provider.subscribe(Arc::new(move |event: &str, args: &[Value]| {
            let mut all = Vec::with_capacity(args.len() + 1);
            all.push(Value::String(event.to_owned()));
            all.extend_from_slice(args);
            bus.emit_event(
                EventCategory::ProviderEmit,
                json!({ "key": controller, "type": kind, "args": all }),
            );
        }));
    }

    pub fn attach_lock_hooks(&self, hooks: &dyn LockHooks) {
        let forwarder = self.clone();
        hooks.on_lock(Arc::new(move || {
            forwarder.lock();
        }));
        let forwarder = self.clone();
        hooks.on_unlock(Arc::new(move || {
            forwarder.unlock();
        }));
    }
}

/// Publisher decorator: local subscribers first, then one `emit` frame.
pub struct ForwardingHub {
    inner: Arc<dyn Publisher>,
    bus: Bus,
}

impl ForwardingHub {
    pub fn new(inner: Arc<dyn Publisher>, bus: Bus) -> Self {
        Self { inner, bus }
    }
}

impl Publisher for ForwardingHub {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn publish(&self, args: &[Value]) {
        self.inner.publish(args);
        self.bus.emit_event(
            EventCategory::Emit,
            json!({ "key": self.inner.name(), "args": args }),
        );
    }

    fn subscribe(&self, subscriber: Subscriber) -> SubscriptionId {
        self.inner.subscribe(subscriber)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StateListener;
    use crate::hub::EventHub;
    use bridge_protocol::codec;
    use bridge_protocol::message::{Envelope, Message};
    use bridge_protocol::transport::{Endpoint, duplex};
    use bridge_protocol::BusConfig;
    use std::sync::RwLock;

    fn forwarder() -> (Forwarder, Endpoint) {
        let (worker, ui) = duplex();
        let bus = Bus::new(worker.sender, BusConfig::new("worker"));
        (Forwarder::new(bus), ui)
    }

    fn drain(ui: &mut Endpoint) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        while let Ok(frame) = ui.receiver.try_recv() {
            match codec::decode(&frame).unwrap().classify() {
                Some(Envelope::Event { category, value }) => out.push((category, value)),
                other => panic!("expected event, got {other:?}"),
            }
        }
        out
    }

    struct Counter {
        state: RwLock<Value>,
        listeners: RwLock<Vec<StateListener>>,
    }

    impl Counter {
        fn bump(&self) {
            let state = {
                let mut state = self.state.write().unwrap();
                let n = state["count"].as_i64().unwrap_or(0) + 1;
                state["count"] = json!(n);
                state.clone()
            };
            let change = StateChange { state, changed: vec!["count".into()] };
            for l in self.listeners.read().unwrap().iter() {
                l(&change);
            }
        }
    }

    impl StatefulComponent for Counter {
        fn state(&self) -> Value {
            self.state.read().unwrap().clone()
        }
        fn subscribe(&self, listener: StateListener) {
            self.listeners.write().unwrap().push(listener);
        }
    }

    #[tokio::test]
    async fn snapshot_precedes_deltas() {
        let (fwd, mut ui) = forwarder();
        let counter = Arc::new(Counter {
            state: RwLock::new(json!({"count": 0, "label": "c"})),
            listeners: RwLock::new(vec![]),
        });
        fwd.attach_component("Counter", counter.clone());
        counter.bump();
        counter.bump();

        let events = drain(&mut ui);
        let overwrites: Vec<bool> = events.iter().map(|(_, v)| v["overwrite"].as_bool().unwrap()).collect();
        assert_eq!(overwrites, vec![true, false, false]);
        assert_eq!(events[0].1["state"], json!({"count": 0, "label": "c"}));
        assert_eq!(events[2].1["state"], json!({"count": 2}));
        assert!(events.iter().all(|(c, v)| c == "state" && v["key"] == "Counter"));
    }

    /// Changes state while it is being subscribed to.
    struct Eager(Counter);

    impl StatefulComponent for Eager {
        fn state(&self) -> Value {
            self.0.state()
        }
        fn subscribe(&self, listener: StateListener) {
            self.0.subscribe(listener);
            self.0.bump();
        }
    }

    #[tokio::test]
    async fn change_during_subscribe_is_covered_by_snapshot() {
        let (fwd, mut ui) = forwarder();
        let eager = Arc::new(Eager(Counter {
            state: RwLock::new(json!({"count": 0})),
            listeners: RwLock::new(vec![]),
        }));
        fwd.attach_component("Eager", eager.clone());

        let events = drain(&mut ui);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1["overwrite"], json!(true));
        assert_eq!(events[0].1["state"], json!({"count": 1}));

        eager.0.bump();
        let events = drain(&mut ui);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1["overwrite"], json!(false));
        assert_eq!(events[0].1["state"], json!({"count": 2}));
    }

    #[tokio::test]
    async fn concurrent_changes_never_precede_snapshot() {
        let (fwd, mut ui) = forwarder();
        let counter = Arc::new(Counter {
            state: RwLock::new(json!({"count": 0})),
            listeners: RwLock::new(vec![]),
        });

        let bumper = {
            let counter = counter.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    counter.bump();
                }
            })
        };
        fwd.attach_component("Counter", counter.clone());
        bumper.join().unwrap();

        let events = drain(&mut ui);
        assert!(!events.is_empty());
        assert_eq!(events[0].1["overwrite"], json!(true));
        assert!(events[1..].iter().all(|(_, v)| v["overwrite"] == json!(false)));
        assert_eq!(events.last().unwrap().1["state"]["count"], json!(200));
    }

    #[tokio::test]
    async fn forwarding_hub_runs_local_subscribers_first() {
        let (fwd, mut ui) = forwarder();
        let hubs = HubRegistry::new();
        let hub = EventHub::new("TransactionController");
        hubs.register(hub.clone());

        let (tx, mut local) = tokio::sync::mpsc::unbounded_channel();
        hub.subscribe(Arc::new(move |args: &[Value]| {
            tx.send(args.to_vec()).unwrap();
        }));

        assert!(fwd.decorate_hub(&hubs, "TransactionController"));
        assert!(hubs.publish("TransactionController", &[json!("tx:1:finished"), json!({"id": 1})]));

        assert_eq!(local.try_recv().unwrap(), vec![json!("tx:1:finished"), json!({"id": 1})]);
        let events = drain(&mut ui);
        assert_eq!(
            events,
            vec![(
                "emit".to_string(),
                json!({"key": "TransactionController", "args": ["tx:1:finished", {"id": 1}]})
            )]
        );
    }

    #[tokio::test]
    async fn local_publish_survives_closed_channel() {
        let (fwd, ui) = forwarder();
        drop(ui);
        let hubs = HubRegistry::new();
        let hub = EventHub::new("MessageManager");
        hubs.register(hub.clone());
        let (tx, mut local) = tokio::sync::mpsc::unbounded_channel();
        hub.subscribe(Arc::new(move |_: &[Value]| {
            tx.send(()).unwrap();
        }));
        fwd.decorate_hub(&hubs, "MessageManager");

        hubs.publish("MessageManager", &[json!("unapprovedMessage")]);
        assert!(local.try_recv().is_ok());
    }

    #[tokio::test]
    async fn push_helpers_use_fixed_shapes() {
        let (fwd, mut ui) = forwarder();
        fwd.notification("incoming", true);
        fwd.network_changed("Ethereum", json!("0x1"));
        fwd.end_network_change("Bsc", "mainnet");
        fwd.lock();

        let events = drain(&mut ui);
        assert_eq!(events[0], ("notification".into(), json!({"type": "incoming", "needUpdate": true})));
        assert_eq!(events[1], ("network_changed".into(), json!({"type": "Ethereum", "chainId": "0x1"})));
        assert_eq!(events[2], ("end_network_change".into(), json!({"type": "Bsc", "providerType": "mainnet"})));
        assert_eq!(events[3], ("lock".into(), Value::Null));
    }

    #[test]
    fn lock_frames_carry_no_value() {
        assert_eq!(codec::encode(&Message::signal(EventCategory::Unlock)).unwrap(), r#"{"status":"unlock"}"#);
    }
}
