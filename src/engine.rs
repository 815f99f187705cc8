//! What the worker needs from the engine it hosts.
//!
//! The engine itself (key custody, network clients, transaction pipeline) is
//! supplied from outside. The bridge only sees it through these traits: named
//! stateful components, callable method tables, event hubs, network providers
//! and the keyring's lock hooks.

use std::sync::Arc;

use async_trait::async_trait;
use bridge_protocol::{Bus, BusError};
use serde_json::Value;

use crate::agents::{AgentRegistry, UtilityProxy};
use crate::forwarder::Forwarder;
use crate::hub::HubRegistry;
use crate::registry::{MethodRegistry, MethodTable};

/// A state transition: the full state after the change and the top-level keys
/// that changed. An empty `changed` list means "treat it as a full update".
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub state: Value,
    pub changed: Vec<String>,
}

impl StateChange {
    /// The part of the state the receiver has to merge.
    pub fn delta(&self) -> Value {
        match &self.state {
            Value::Object(full) if !self.changed.is_empty() => Value::Object(
                self.changed
                    .iter()
                    .filter_map(|key| full.get(key).map(|v| (key.clone(), v.clone())))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

pub type StateListener = Arc<dyn Fn(&StateChange) + Send + Sync>;

pub trait StatefulComponent: Send + Sync {
    fn state(&self) -> Value;
    fn subscribe(&self, listener: StateListener);
}

/// Completion callback in `(error, result)` form.
pub type ProviderCallback = Box<dyn FnOnce(Option<Value>, Option<Value>) + Send>;

/// Provider events: event name plus its arguments.
pub type ProviderListener = Arc<dyn Fn(&str, &[Value]) + Send + Sync>;

/// A network-style provider nested under a controller.
pub trait Provider: Send + Sync {
    fn send(&self, method: &str, args: Vec<Value>, done: ProviderCallback);
    fn subscribe(&self, listener: ProviderListener);
}

#[derive(Clone)]
pub struct ProviderSlot {
    pub controller: String,
    /// Set for multi-provider controllers, where providers are keyed by type.
    pub kind: Option<String>,
    pub provider: Arc<dyn Provider>,
}

pub type Hook = Arc<dyn Fn() + Send + Sync>;

pub trait LockHooks: Send + Sync {
    fn on_lock(&self, hook: Hook);
    fn on_unlock(&self, hook: Hook);
}

pub trait Engine: Send + Sync + 'static {
    /// Components whose state is mirrored to the UI, keyed by name.
    fn components(&self) -> Vec<(String, Arc<dyn StatefulComponent>)>;

    /// Methods reachable through the `controller` group.
    fn controllers(&self) -> &MethodRegistry;

    /// Methods reachable through the `engine` group.
    fn methods(&self) -> &MethodTable;

    fn hubs(&self) -> &HubRegistry;

    /// Hubs whose publishes are forwarded to the UI. Defaults to every hub.
    fn forwarded_hubs(&self) -> Vec<String> {
        self.hubs().names()
    }

    fn provider(&self, controller: &str, kind: Option<&str>) -> Option<Arc<dyn Provider>>;

    fn providers(&self) -> Vec<ProviderSlot>;

    fn lock_hooks(&self) -> Option<Arc<dyn LockHooks>>;
}

/// Builds the engine on the first `engine.init` call.
#[async_trait]
pub trait EngineFactory: Send + Sync + 'static {
    async fn create(&self, host: EngineHost, args: Vec<Value>) -> anyhow::Result<Arc<dyn Engine>>;
}

/// The worker's services as seen from engine code.
#[derive(Clone)]
pub struct EngineHost {
    bus: Bus,
    agents: Arc<AgentRegistry>,
    forwarder: Forwarder,
}

impl EngineHost {
    pub fn new(bus: Bus, agents: Arc<AgentRegistry>, forwarder: Forwarder) -> Self {
        Self { bus, agents, forwarder }
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn utility(&self) -> Arc<UtilityProxy> {
        self.agents.utility()
    }

    /// Reverse call into a UI-registered class.
    pub async fn call_agent(&self, agent: &str, method: &str, args: Vec<Value>) -> Result<Value, BusError> {
        self.agents.call(agent, method, args).await
    }

    /// Raw call to any handler group on the UI side.
    pub async fn post_async(&self, target: &str, args: Vec<Value>) -> Result<Value, BusError> {
        self.bus.post_async(target, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delta_keeps_only_changed_keys() {
        let change = StateChange {
            state: json!({"selectedAddress": "0x2", "identities": {"0x2": {}}, "lostIdentities": {}}),
            changed: vec!["selectedAddress".into(), "gone".into()],
        };
        assert_eq!(change.delta(), json!({"selectedAddress": "0x2"}));
    }

    #[test]
    fn delta_without_changed_keys_is_the_full_state() {
        let change = StateChange { state: json!({"a": 1}), changed: vec![] };
        assert_eq!(change.delta(), json!({"a": 1}));
        let scalar = StateChange { state: json!(5), changed: vec!["a".into()] };
        assert_eq!(scalar.delta(), json!(5));
    }
}
