//! UI context host.
//!
//! [`UiContext::connect`] owns the UI end of the channel: it answers
//! `call_register` reverse calls from its [`ClassRegistry`], announces that
//! registry to the worker with `register_cls`, and keeps local mirrors of what
//! the worker pushes (component state, hub publishes, provider events and the
//! keyring lock flag).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::bail;
use async_trait::async_trait;
use bridge_protocol::bus::ROUTE_NOT_FOUND;
use bridge_protocol::transport::Endpoint;
use bridge_protocol::{
    AgentDescriptor, Bus, BusConfig, BusError, CallHandler, EventCategory, HandlerGroup, Request,
};
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::dispatcher::INIT_METHOD;
use crate::hub::HubRegistry;
use crate::registry::{Lookup, MethodRegistry, MethodTable};

/// Classes the UI exposes to the worker.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: MethodRegistry,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(self, name: impl Into<String>, methods: MethodTable) -> Self {
        self.classes.register(name, methods);
        self
    }

    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        self.classes
            .targets()
            .into_iter()
            .map(|name| {
                let methods = self.classes.methods_of(&name).unwrap_or_default();
                AgentDescriptor::new(name, methods)
            })
            .collect()
    }
}

#[async_trait]
impl CallHandler for ClassRegistry {
    async fn handle(&self, target: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        if target != HandlerGroup::CallRegister.as_ref() {
            bail!(ROUTE_NOT_FOUND);
        }
        let Request::CallRegister { agent, method, args } = Request::parse(target, args)? else {
            bail!(ROUTE_NOT_FOUND);
        };
        match self.classes.lookup(&agent, &method) {
            Lookup::Found(call) => call(args).await,
            Lookup::MissingTarget => Err(BusError::UnknownAgent(agent).into()),
            Lookup::MissingMethod => Err(BusError::UnknownMethod { agent, method }.into()),
        }
    }
}

/// Cached component state, fed by `state` events.
#[derive(Debug, Default)]
pub struct StateMirror {
    components: DashMap<String, Value>,
}

impl StateMirror {
    /// Apply one `state` payload: `overwrite` replaces, otherwise the
    /// top-level keys are merged into the cached object.
    pub fn apply(&self, update: &Value) -> bool {
        let Some(key) = update.get("key").and_then(Value::as_str) else {
            debug!(%update, "state event without key");
            return false;
        };
        let state = update.get("state").cloned().unwrap_or(Value::Null);
        let overwrite = update.get("overwrite").and_then(Value::as_bool).unwrap_or(false);

        let mut entry = self.components.entry(key.to_owned()).or_insert(Value::Null);
        match (overwrite, entry.value_mut(), state) {
            (false, Value::Object(current), Value::Object(delta)) => {
                for (k, v) in delta {
                    current.insert(k, v);
                }
            }
            (_, slot, state) => *slot = state,
        }
        true
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.components.get(key).map(|v| v.clone())
    }

    pub fn snapshot(&self) -> Value {
        let all: Map<String, Value> = self
            .components
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        Value::Object(all)
    }
}

/// Local hub name for a provider mirrored from the worker.
pub fn provider_hub_name(controller: &str, kind: Option<&str>) -> String {
    match kind {
        Some(kind) => format!("{controller}/{kind}"),
        None => controller.to_owned(),
    }
}

fn republish(hubs: &HubRegistry, name: &str, payload: &Value) {
    let args = match payload.get("args") {
        Some(Value::Array(args)) => args.as_slice(),
        _ => &[],
    };
    hubs.get_or_create(name).publish(args);
}

#[derive(Clone, Debug)]
pub struct UiContext {
    bus: Bus,
    state: Arc<StateMirror>,
    hubs: Arc<HubRegistry>,
    providers: Arc<HubRegistry>,
    locked: Arc<AtomicBool>,
}

impl UiContext {
    /// Attach to `endpoint`, start answering reverse calls and register
    /// `classes` with the worker. Returns once the worker has built its stubs.
    pub async fn connect(
        endpoint: Endpoint,
        classes: ClassRegistry,
        config: BusConfig,
    ) -> Result<(Self, JoinHandle<()>), BusError> {
        let ui = Self {
            bus: Bus::new(endpoint.sender, config),
            state: Arc::new(StateMirror::default()),
            hubs: Arc::new(HubRegistry::new()),
            providers: Arc::new(HubRegistry::new()),
            locked: Arc::new(AtomicBool::new(false)),
        };
        ui.install_mirrors();

        let descriptors = classes.descriptors();
        let handler: Arc<dyn CallHandler> = Arc::new(classes);
        let bus = ui.bus.clone();
        let task = tokio::spawn(async move { bus.serve(endpoint.receiver, handler).await });

        let count = descriptors.len();
        ui.bus.call(Request::RegisterCls { descriptors }).await?;
        info!(classes = count, "ui classes registered with worker");
        Ok((ui, task))
    }

    fn install_mirrors(&self) {
        let state = self.state.clone();
        self.bus.add_listener(EventCategory::State.as_ref(), move |update: &Value| {
            state.apply(update);
        });

        let hubs = self.hubs.clone();
        self.bus.add_listener(EventCategory::Emit.as_ref(), move |payload: &Value| {
            if let Some(key) = payload.get("key").and_then(Value::as_str) {
                republish(&hubs, key, payload);
            }
        });

        let providers = self.providers.clone();
        self.bus.add_listener(EventCategory::ProviderEmit.as_ref(), move |payload: &Value| {
            if let Some(key) = payload.get("key").and_then(Value::as_str) {
                let kind = payload.get("type").and_then(Value::as_str);
                republish(&providers, &provider_hub_name(key, kind), payload);
            }
        });

        let locked = self.locked.clone();
        self.bus.add_listener(EventCategory::Lock.as_ref(), move |_: &Value| {
            locked.store(true, Ordering::SeqCst);
        });
        let locked = self.locked.clone();
        self.bus.add_listener(EventCategory::Unlock.as_ref(), move |_: &Value| {
            locked.store(false, Ordering::SeqCst);
        });
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn state(&self) -> &StateMirror {
        &self.state
    }

    pub fn hubs(&self) -> &HubRegistry {
        &self.hubs
    }

    pub fn providers(&self) -> &HubRegistry {
        &self.providers
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub async fn init_engine(&self, args: Vec<Value>) -> Result<Value, BusError> {
        self.call_engine(INIT_METHOD, args).await
    }

    pub async fn call_engine(&self, method: &str, args: Vec<Value>) -> Result<Value, BusError> {
        self.bus
            .call(Request::Engine { method: method.to_owned(), args })
            .await
    }

    pub async fn call_controller(
        &self,
        component: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, BusError> {
        self.bus
            .call(Request::Controller {
                component: component.to_owned(),
                method: method.to_owned(),
                args,
            })
            .await
    }

    pub async fn call_sqlite(&self, method: &str, args: Vec<Value>) -> Result<Value, BusError> {
        self.bus
            .call(Request::Sqlite { method: method.to_owned(), args })
            .await
    }

    pub async fn call_agent_provider(
        &self,
        controller: &str,
        provider: Option<&str>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, BusError> {
        self.bus
            .call(Request::AgentProvider {
                controller: controller.to_owned(),
                provider: provider.map(str::to_owned),
                method: method.to_owned(),
                args,
            })
            .await
    }

    pub async fn call_transaction_result(&self, id: &str) -> Result<Value, BusError> {
        self.bus
            .call(Request::TransactionResult { key: id.to_owned() })
            .await
    }
}
