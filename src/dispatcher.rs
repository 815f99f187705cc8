//! Request Dispatcher: the worker side's [`CallHandler`].
//!
//! Every incoming `call` is parsed into a [`Request`] and routed to its
//! handler group. Handler failures become `error` replies (the bus does the
//! conversion); a missing component or method is not a failure, it answers
//! `null`.

use std::sync::{Arc, OnceLock};

use anyhow::bail;
use async_trait::async_trait;
use bridge_protocol::bus::ROUTE_NOT_FOUND;
use bridge_protocol::{AgentDescriptor, Bus, BusError, CallHandler, Request};
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::{Mutex, oneshot};
use tracing::{info, warn};

use crate::agents::AgentRegistry;
use crate::engine::{Engine, EngineFactory, EngineHost};
use crate::forwarder::Forwarder;
use crate::registry::{Lookup, MethodTable};

pub const INIT_METHOD: &str = "init";
pub const ENGINE_NOT_INIT: &str = "engine not init";
pub const NOT_FOUND_PROVIDER: &str = "Not found provider!";
pub const NOT_FOUND_TRANSACTION_RESULT: &str = "not found transaction result!";

const TRANSACTION_CONTROLLER: &str = "TransactionController";
const ADD_TRANSACTION: &str = "addTransaction";

pub struct Dispatcher {
    bus: Bus,
    factory: Arc<dyn EngineFactory>,
    storage: MethodTable,
    agents: Arc<AgentRegistry>,
    forwarder: Forwarder,
    engine: OnceLock<Arc<dyn Engine>>,
    init_lock: Mutex<()>,
    transactions: DashMap<String, Value>,
}

impl Dispatcher {
    pub fn new(
        bus: Bus,
        factory: Arc<dyn EngineFactory>,
        storage: MethodTable,
        agents: Arc<AgentRegistry>,
    ) -> Self {
        Self {
            forwarder: Forwarder::new(bus.clone()),
            bus,
            factory,
            storage,
            agents,
            engine: OnceLock::new(),
            init_lock: Mutex::new(()),
            transactions: DashMap::new(),
        }
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    pub fn engine(&self) -> Option<&Arc<dyn Engine>> {
        self.engine.get()
    }

    pub async fn dispatch(&self, request: Request) -> anyhow::Result<Value> {
        match request {
            Request::Controller { component, method, args } => {
                self.controller(&component, &method, args).await
            }
            Request::Engine { method, args } => self.engine_call(&method, args).await,
            Request::Sqlite { method, args } => self.sqlite(&method, args).await,
            Request::AgentProvider { controller, provider, method, args } => {
                self.agent_provider(&controller, provider.as_deref(), &method, args).await
            }
            Request::TransactionResult { key } => self.transaction_result(&key),
            Request::RegisterCls { descriptors } => Ok(self.register_cls(descriptors)),
            // reverse calls are answered by the UI side only
            Request::CallRegister { .. } => bail!(ROUTE_NOT_FOUND),
        }
    }

    async fn controller(&self, component: &str, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let Some(engine) = self.engine() else {
            return Ok(json!(ENGINE_NOT_INIT));
        };
        let target = match engine.controllers().lookup(component, method) {
            Lookup::Found(target) => target,
            Lookup::MissingTarget => {
                warn!(%component, %method, "no such component");
                return Ok(Value::Null);
            }
            Lookup::MissingMethod => {
                warn!(%component, %method, "component has no such method");
                return Ok(Value::Null);
            }
        };

        let value = target(args).await?;
        if component == TRANSACTION_CONTROLLER && method == ADD_TRANSACTION {
            self.remember_transaction(&value);
        }
        Ok(value)
    }

    /// Cache `result` under `transactionMeta.id` for `transaction_result`.
    fn remember_transaction(&self, value: &Value) {
        let result = value.get("result").filter(|r| !r.is_null());
        let id = match value.pointer("/transactionMeta/id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };
        if let (Some(result), Some(id)) = (result, id) {
            self.transactions.insert(id, result.clone());
        }
    }

    fn transaction_result(&self, key: &str) -> anyhow::Result<Value> {
        match self.transactions.get(key) {
            Some(result) => Ok(result.clone()),
            None => bail!(NOT_FOUND_TRANSACTION_RESULT),
        }
    }

    async fn engine_call(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        if method == INIT_METHOD {
            return self.init(args).await;
        }
        let Some(engine) = self.engine() else {
            return Ok(json!(ENGINE_NOT_INIT));
        };
        match engine.methods().invoke(method, args).await {
            Some(result) => result,
            None => {
                warn!(%method, "engine has no such method");
                Ok(Value::Null)
            }
        }
    }

    async fn init(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        let _guard = self.init_lock.lock().await;
        if self.engine.get().is_some() {
            info!("engine already initialised, ignoring init");
            return Ok(Value::Null);
        }

        let host = EngineHost::new(self.bus.clone(), self.agents.clone(), self.forwarder.clone());
        let engine = self.factory.create(host, args).await?;

        let components = engine.components();
        for (key, component) in &components {
            self.forwarder.attach_component(key, component.clone());
        }
        for name in engine.forwarded_hubs() {
            if !self.forwarder.decorate_hub(engine.hubs(), &name) {
                warn!(hub = %name, "no hub to forward");
            }
        }
        for slot in engine.providers() {
            self.forwarder.attach_provider(&slot);
        }
        if let Some(hooks) = engine.lock_hooks() {
            self.forwarder.attach_lock_hooks(hooks.as_ref());
        }

        info!(components = components.len(), "engine initialised");
        let _ = self.engine.set(engine);
        Ok(Value::Null)
    }

    async fn sqlite(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        match self.storage.invoke(method, args).await {
            Some(result) => result,
            None => {
                warn!(%method, "storage has no such method");
                Ok(Value::Null)
            }
        }
    }

    async fn agent_provider(
        &self,
        controller: &str,
        kind: Option<&str>,
        method: &str,
        args: Vec<Value>,
    ) -> anyhow::Result<Value> {
        let provider = self.engine().and_then(|engine| engine.provider(controller, kind));
        let Some(provider) = provider else {
            warn!(%controller, kind = ?kind, "no provider");
            return Ok(json!({ "error": NOT_FOUND_PROVIDER }));
        };

        let (tx, rx) = oneshot::channel();
        provider.send(
            method,
            args,
            Box::new(move |error: Option<Value>, result: Option<Value>| {
                let _ = tx.send((error, result));
            }),
        );
        match rx.await {
            Ok((error, result)) => Ok(json!({ "error": error, "resultObj": result })),
            Err(_) => bail!("provider dropped its completion callback"),
        }
    }

    fn register_cls(&self, descriptors: Vec<AgentDescriptor>) -> Value {
        self.agents.register(descriptors);
        Value::Null
    }
}

#[async_trait]
impl CallHandler for Dispatcher {
    async fn handle(&self, target: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let request = match Request::parse(target, args) {
            Ok(request) => request,
            Err(BusError::UnknownRoute(route)) => {
                warn!(%route, "unknown handler group");
                bail!(ROUTE_NOT_FOUND);
            }
            Err(err) => return Err(err.into()),
        };
        self.dispatch(request).await
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("initialised", &self.engine.get().is_some())
            .field("storage", &self.storage)
            .field("cached_transactions", &self.transactions.len())
            .finish()
    }
}
