//! In-memory engine and storage.
//!
//! Used by the `worker` command and by the tests. The demo engine is small but
//! exercises every path of the bridge: stateful components with deltas, hubs,
//! single and multi-provider controllers, keyring lock hooks, the cached
//! `addTransaction` result and reverse calls into the UI.

use std::sync::{Arc, RwLock};

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::engine::{
    Engine, EngineFactory, EngineHost, Hook, LockHooks, Provider, ProviderCallback, ProviderListener,
    ProviderSlot, StateChange, StateListener, StatefulComponent,
};
use crate::hub::{EventHub, HubRegistry};
use crate::registry::{MethodRegistry, MethodTable};

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    match lock.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn arg_str(args: &[Value], index: usize, what: &str) -> anyhow::Result<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .with_context(|| format!("argument {index} ({what}) must be a string"))
}

// -----------------------------------------------------------------------------
// Components
// -----------------------------------------------------------------------------

pub struct MemoryComponent {
    state: RwLock<Value>,
    listeners: RwLock<Vec<StateListener>>,
}

impl MemoryComponent {
    pub fn new(initial: Value) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(initial),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Shallow-merge `patch` into the state and notify subscribers.
    pub fn update(&self, patch: Map<String, Value>) {
        let change = {
            let mut state = match self.state.write() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !state.is_object() {
                *state = Value::Object(Map::new());
            }
            let mut changed = Vec::with_capacity(patch.len());
            if let Value::Object(fields) = &mut *state {
                for (key, value) in patch {
                    changed.push(key.clone());
                    fields.insert(key, value);
                }
            }
            StateChange { state: state.clone(), changed }
        };
        for listener in read(&self.listeners) {
            listener(&change);
        }
    }

    pub fn get(&self, key: &str) -> Value {
        read(&self.state).get(key).cloned().unwrap_or(Value::Null)
    }
}

impl StatefulComponent for MemoryComponent {
    fn state(&self) -> Value {
        read(&self.state)
    }

    fn subscribe(&self, listener: StateListener) {
        match self.listeners.write() {
            Ok(mut list) => list.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }
}

// -----------------------------------------------------------------------------
// Providers
// -----------------------------------------------------------------------------

/// JSON-RPC flavoured provider answering a fixed set of requests.
pub struct MemoryProvider {
    chain_id: String,
    listeners: RwLock<Vec<ProviderListener>>,
}

impl MemoryProvider {
    pub fn new(chain_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            chain_id: chain_id.into(),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn emit(&self, event: &str, args: &[Value]) {
        for listener in read(&self.listeners) {
            listener(event, args);
        }
    }

    fn answer(&self, payload: &Value) -> Result<Value, Value> {
        let id = payload.get("id").cloned().unwrap_or(Value::Null);
        let method = payload.get("method").and_then(Value::as_str).unwrap_or_default();
        let result = match method {
            "eth_chainId" => json!(self.chain_id),
            "net_version" => {
                let hex = self.chain_id.trim_start_matches("0x");
                json!(u64::from_str_radix(hex, 16).unwrap_or_default().to_string())
            }
            "eth_subscribe" => {
                let subscription = format!("0x{}", Uuid::new_v4().simple());
                self.emit("data", &[json!({ "subscription": subscription, "result": null })]);
                json!(subscription)
            }
            other => {
                return Err(json!({ "code": -32601, "message": format!("method {other} not supported") }));
            }
        };
        Ok(json!({ "id": id, "jsonrpc": "2.0", "result": result }))
    }
}

impl Provider for MemoryProvider {
    fn send(&self, method: &str, args: Vec<Value>, done: ProviderCallback) {
        if method != "sendAsync" {
            done(Some(json!(format!("unsupported provider call {method}"))), None);
            return;
        }
        match self.answer(args.first().unwrap_or(&Value::Null)) {
            Ok(response) => done(None, Some(response)),
            Err(error) => done(Some(error), None),
        }
    }

    fn subscribe(&self, listener: ProviderListener) {
        match self.listeners.write() {
            Ok(mut list) => list.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }
}

// -----------------------------------------------------------------------------
// Keyring hooks
// -----------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryKeyring {
    lock: RwLock<Vec<Hook>>,
    unlock: RwLock<Vec<Hook>>,
}

impl MemoryKeyring {
    pub fn fire_lock(&self) {
        for hook in read(&self.lock) {
            hook();
        }
    }

    pub fn fire_unlock(&self) {
        for hook in read(&self.unlock) {
            hook();
        }
    }
}

impl LockHooks for MemoryKeyring {
    fn on_lock(&self, hook: Hook) {
        match self.lock.write() {
            Ok(mut list) => list.push(hook),
            Err(poisoned) => poisoned.into_inner().push(hook),
        }
    }

    fn on_unlock(&self, hook: Hook) {
        match self.unlock.write() {
            Ok(mut list) => list.push(hook),
            Err(poisoned) => poisoned.into_inner().push(hook),
        }
    }
}

// -----------------------------------------------------------------------------
// Engine
// -----------------------------------------------------------------------------

pub struct MemoryEngine {
    components: Vec<(String, Arc<MemoryComponent>)>,
    controllers: MethodRegistry,
    methods: MethodTable,
    hubs: Arc<HubRegistry>,
    providers: Vec<ProviderSlot>,
    keyring: Arc<MemoryKeyring>,
}

impl MemoryEngine {
    pub fn component(&self, name: &str) -> Option<Arc<MemoryComponent>> {
        self.components
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, component)| component.clone())
    }
}

impl Engine for MemoryEngine {
    fn components(&self) -> Vec<(String, Arc<dyn StatefulComponent>)> {
        self.components
            .iter()
            .map(|(key, c)| (key.clone(), c.clone() as Arc<dyn StatefulComponent>))
            .collect()
    }

    fn controllers(&self) -> &MethodRegistry {
        &self.controllers
    }

    fn methods(&self) -> &MethodTable {
        &self.methods
    }

    fn hubs(&self) -> &HubRegistry {
        &*self.hubs
    }

    fn provider(&self, controller: &str, kind: Option<&str>) -> Option<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|slot| {
                slot.controller == controller
                    && (slot.kind.is_none() || slot.kind.as_deref() == kind)
            })
            .map(|slot| slot.provider.clone())
    }

    fn providers(&self) -> Vec<ProviderSlot> {
        self.providers.clone()
    }

    fn lock_hooks(&self) -> Option<Arc<dyn LockHooks>> {
        Some(self.keyring.clone())
    }
}

pub const HUB_NAMES: [&str; 4] = [
    "TransactionController",
    "MessageManager",
    "PersonalMessageManager",
    "TypedMessageManager",
];

fn default_state() -> Vec<(&'static str, Value)> {
    vec![
        ("PreferencesController", json!({ "selectedAddress": null, "identities": {} })),
        ("KeyringController", json!({ "isUnlocked": false, "keyrings": [] })),
        ("TransactionController", json!({ "transactions": [] })),
        ("NetworkController", json!({ "provider": { "type": "mainnet", "chainId": "0x1" } })),
    ]
}

/// Builds a [`MemoryEngine`] with the demo wallet components.
///
/// `engine.init` accepts one optional object argument: per-component initial
/// state merged over the defaults, plus `rpcTypes`, the provider types the
/// `RpcNetworkController` should expose.
#[derive(Debug, Clone, Copy, Default)]
pub struct DemoEngineFactory;

impl DemoEngineFactory {
    pub fn build(host: EngineHost, args: &[Value]) -> anyhow::Result<Arc<MemoryEngine>> {
        let overrides = match args.first() {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => bail!("init expects an object, got {other}"),
        };

        let mut components = Vec::new();
        for (name, mut state) in default_state() {
            if let (Some(Value::Object(extra)), Value::Object(base)) = (overrides.get(name), &mut state) {
                base.extend(extra.clone());
            }
            components.push((name.to_owned(), MemoryComponent::new(state)));
        }
        let find = |name: &str| {
            components
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, c)| c.clone())
                .ok_or_else(|| anyhow!("component {name} missing"))
        };
        let preferences = find("PreferencesController")?;
        let keyring_state = find("KeyringController")?;
        let transactions = find("TransactionController")?;
        let network = find("NetworkController")?;

        let hubs = HubRegistry::new();
        for name in HUB_NAMES {
            hubs.register(EventHub::new(name));
        }
        let hubs = Arc::new(hubs);
        let keyring = Arc::new(MemoryKeyring::default());

        let mut providers = vec![ProviderSlot {
            controller: "NetworkController".into(),
            kind: None,
            provider: MemoryProvider::new("0x1"),
        }];
        if let Some(Value::Array(kinds)) = overrides.get("rpcTypes") {
            for kind in kinds.iter().filter_map(Value::as_str) {
                providers.push(ProviderSlot {
                    controller: "RpcNetworkController".into(),
                    kind: Some(kind.to_owned()),
                    provider: MemoryProvider::new("0xa4b1"),
                });
            }
        }

        let controllers = MethodRegistry::new();
        controllers.register("PreferencesController", preferences_methods(preferences));
        controllers.register("KeyringController", keyring_methods(keyring_state, keyring.clone()));
        controllers.register("TransactionController", transaction_methods(transactions, hubs.clone()));
        controllers.register("NetworkController", network_methods(network, host.clone()));

        let snapshot: Vec<_> = components.clone();
        let utility_host = host.clone();
        let agent_host = host;
        let methods = MethodTable::new()
            .with("getState", move |_args| {
                let state: Map<String, Value> = snapshot
                    .iter()
                    .map(|(key, c)| (key.clone(), c.state()))
                    .collect();
                async move { Ok(Value::Object(state)) }
            })
            .with("log", move |args| {
                let utility = utility_host.utility();
                async move { Ok(utility.call("logDebug", args).await) }
            })
            .with("refreshNetwork", move |_args| {
                let host = agent_host.clone();
                async move { Ok(host.call_agent("ApiClient", "useOffchainEndPoint", vec![]).await?) }
            });

        Ok(Arc::new(MemoryEngine {
            components,
            controllers,
            methods,
            hubs,
            providers,
            keyring,
        }))
    }
}

#[async_trait]
impl EngineFactory for DemoEngineFactory {
    async fn create(&self, host: EngineHost, args: Vec<Value>) -> anyhow::Result<Arc<dyn Engine>> {
        let engine: Arc<dyn Engine> = Self::build(host, &args)?;
        Ok(engine)
    }
}

fn patch(key: &str, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_owned(), value);
    map
}

fn preferences_methods(component: Arc<MemoryComponent>) -> MethodTable {
    let state = component.clone();
    MethodTable::new()
        .with("getState", move |_args| {
            let state = state.state();
            async move { Ok(state) }
        })
        .with("setSelectedAddress", move |args| {
            let component = component.clone();
            async move {
                let address = arg_str(&args, 0, "address")?;
                component.update(patch("selectedAddress", json!(address)));
                Ok(Value::Null)
            }
        })
}

fn keyring_methods(component: Arc<MemoryComponent>, keyring: Arc<MemoryKeyring>) -> MethodTable {
    let unlocking = (component.clone(), keyring.clone());
    let state = component.clone();
    MethodTable::new()
        .with("isUnlocked", move |_args| {
            let unlocked = state.get("isUnlocked");
            async move { Ok(unlocked) }
        })
        .with("submitPassword", move |args| {
            let (component, keyring) = unlocking.clone();
            async move {
                let password = arg_str(&args, 0, "password")?;
                if password.is_empty() {
                    bail!("Invalid password");
                }
                component.update(patch("isUnlocked", json!(true)));
                keyring.fire_unlock();
                Ok(component.state())
            }
        })
        .with("setLocked", move |_args| {
            let (component, keyring) = (component.clone(), keyring.clone());
            async move {
                component.update(patch("isUnlocked", json!(false)));
                keyring.fire_lock();
                Ok(Value::Null)
            }
        })
}

fn transaction_methods(component: Arc<MemoryComponent>, hubs: Arc<HubRegistry>) -> MethodTable {
    let listing = component.clone();
    MethodTable::new()
        .with("getTransactions", move |_args| {
            let transactions = listing.get("transactions");
            async move { Ok(transactions) }
        })
        .with("addTransaction", move |args| {
            let (component, hubs) = (component.clone(), hubs.clone());
            async move {
                let params = args.into_iter().next().unwrap_or(Value::Null);
                if !params.is_object() {
                    bail!("transaction parameters must be an object");
                }
                let id = Uuid::new_v4().to_string();
                let meta = json!({ "id": id, "status": "unapproved", "txParams": params });

                let mut transactions = match component.get("transactions") {
                    Value::Array(list) => list,
                    _ => Vec::new(),
                };
                transactions.push(meta.clone());
                component.update(patch("transactions", Value::Array(transactions)));
                hubs.publish("TransactionController", &[json!(format!("{id}:unapproved")), meta.clone()]);

                let hash = format!("0x{}", Uuid::new_v4().simple());
                Ok(json!({ "result": hash, "transactionMeta": meta }))
            }
        })
}

fn chain_id_of(provider_type: &str) -> Option<&'static str> {
    match provider_type {
        "mainnet" => Some("0x1"),
        "goerli" => Some("0x5"),
        "sepolia" => Some("0xaa36a7"),
        _ => None,
    }
}

fn network_methods(component: Arc<MemoryComponent>, host: EngineHost) -> MethodTable {
    let config = component.clone();
    MethodTable::new()
        .with("getProviderConfig", move |_args| {
            let provider = config.get("provider");
            async move { Ok(provider) }
        })
        .with("setProviderType", move |args| {
            let (component, host) = (component.clone(), host.clone());
            async move {
                let provider_type = arg_str(&args, 0, "provider type")?;
                let chain_id = chain_id_of(&provider_type)
                    .ok_or_else(|| anyhow!("unknown provider type {provider_type}"))?;
                component.update(patch("provider", json!({ "type": provider_type, "chainId": chain_id })));
                host.forwarder().network_changed("Ethereum", json!(chain_id));
                host.forwarder().end_network_change("Ethereum", &provider_type);
                Ok(Value::Null)
            }
        })
}

// -----------------------------------------------------------------------------
// Storage
// -----------------------------------------------------------------------------

/// Key/value storage behind the `sqlite` group.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: DashMap<String, Value>,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn table(self: &Arc<Self>) -> MethodTable {
        let (get, set, remove, keys) = (self.clone(), self.clone(), self.clone(), self.clone());
        MethodTable::new()
            .with("getItem", move |args| {
                let found = arg_str(&args, 0, "key")
                    .map(|key| get.items.get(&key).map(|v| v.clone()).unwrap_or(Value::Null));
                async move { found }
            })
            .with("setItem", move |args| {
                let stored = arg_str(&args, 0, "key").map(|key| {
                    debug!(%key, "storage set");
                    set.items.insert(key, args.get(1).cloned().unwrap_or(Value::Null));
                    Value::Null
                });
                async move { stored }
            })
            .with("removeItem", move |args| {
                let removed = arg_str(&args, 0, "key").map(|key| json!(remove.items.remove(&key).is_some()));
                async move { removed }
            })
            .with("getAllKeys", move |_args| {
                let mut all: Vec<String> = keys.items.iter().map(|e| e.key().clone()).collect();
                all.sort();
                async move { Ok(json!(all)) }
            })
    }
}
