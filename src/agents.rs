//! Reverse Agent Registry.
//!
//! The UI context announces its callable classes with one `register_cls`
//! call. Each descriptor becomes an [`Agent`]: a local stub whose methods
//! issue `call_register` calls back across the channel.

use std::sync::{Arc, RwLock};

use bridge_protocol::{AgentDescriptor, Bus, BusError, Request};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{info, warn};

pub const DEFAULT_UTILITY_AGENT: &str = "TsUtils";

#[derive(Clone, Debug)]
pub struct Agent {
    name: String,
    methods: Arc<Vec<String>>,
    bus: Bus,
}

impl Agent {
    fn new(descriptor: AgentDescriptor, bus: Bus) -> Self {
        Self {
            name: descriptor.name,
            methods: Arc::new(descriptor.methods),
            bus,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, BusError> {
        if !self.has_method(method) {
            return Err(BusError::UnknownMethod {
                agent: self.name.clone(),
                method: method.to_owned(),
            });
        }
        self.bus
            .call(Request::CallRegister {
                agent: self.name.clone(),
                method: method.to_owned(),
                args,
            })
            .await
    }
}

pub struct AgentRegistry {
    bus: Bus,
    agents: DashMap<String, Agent>,
    utility_agent: String,
    utility: Arc<UtilityProxy>,
}

impl AgentRegistry {
    pub fn new(bus: Bus, utility_agent: impl Into<String>) -> Self {
        Self {
            bus,
            agents: DashMap::new(),
            utility_agent: utility_agent.into(),
            utility: Arc::new(UtilityProxy::default()),
        }
    }

    /// Build stubs for `descriptors`. A name registered again replaces its
    /// previous stub, which is what a restarted UI context needs.
    pub fn register(&self, descriptors: Vec<AgentDescriptor>) -> usize {
        let count = descriptors.len();
        for descriptor in descriptors {
            let agent = Agent::new(descriptor, self.bus.clone());
            if agent.name == self.utility_agent {
                self.utility.install(agent.clone());
            }
            info!(agent = %agent.name, methods = agent.methods.len(), "agent registered");
            self.agents.insert(agent.name.clone(), agent);
        }
        count
    }

    pub fn get(&self, name: &str) -> Option<Agent> {
        self.agents.get(name).map(|a| a.clone())
    }

    pub async fn call(&self, agent: &str, method: &str, args: Vec<Value>) -> Result<Value, BusError> {
        let agent = self
            .get(agent)
            .ok_or_else(|| BusError::UnknownAgent(agent.to_owned()))?;
        agent.call(method, args).await
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn utility(&self) -> Arc<UtilityProxy> {
        self.utility.clone()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names())
            .field("utility_agent", &self.utility_agent)
            .finish()
    }
}

/// Utility facility used by engine internals (debug logging and the like).
/// Once the UI registers the utility agent, calls go to the UI; until then
/// they are logged locally.
#[derive(Debug, Default)]
pub struct UtilityProxy {
    agent: RwLock<Option<Agent>>,
}

impl UtilityProxy {
    pub fn install(&self, agent: Agent) {
        match self.agent.write() {
            Ok(mut slot) => *slot = Some(agent),
            Err(poisoned) => *poisoned.into_inner() = Some(agent),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.current().is_some()
    }

    fn current(&self) -> Option<Agent> {
        match self.agent.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Never fails: a remote failure is logged and reported as `null`.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Value {
        let Some(agent) = self.current() else {
            let args = Value::Array(args);
            info!(target: "utility", %method, %args, "utility call (no agent)");
            return Value::Null;
        };
        match agent.call(method, args).await {
            Ok(value) => value,
            Err(err) => {
                warn!(agent = %agent.name(), %method, error = %err, "utility call failed");
                Value::Null
            }
        }
    }
}
