use std::sync::Arc;

use bridge_protocol::transport::{self, Endpoint};
use bridge_protocol::{Bus, CallHandler};
use tokio::task::JoinHandle;
use tracing::info;

use crate::agents::AgentRegistry;
use crate::config::BridgeConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::EngineFactory;
use crate::forwarder::Forwarder;
use crate::memory::{DemoEngineFactory, MemoryStorage};
use crate::registry::MethodTable;

/// The worker context: bus, dispatcher and reverse agents for one channel.
#[derive(Clone, Debug)]
pub struct Worker {
    bus: Bus,
    dispatcher: Arc<Dispatcher>,
    agents: Arc<AgentRegistry>,
}

impl Worker {
    pub fn new(
        sender: transport::FrameSender,
        config: &BridgeConfig,
        factory: Arc<dyn EngineFactory>,
        storage: MethodTable,
    ) -> Self {
        let bus = Bus::new(sender, config.bus_config("worker"));
        let agents = Arc::new(AgentRegistry::new(bus.clone(), config.utility_agent.clone()));
        let dispatcher = Arc::new(Dispatcher::new(bus.clone(), factory, storage, agents.clone()));
        Self { bus, dispatcher, agents }
    }

    /// Build a worker on `endpoint` and start its receive loop.
    pub fn spawn(
        endpoint: Endpoint,
        config: &BridgeConfig,
        factory: Arc<dyn EngineFactory>,
        storage: MethodTable,
    ) -> (Self, JoinHandle<()>) {
        let worker = Self::new(endpoint.sender, config, factory, storage);
        let bus = worker.bus.clone();
        let handler: Arc<dyn CallHandler> = worker.dispatcher.clone();
        let task = tokio::spawn(async move { bus.serve(endpoint.receiver, handler).await });
        (worker, task)
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn forwarder(&self) -> &Forwarder {
        self.dispatcher.forwarder()
    }
}

/// Worker process entry: demo engine over stdin/stdout until the UI hangs up.
pub async fn run_stdio(config: &BridgeConfig) -> anyhow::Result<()> {
    let storage = MemoryStorage::new().table();
    let (_worker, task) = Worker::spawn(transport::stdio(), config, Arc::new(DemoEngineFactory), storage);
    info!("worker listening on stdio");
    task.await?;
    info!("worker stopped");
    Ok(())
}
