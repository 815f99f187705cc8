use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf, time::Duration};
use tracing::{info, warn};

use bridge_protocol::BusConfig;

use crate::agents::DEFAULT_UTILITY_AGENT;
use crate::logger::{LogConfig, LogLevel};

pub const CALL_TIMEOUT_KEY: &str = "BRIDGE_CALL_TIMEOUT_MS";
pub const UTILITY_AGENT_KEY: &str = "BRIDGE_UTILITY_AGENT";
pub const LOG_LEVEL_KEY: &str = "BRIDGE_LOG_LEVEL";
pub const LOG_DIR_KEY: &str = "BRIDGE_LOG_DIR";

/// Read-only source of configuration values.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Outcome of seeding the environment from an env file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvFileStatus {
    Missing,
    Loaded,
    Failed(String),
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
    status: EnvFileStatus,
}

impl EnvConfigManager {
    /// Load `env_file` if it exists. Nothing is logged here since tracing is
    /// usually not installed yet; call [`report`](Self::report) afterwards.
    pub fn new(env_file: PathBuf) -> Box<Self> {
        let status = if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => EnvFileStatus::Loaded,
                Err(e) => EnvFileStatus::Failed(e.to_string()),
            }
        } else {
            EnvFileStatus::Missing
        };
        Box::new(Self { env_file, status })
    }

    pub fn status(&self) -> &EnvFileStatus {
        &self.status
    }

    pub fn report(&self) {
        match &self.status {
            EnvFileStatus::Loaded => info!("loaded {}", self.env_file.display()),
            EnvFileStatus::Failed(e) => warn!("could not load {}: {e}", self.env_file.display()),
            EnvFileStatus::Missing => {}
        }
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// Fixed key/value pairs, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with(self: Box<Self>, key: impl Into<String>, value: impl Into<String>) -> Box<Self> {
        self.map.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Runtime settings of either side of the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BridgeConfig {
    /// Off unless set; an unanswered call then waits forever.
    pub call_timeout_ms: Option<u64>,
    /// Registered agent installed as the engine's utility facility.
    pub utility_agent: String,
    pub log_level: LogLevel,
    pub log_dir: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: None,
            utility_agent: DEFAULT_UTILITY_AGENT.to_owned(),
            log_level: LogLevel::Info,
            log_dir: None,
        }
    }
}

impl BridgeConfig {
    /// Read every known key; unset keys keep their defaults, unparsable ones
    /// are an error.
    pub async fn load(config: &ConfigManager) -> anyhow::Result<Self> {
        let mut out = Self::default();
        if let Some(raw) = config.get(CALL_TIMEOUT_KEY).await {
            let ms: u64 = raw
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("{CALL_TIMEOUT_KEY}={raw}: {e}"))?;
            // 0 means "no timeout"
            out.call_timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(agent) = config.get(UTILITY_AGENT_KEY).await {
            out.utility_agent = agent;
        }
        if let Some(raw) = config.get(LOG_LEVEL_KEY).await {
            out.log_level = raw
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("{LOG_LEVEL_KEY}={raw}: {e}"))?;
        }
        if let Some(dir) = config.get(LOG_DIR_KEY).await {
            out.log_dir = Some(PathBuf::from(dir));
        }
        Ok(out)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn bus_config(&self, label: &str) -> BusConfig {
        BusConfig::new(label).with_call_timeout(self.call_timeout())
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig::new(self.log_level, self.log_dir.clone())
    }
}
