use std::path::PathBuf;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub const LOG_FILE_PREFIX: &str = "workerbridge.log";

/// What log levels are supported?
/// Higher-value variants are more severe.
#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
    Default, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// `EnvFilter` directive for this level. `critical` has no tracing
    /// counterpart and filters like `error`.
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct LogConfig {
    pub log_level: LogLevel,
    /// Daily rolling JSON log files go here. Without it logs go to stderr.
    pub log_dir: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(log_level: LogLevel, log_dir: Option<PathBuf>) -> Self {
        Self { log_level, log_dir }
    }

    /// `RUST_LOG` wins over the configured level.
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.log_level.directive()))
    }
}

/// Install the global subscriber.
///
/// Nothing is ever written to stdout: in the worker process stdout carries
/// the frame channel.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<()> {
    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("could not create log dir {}", dir.display()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .build(dir)
                .context("could not open rolling log file")?;
            Some(fmt::layer().json().with_writer(appender).with_ansi(false))
        }
        None => None,
    };
    let stderr_layer = match config.log_dir {
        Some(_) => None,
        None => Some(fmt::layer().with_writer(std::io::stderr).with_target(true)),
    };

    Registry::default()
        .with(config.filter())
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("tracing subscriber already installed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("critical".parse::<LogLevel>().unwrap(), LogLevel::Critical);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Debug.to_string(), "debug");
    }

    #[test]
    fn critical_filters_like_error() {
        assert_eq!(LogLevel::Critical.directive(), "error");
        assert!(LogLevel::Critical > LogLevel::Error);
    }

    #[test]
    fn level_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&LogLevel::Trace).unwrap(), r#""trace""#);
        assert_eq!(LogConfig::default().log_level, LogLevel::Info);
    }

    #[test]
    fn configs_dedupe_in_a_set() {
        let mut seen = std::collections::HashSet::new();
        assert!(seen.insert(LogConfig::new(LogLevel::Warn, None)));
        assert!(!seen.insert(LogConfig::new(LogLevel::Warn, None)));
        assert!(seen.insert(LogConfig::new(LogLevel::Warn, Some(PathBuf::from("logs")))));
    }
}
