use std::path::Path;

use config::{Config, File};
use serde::Deserialize;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::SmqError;

const ENV_PREFIX: &str = "smq";
const DEFAULT_LOG_FILTER: &str = "smq=debug";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmqConfig {
    pub redis: RedisConfig,
    pub namespace: String,
    pub messages: MessagesConfig,
    pub logger: LoggerConfig,
}

impl Default for SmqConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            namespace: crate::DEFAULT_NAMESPACE.into(),
            messages: MessagesConfig::default(),
            logger: LoggerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagesConfig {
    pub store: MessageStoreConfig,
}

/// Archiving of messages that reached a terminal state.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessageStoreConfig {
    pub acknowledged: StoreConfig,
    pub dead_lettered: StoreConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Keep the record instead of deleting it
    pub enabled: bool,
    /// Maximum archived ids per queue, 0 = unbounded
    pub queue_size: u64,
    /// Archived records expire after this many milliseconds, 0 = never
    pub expire_ms: u64,
}

impl StoreConfig {
    pub fn enabled(queue_size: u64, expire_ms: u64) -> Self {
        Self {
            enabled: true,
            queue_size,
            expire_ms,
        }
    }

    pub(crate) fn flag(&self) -> &'static str {
        if self.enabled { "1" } else { "0" }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub format: LogFormat,
}

impl SmqConfig {
    /// Defaults, then the optional file at `path`, then `SMQ__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, SmqError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(logger: &LoggerConfig) -> Result<(), SmqError> {
    let subscriber = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
    );

    let result = match logger.format {
        LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => subscriber.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    result.map_err(|e| SmqError::runtime(format!("failed to install tracing subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_apply_without_sources() {
        let config = SmqConfig::load(None).unwrap();
        assert_eq!(config.namespace, crate::DEFAULT_NAMESPACE);
        assert_eq!(config.logger.format, LogFormat::Pretty);
        assert!(!config.messages.store.acknowledged.enabled);
        assert_eq!(config.messages.store.dead_lettered, StoreConfig::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let path = std::env::temp_dir().join(format!("smq-config-{}.yaml", nanoid::nanoid!(8)));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "namespace: billing\nmessages:\n  store:\n    dead_lettered:\n      enabled: true\n      queue_size: 500\nlogger:\n  format: json"
        )
        .unwrap();

        let config = SmqConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.namespace, "billing");
        assert_eq!(config.logger.format, LogFormat::Json);
        assert_eq!(
            config.messages.store.dead_lettered,
            StoreConfig {
                enabled: true,
                queue_size: 500,
                expire_ms: 0
            }
        );
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379/");
    }
}
