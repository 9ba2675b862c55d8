//! Message bus configuration.
//!
//! Configuration is a flat set of recognized options resolvable from three
//! sources, in the order applications usually want them: explicit
//! construction, a JSON file ([`MessageBusConfig::from_file`]), or process
//! environment ([`MessageBusConfig::from_env`]). Unrecognized file keys
//! and env vars are ignored for forward compatibility; malformed values
//! and missing required options fail fast at construction, never on
//! first use.

use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which broker implementation the factory constructs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    /// In-process pub/sub; no external dependencies.
    #[default]
    Memory,
    /// Redis-backed pub/sub; requires `host`.
    Networked,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required option for networked broker: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBusConfig {
    #[serde(default)]
    pub broker_type: BrokerType,

    /// Broker endpoint host; required when `broker_type` is networked.
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,

    #[serde(default = "default_buffer_size")]
    pub consumer_buffer_size: usize,

    #[serde(default = "default_max_retries")]
    pub consumer_max_retries: u32,

    #[serde(
        default = "default_retry_delay",
        rename = "consumer_retry_delay_ms",
        with = "duration_ms"
    )]
    pub consumer_retry_delay: Duration,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            broker_type: BrokerType::default(),
            host: None,
            port: default_port(),
            credentials: None,
            consumer_buffer_size: default_buffer_size(),
            consumer_max_retries: default_max_retries(),
            consumer_retry_delay: default_retry_delay(),
            log_level: default_log_level(),
        }
    }
}

impl MessageBusConfig {
    /// Builds the configuration from process environment variables:
    /// `BROKER_TYPE`, `BROKER_HOST`, `BROKER_PORT`, `BROKER_CREDENTIALS`,
    /// `CONSUMER_BUFFER_SIZE`, `CONSUMER_MAX_RETRIES`,
    /// `CONSUMER_RETRY_DELAY_MS`, `LOG_LEVEL`.
    ///
    /// When `BROKER_TYPE` is unset the type is auto-detected: a set
    /// `BROKER_HOST` selects the networked broker, otherwise in-memory.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self {
            host: env_string("BROKER_HOST"),
            credentials: env_string("BROKER_CREDENTIALS"),
            ..Self::default()
        };

        config.broker_type = match env_string("BROKER_TYPE") {
            Some(raw) => BrokerType::from_str(&raw.to_lowercase()).map_err(|_| {
                ConfigError::Invalid {
                    key: "BROKER_TYPE".to_string(),
                    message: format!("expected 'memory' or 'networked', got '{}'", raw),
                }
            })?,
            None if config.host.is_some() => BrokerType::Networked,
            None => BrokerType::Memory,
        };

        if let Some(port) = env_parsed::<u16>("BROKER_PORT")? {
            config.port = port;
        }
        if let Some(size) = env_parsed::<usize>("CONSUMER_BUFFER_SIZE")? {
            config.consumer_buffer_size = size;
        }
        if let Some(retries) = env_parsed::<u32>("CONSUMER_MAX_RETRIES")? {
            config.consumer_max_retries = retries;
        }
        if let Some(delay_ms) = env_parsed::<u64>("CONSUMER_RETRY_DELAY_MS")? {
            config.consumer_retry_delay = Duration::from_millis(delay_ms);
        }
        if let Some(level) = env_string("LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Loads the configuration from a JSON file. Unknown keys are ignored.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config = serde_json::from_reader(reader)?;
        Ok(config)
    }

    /// Checks cross-field requirements. The factory calls this before
    /// constructing a broker.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.broker_type == BrokerType::Networked && self.host.is_none() {
            return Err(ConfigError::MissingField("host"));
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: FromStr>(key: &str) -> ConfigResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

fn default_port() -> u16 {
    6379
}
fn default_buffer_size() -> usize {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> Duration {
    Duration::from_millis(100)
}
fn default_log_level() -> String {
    "info".to_string()
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
