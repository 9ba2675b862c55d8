//! Construction of broker + registry pairs from configuration.
//!
//! Centralizes the wiring every deployment needs: pick a broker
//! implementation (explicitly or by environment auto-detection), validate
//! its options, connect it, and pair it with a fresh handler registry.
//! Connection problems surface here, at construction, not on first use.

use std::env;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::broker::memory::InMemoryBroker;
use crate::broker::redis::RedisBroker;
use crate::broker::MessageBroker;
use crate::config::{BrokerType, ConfigError, ConfigResult, MessageBusConfig};
use crate::error::BusResult;
use crate::registry::HandlerRegistry;

/// Resolves the broker type from the environment: an explicit
/// `BROKER_TYPE` wins, a configured `BROKER_HOST` implies networked,
/// and the in-process broker is the fallback. An unrecognized
/// `BROKER_TYPE` value fails fast rather than falling through to
/// detection, matching [`MessageBusConfig::from_env`].
pub fn detect_broker_type() -> ConfigResult<BrokerType> {
    if let Some(raw) = env::var("BROKER_TYPE").ok().filter(|v| !v.is_empty()) {
        return raw
            .to_lowercase()
            .parse()
            .map_err(|_| ConfigError::Invalid {
                key: "BROKER_TYPE".to_string(),
                message: format!("expected 'memory' or 'networked', got '{}'", raw),
            });
    }
    if env::var("BROKER_HOST").map(|h| !h.is_empty()).unwrap_or(false) {
        return Ok(BrokerType::Networked);
    }
    Ok(BrokerType::Memory)
}

/// Constructs (and for the networked variant, connects) a broker.
pub async fn create_broker(config: &MessageBusConfig) -> BusResult<Arc<dyn MessageBroker>> {
    config.validate()?;
    match config.broker_type {
        BrokerType::Memory => {
            info!("creating in-memory broker");
            Ok(Arc::new(InMemoryBroker::new()))
        }
        BrokerType::Networked => {
            let host = config
                .host
                .as_deref()
                .ok_or(ConfigError::MissingField("host"))?;
            info!(host, port = config.port, "creating networked broker");
            let broker = RedisBroker::new(host, config.port, config.credentials.clone());
            broker.connect().await?;
            Ok(Arc::new(broker))
        }
    }
}

pub fn create_registry() -> Arc<HandlerRegistry> {
    Arc::new(HandlerRegistry::new())
}

/// Constructs and wires a fresh broker + registry pair.
pub async fn create_message_bus(
    config: &MessageBusConfig,
) -> BusResult<(Arc<dyn MessageBroker>, Arc<HandlerRegistry>)> {
    let broker = create_broker(config).await?;
    let registry = create_registry();
    info!(broker_type = %config.broker_type, "message bus created");
    Ok((broker, registry))
}

/// [`create_message_bus`] with all options resolved from the environment.
pub async fn create_message_bus_from_env(
) -> BusResult<(Arc<dyn MessageBroker>, Arc<HandlerRegistry>)> {
    let config = MessageBusConfig::from_env()?;
    create_message_bus(&config).await
}

/// Installs a global tracing subscriber honoring `level` (an `EnvFilter`
/// directive, e.g. `"info"` or `"legion_bus=debug"`). Harmless to call
/// when a subscriber is already installed.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
