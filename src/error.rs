use thiserror::Error;

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::event::EventError;
use crate::publisher::PublishError;
use crate::registry::RegistryError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("event error: {0}")]
    Event(#[from] EventError),

    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}

pub type BusResult<T> = Result<T, Error>;
