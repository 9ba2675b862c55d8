//! # Message Broker Abstraction
//!
//! The broker is the transport seam of the bus: agents communicate only
//! through the [`MessageBroker`] trait, never with each other directly.
//! Two implementations ship with the crate and are interchangeable at
//! call sites:
//!
//! - [`InMemoryBroker`](memory::InMemoryBroker): single-process fan-out,
//!   no connection step, ideal for tests and local deployments
//! - [`RedisBroker`](redis::RedisBroker): networked pub/sub over Redis,
//!   at-most-once delivery
//!
//! ## Failure Semantics
//!
//! `publish` on a broker that is closed or was never connected fails with
//! [`BrokerError::Unavailable`]. Subscriber callbacks are isolated by the
//! broker layer: a misbehaving subscriber never crashes the dispatch loop
//! or blocks delivery to other subscribers.

pub mod memory;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

/// Identifies one active channel subscription so it can be removed later.
pub type SubscriptionId = u64;

/// Async callback invoked with the raw serialized payload of each message
/// delivered on a subscribed channel.
pub type ChannelCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Capability set every broker implementation provides.
///
/// All methods take `&self`; implementations manage their own interior
/// state so a single broker can be shared behind an `Arc` by any number
/// of publishers and consumers.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Establishes the underlying connection. Idempotent; a no-op for
    /// in-process brokers.
    async fn connect(&self) -> BrokerResult<()>;

    /// Sends a serialized event to every subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<()>;

    /// Registers `callback` for messages on `channel`. Returns an id
    /// usable with [`unsubscribe`](Self::unsubscribe).
    async fn subscribe(&self, channel: &str, callback: ChannelCallback)
        -> BrokerResult<SubscriptionId>;

    /// Removes a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> BrokerResult<()>;

    /// Releases connections and stops all listen loops. Idempotent.
    async fn close(&self) -> BrokerResult<()>;
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("connection to {endpoint} failed: {message}")]
    ConnectionFailed { endpoint: String, message: String },

    #[error("publish on channel {channel} failed: {message}")]
    PublishFailed { channel: String, message: String },

    #[error("subscribe on channel {channel} failed: {message}")]
    SubscribeFailed { channel: String, message: String },
}

pub type BrokerResult<T> = Result<T, BrokerError>;
