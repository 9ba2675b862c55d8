//! Networked broker over Redis pub/sub.
//!
//! Publishing uses a single multiplexed connection shared by all callers;
//! each subscription opens its own pub/sub connection and runs a background
//! listen task until it is unsubscribed or the broker is closed.
//!
//! Delivery is at-most-once: Redis pub/sub does not buffer for absent
//! subscribers, and this broker does not mask that. Producers that need
//! stronger guarantees retry on their side via
//! [`EventPublisher::publish_with_retry`](crate::publisher::EventPublisher::publish_with_retry).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BrokerError, BrokerResult, ChannelCallback, MessageBroker, SubscriptionId};

pub struct RedisBroker {
    host: String,
    port: u16,
    credentials: Option<String>,
    client: Mutex<Option<redis::Client>>,
    connection: Mutex<Option<redis::aio::MultiplexedConnection>>,
    listeners: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl RedisBroker {
    pub fn new(host: &str, port: u16, credentials: Option<String>) -> Self {
        Self {
            host: host.to_string(),
            port,
            credentials,
            client: Mutex::new(None),
            connection: Mutex::new(None),
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn url(&self) -> String {
        match &self.credentials {
            Some(password) => format!("redis://:{}@{}:{}/", password, self.host, self.port),
            None => format!("redis://{}:{}/", self.host, self.port),
        }
    }

    /// Clone of the shared publish connection, or `Unavailable` when
    /// `connect()` has not succeeded yet. The clone is cheap and lets the
    /// guard drop before any network await.
    async fn publish_connection(&self) -> BrokerResult<redis::aio::MultiplexedConnection> {
        self.connection
            .lock()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| {
                BrokerError::Unavailable("not connected; call connect() first".to_string())
            })
    }

    async fn pubsub_client(&self) -> BrokerResult<redis::Client> {
        self.client.lock().await.as_ref().cloned().ok_or_else(|| {
            BrokerError::Unavailable("not connected; call connect() first".to_string())
        })
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn connect(&self) -> BrokerResult<()> {
        if self.connection.lock().await.is_some() {
            return Ok(());
        }

        let client = redis::Client::open(self.url()).map_err(|e| BrokerError::ConnectionFailed {
            endpoint: self.endpoint(),
            message: e.to_string(),
        })?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                endpoint: self.endpoint(),
                message: e.to_string(),
            })?;

        *self.client.lock().await = Some(client);
        *self.connection.lock().await = Some(connection);
        info!(endpoint = %self.endpoint(), "connected to redis broker");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<()> {
        let mut connection = self.publish_connection().await?;
        let _receivers: i64 = connection.publish(channel, payload).await.map_err(|e| {
            BrokerError::PublishFailed {
                channel: channel.to_string(),
                message: e.to_string(),
            }
        })?;
        debug!(channel, bytes = payload.len(), "published");
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        callback: ChannelCallback,
    ) -> BrokerResult<SubscriptionId> {
        let client = self.pubsub_client().await?;
        let mut pubsub =
            client
                .get_async_pubsub()
                .await
                .map_err(|e| BrokerError::SubscribeFailed {
                    channel: channel.to_string(),
                    message: e.to_string(),
                })?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BrokerError::SubscribeFailed {
                channel: channel.to_string(),
                message: e.to_string(),
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let channel_name = channel.to_string();
        let handle = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "dropping undecodable message");
                        continue;
                    }
                };
                callback(payload).await;
            }
            debug!(channel = %channel_name, "listen loop ended");
        });

        self.listeners.lock().await.insert(id, handle);
        info!(channel, id, "subscribed to redis channel");
        Ok(id)
    }

    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> BrokerResult<()> {
        if let Some(handle) = self.listeners.lock().await.remove(&id) {
            // Dropping the pub/sub connection with its task also issues the
            // protocol-level UNSUBSCRIBE.
            handle.abort();
            debug!(channel, id, "unsubscribed from redis channel");
        }
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut listeners = self.listeners.lock().await;
        for (_, handle) in listeners.drain() {
            handle.abort();
        }
        drop(listeners);
        *self.connection.lock().await = None;
        *self.client.lock().await = None;
        info!("redis broker closed");
        Ok(())
    }
}
