//! In-process broker for tests and single-process deployments.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, trace};

use super::{BrokerError, BrokerResult, ChannelCallback, MessageBroker, SubscriptionId};
use async_trait::async_trait;

/// Delivery counters kept per channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub published: u64,
    pub delivered: u64,
}

/// Single-process broker: a concurrent map from channel name to the
/// callbacks registered on it. `publish` invokes every callback directly,
/// so delivery is synchronous with the publisher's task and there is no
/// network hop and no `connect()` requirement.
#[derive(Default)]
pub struct InMemoryBroker {
    subscribers: DashMap<String, Vec<(SubscriptionId, ChannelCallback)>>,
    stats: DashMap<String, ChannelStats>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for one channel, if any traffic has been seen on it.
    pub fn channel_stats(&self, channel: &str) -> Option<ChannelStats> {
        self.stats.get(channel).map(|s| s.clone())
    }

    /// Number of live subscriptions on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers.get(channel).map(|v| v.len()).unwrap_or(0)
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Unavailable("broker is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn connect(&self) -> BrokerResult<()> {
        // Reopening a closed broker is allowed; subscriptions do not survive.
        self.closed.store(false, Ordering::Release);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<()> {
        self.ensure_open()?;

        // Snapshot the callback list so no map guard is held while awaiting
        // subscriber callbacks. Subscriptions added during delivery see the
        // next publish.
        let callbacks: Vec<ChannelCallback> = self
            .subscribers
            .get(channel)
            .map(|entry| entry.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();

        self.stats
            .entry(channel.to_string())
            .or_default()
            .published += 1;

        trace!(channel, subscribers = callbacks.len(), "delivering message");
        for callback in callbacks {
            callback(payload.to_string()).await;
            self.stats
                .entry(channel.to_string())
                .or_default()
                .delivered += 1;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        callback: ChannelCallback,
    ) -> BrokerResult<SubscriptionId> {
        self.ensure_open()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(channel.to_string())
            .or_default()
            .push((id, callback));
        debug!(channel, id, "subscribed");
        Ok(id)
    }

    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> BrokerResult<()> {
        if let Some(mut entry) = self.subscribers.get_mut(channel) {
            entry.retain(|(sub_id, _)| *sub_id != id);
        }
        debug!(channel, id, "unsubscribed");
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::Release);
        self.subscribers.clear();
        debug!("in-memory broker closed");
        Ok(())
    }
}
