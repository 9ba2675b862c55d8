//! # Event Consumer
//!
//! The consumer role wires an agent into the bus on the receiving side:
//! it registers the agent's handlers with the shared
//! [`HandlerRegistry`](crate::registry::HandlerRegistry), subscribes one
//! broker channel per event kind of interest, and routes every inbound
//! payload through its middleware chain into `registry.dispatch`.
//!
//! Agents embed an [`EventConsumer`] rather than inheriting from it; the
//! handlers they would have overridden in a subclass are declared up front
//! as [`HandlerBinding`]s.
//!
//! ## Lifecycle
//!
//! ```text
//! new() -> initialize() -> start() -> ... -> stop()
//! ```
//!
//! `start` implies `initialize` if it has not run yet. `stop` is idempotent
//! and safe to call on a consumer that never started. A malformed inbound
//! payload is logged and dropped; it never halts the subscribe loop.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::broker::{ChannelCallback, MessageBroker, SubscriptionId};
use crate::error::BusResult;
use crate::event::{Event, EventType};
use crate::middleware::MiddlewareChain;
use crate::registry::{HandlerFn, HandlerPriority, HandlerRegistry, RegistryResult, RegistryStats};

/// Declares one handler the consumer owns.
pub struct HandlerBinding {
    pub event_type: EventType,
    pub handler_id: String,
    pub priority: HandlerPriority,
    pub handler: HandlerFn,
}

impl HandlerBinding {
    pub fn new(
        event_type: EventType,
        handler_id: &str,
        priority: HandlerPriority,
        handler: HandlerFn,
    ) -> Self {
        Self {
            event_type,
            handler_id: handler_id.to_string(),
            priority,
            handler,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub agent_name: String,
    /// Event kinds to subscribe to beyond those implied by the bindings.
    pub subscriptions: Vec<EventType>,
    pub buffer_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl ConsumerConfig {
    pub fn new(agent_name: &str) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            subscriptions: Vec::new(),
            buffer_size: 1000,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }

    pub fn subscribe_to(mut self, event_type: EventType) -> Self {
        self.subscriptions.push(event_type);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStatus {
    pub agent_name: String,
    pub running: bool,
    pub subscriptions: Vec<String>,
    pub registry: RegistryStats,
}

#[derive(Default)]
struct ConsumerState {
    initialized: bool,
    running: bool,
    active: Vec<(String, SubscriptionId)>,
}

pub struct EventConsumer {
    config: ConsumerConfig,
    broker: Arc<dyn MessageBroker>,
    registry: Arc<HandlerRegistry>,
    bindings: Vec<HandlerBinding>,
    middleware: MiddlewareChain,
    state: Mutex<ConsumerState>,
}

impl EventConsumer {
    pub fn new(
        config: ConsumerConfig,
        broker: Arc<dyn MessageBroker>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            config,
            broker,
            registry,
            bindings: Vec::new(),
            middleware: MiddlewareChain::new(),
            state: Mutex::new(ConsumerState::default()),
        }
    }

    pub fn with_binding(mut self, binding: HandlerBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn with_middleware(mut self, middleware: MiddlewareChain) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn agent_name(&self) -> &str {
        &self.config.agent_name
    }

    /// Registers every declared handler binding with the shared registry.
    /// Idempotent; `start` calls this if it has not run yet.
    pub async fn initialize(&self) -> RegistryResult<()> {
        let mut state = self.state.lock().await;
        if state.initialized {
            return Ok(());
        }
        for binding in &self.bindings {
            self.registry
                .register(
                    binding.event_type,
                    binding.handler.clone(),
                    &self.config.agent_name,
                    &binding.handler_id,
                    binding.priority,
                )
                .await?;
        }
        state.initialized = true;
        info!(
            agent = %self.config.agent_name,
            handlers = self.bindings.len(),
            "consumer initialized"
        );
        Ok(())
    }

    /// Every event kind this consumer listens on: explicit subscriptions
    /// plus the kinds of its handler bindings, deduplicated.
    fn subscribed_kinds(&self) -> Vec<EventType> {
        let mut kinds: Vec<EventType> = self
            .config
            .subscriptions
            .iter()
            .copied()
            .chain(self.bindings.iter().map(|b| b.event_type))
            .collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    fn channel_callback(&self) -> ChannelCallback {
        let registry = self.registry.clone();
        let middleware = self.middleware.clone();
        let agent = self.config.agent_name.clone();
        Arc::new(move |raw: String| {
            let registry = registry.clone();
            let middleware = middleware.clone();
            let agent = agent.clone();
            Box::pin(async move {
                let event = match Event::from_json(&raw) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(agent = %agent, error = %e, "dropping malformed payload");
                        return;
                    }
                };
                let Some(event) = middleware.run(event).await else {
                    return;
                };
                registry.dispatch(event).await;
            })
        })
    }

    /// Subscribes to the broker for every declared event kind and begins
    /// routing inbound payloads to the registry. Calling `start` on a
    /// running consumer is a warning no-op.
    pub async fn start(&self) -> BusResult<()> {
        self.initialize().await?;

        let mut state = self.state.lock().await;
        if state.running {
            warn!(agent = %self.config.agent_name, "consumer already running");
            return Ok(());
        }

        for event_type in self.subscribed_kinds() {
            let channel = event_type.channel();
            let id = self
                .broker
                .subscribe(&channel, self.channel_callback())
                .await?;
            state.active.push((channel, id));
        }
        state.running = true;
        info!(
            agent = %self.config.agent_name,
            channels = state.active.len(),
            "consumer started"
        );
        Ok(())
    }

    /// Unsubscribes everything. Idempotent; safe even if `start` was
    /// never called. A failing `unsubscribe` does not stop the teardown
    /// of the remaining channels; the first error is reported after all
    /// of them have been attempted.
    pub async fn stop(&self) -> BusResult<()> {
        let mut state = self.state.lock().await;
        if !state.running && state.active.is_empty() {
            return Ok(());
        }
        let active = std::mem::take(&mut state.active);
        let mut first_error = None;
        for (channel, id) in active {
            if let Err(e) = self.broker.unsubscribe(&channel, id).await {
                warn!(
                    agent = %self.config.agent_name,
                    channel,
                    error = %e,
                    "unsubscribe failed during stop"
                );
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        state.running = false;
        info!(agent = %self.config.agent_name, "consumer stopped");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    pub async fn status(&self) -> ConsumerStatus {
        let state = self.state.lock().await;
        ConsumerStatus {
            agent_name: self.config.agent_name.clone(),
            running: state.running,
            subscriptions: state.active.iter().map(|(c, _)| c.clone()).collect(),
            registry: self.registry.get_stats().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::broker::{BrokerError, BrokerResult};
    use crate::event::Value;
    use crate::registry::HandlerError;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    fn recording_binding(
        event_type: EventType,
        handler_id: &str,
        seen: Arc<AsyncMutex<Vec<Event>>>,
    ) -> HandlerBinding {
        let handler: HandlerFn = Arc::new(move |event| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.lock().await.push(event);
                Ok::<(), HandlerError>(())
            })
        });
        HandlerBinding::new(event_type, handler_id, HandlerPriority::Normal, handler)
    }

    fn setup() -> (Arc<InMemoryBroker>, Arc<HandlerRegistry>) {
        (
            Arc::new(InMemoryBroker::new()),
            Arc::new(HandlerRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_start_routes_events_to_handlers() {
        let (broker, registry) = setup();
        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let consumer = EventConsumer::new(
            ConsumerConfig::new("risk_manager"),
            broker.clone(),
            registry.clone(),
        )
        .with_binding(recording_binding(
            EventType::TradeApproved,
            "risk.approved",
            seen.clone(),
        ));
        consumer.start().await.unwrap();

        let mut payload = HashMap::new();
        payload.insert("order_id".to_string(), Value::from("o-1"));
        let event = Event::new(EventType::TradeApproved, payload, "strategy");
        broker
            .publish(&event.channel(), &event.to_json().unwrap())
            .await
            .unwrap();

        let received = seen.lock().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], event);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let (broker, registry) = setup();
        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let consumer = EventConsumer::new(
            ConsumerConfig::new("risk_manager"),
            broker.clone(),
            registry.clone(),
        )
        .with_binding(recording_binding(
            EventType::TradeApproved,
            "risk.approved",
            seen.clone(),
        ));
        consumer.start().await.unwrap();

        broker
            .publish("trade_approved", "{broken json")
            .await
            .unwrap();
        assert!(seen.lock().await.is_empty());

        // Consumer still alive after the bad message.
        let event = Event::new(EventType::TradeApproved, HashMap::new(), "strategy");
        broker
            .publish(&event.channel(), &event.to_json().unwrap())
            .await
            .unwrap();
        assert_eq!(seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_safe_before_start() {
        let (broker, registry) = setup();
        let consumer = EventConsumer::new(ConsumerConfig::new("scanner"), broker.clone(), registry);
        consumer.stop().await.unwrap();

        consumer.start().await.unwrap();
        consumer.stop().await.unwrap();
        consumer.stop().await.unwrap();
        assert!(!consumer.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_removes_subscriptions() {
        let (broker, registry) = setup();
        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let consumer = EventConsumer::new(
            ConsumerConfig::new("scanner"),
            broker.clone(),
            registry.clone(),
        )
        .with_binding(recording_binding(
            EventType::MarketDataReceived,
            "scanner.md",
            seen.clone(),
        ));
        consumer.start().await.unwrap();
        consumer.stop().await.unwrap();

        let event = Event::new(EventType::MarketDataReceived, HashMap::new(), "feed");
        broker
            .publish(&event.channel(), &event.to_json().unwrap())
            .await
            .unwrap();
        assert!(seen.lock().await.is_empty());
        assert_eq!(broker.subscriber_count("market_data_received"), 0);
    }

    /// Delegates to an in-memory broker but refuses to unsubscribe one
    /// channel, counting every attempt.
    struct FlakyUnsubscribeBroker {
        inner: InMemoryBroker,
        poison_channel: &'static str,
        unsubscribe_attempts: AtomicU64,
    }

    #[async_trait]
    impl MessageBroker for FlakyUnsubscribeBroker {
        async fn connect(&self) -> BrokerResult<()> {
            self.inner.connect().await
        }
        async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<()> {
            self.inner.publish(channel, payload).await
        }
        async fn subscribe(
            &self,
            channel: &str,
            callback: ChannelCallback,
        ) -> BrokerResult<SubscriptionId> {
            self.inner.subscribe(channel, callback).await
        }
        async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> BrokerResult<()> {
            self.unsubscribe_attempts.fetch_add(1, Ordering::Relaxed);
            if channel == self.poison_channel {
                return Err(BrokerError::Unavailable("connection reset".to_string()));
            }
            self.inner.unsubscribe(channel, id).await
        }
        async fn close(&self) -> BrokerResult<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_stop_tears_down_remaining_channels_past_an_error() {
        let broker = Arc::new(FlakyUnsubscribeBroker {
            inner: InMemoryBroker::new(),
            poison_channel: "market_data_received",
            unsubscribe_attempts: AtomicU64::new(0),
        });
        let registry = Arc::new(HandlerRegistry::new());
        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let consumer = EventConsumer::new(
            ConsumerConfig::new("scanner"),
            broker.clone(),
            registry,
        )
        .with_binding(recording_binding(
            EventType::MarketDataReceived,
            "scanner.md",
            seen.clone(),
        ))
        .with_binding(recording_binding(
            EventType::RiskAlert,
            "scanner.alert",
            seen.clone(),
        ));
        consumer.start().await.unwrap();

        let err = consumer.stop().await;
        assert!(err.is_err());
        // Both channels were attempted and the healthy one was torn down.
        assert_eq!(broker.unsubscribe_attempts.load(Ordering::Relaxed), 2);
        assert_eq!(broker.inner.subscriber_count("risk_alert"), 0);
        assert!(!consumer.is_running().await);

        // A later stop has nothing left to retry and succeeds.
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_start_does_not_duplicate_subscriptions() {
        let (broker, registry) = setup();
        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let consumer = EventConsumer::new(
            ConsumerConfig::new("scanner"),
            broker.clone(),
            registry.clone(),
        )
        .with_binding(recording_binding(
            EventType::MarketDataReceived,
            "scanner.md",
            seen.clone(),
        ));
        consumer.start().await.unwrap();
        consumer.start().await.unwrap();
        assert_eq!(broker.subscriber_count("market_data_received"), 1);
    }

    #[tokio::test]
    async fn test_status_reports_subscriptions() {
        let (broker, registry) = setup();
        let consumer = EventConsumer::new(
            ConsumerConfig::new("monitor").subscribe_to(EventType::AgentHeartbeat),
            broker,
            registry,
        );
        consumer.start().await.unwrap();
        let status = consumer.status().await;
        assert!(status.running);
        assert_eq!(status.subscriptions, vec!["agent_heartbeat"]);
    }
}
