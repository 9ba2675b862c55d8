//! # LEGION Message Bus
//!
//! An async, event-driven message bus for coordinating a fleet of trading
//! agents. Agents never call each other directly; they publish typed events
//! onto named channels and react to the events they subscribed to.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌─────────────────┐
//!   publish ────▶ │  MessageBroker  │ ────▶ channel callbacks
//!                 │ (memory | redis)│
//!                 └─────────────────┘
//!                          │
//!                          ▼
//!                 ┌─────────────────┐
//!                 │  EventConsumer  │  deserialize → middleware → dispatch
//!                 └─────────────────┘
//!                          │
//!                          ▼
//!                 ┌─────────────────┐
//!                 │ HandlerRegistry │  priority-ordered, fault-isolated
//!                 └─────────────────┘
//! ```
//!
//! ### Core Components
//!
//! - Event model ([`event`]): typed event kinds, JSON wire format,
//!   correlation chains across multi-agent workflows
//! - Broker abstraction ([`broker`]): transport-agnostic pub/sub with an
//!   in-process implementation for tests and single-process deployments,
//!   and a Redis-backed one for distributed fleets
//! - Handler registry ([`registry`]): per-kind handler lists invoked in
//!   priority order, with per-handler statistics and failure isolation
//! - Roles ([`consumer`], [`publisher`]): the subscribing and producing
//!   sides of an agent, built on the pieces above
//! - Middleware ([`middleware`]): inspect, enrich, or drop events between
//!   deserialization and dispatch
//! - Dead letter queue ([`dlq`]): bounded capture of events whose handlers
//!   failed, for offline inspection
//! - Configuration and wiring ([`config`], [`factory`]): environment or
//!   file driven construction of a broker + registry pair
//!
//! ## Example
//!
//! ```
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use legion_bus::broker::memory::InMemoryBroker;
//! use legion_bus::consumer::{ConsumerConfig, EventConsumer, HandlerBinding};
//! use legion_bus::event::{Event, EventType};
//! use legion_bus::publisher::EventPublisher;
//! use legion_bus::registry::{HandlerError, HandlerFn, HandlerPriority, HandlerRegistry};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let broker = Arc::new(InMemoryBroker::new());
//! let registry = Arc::new(HandlerRegistry::new());
//!
//! let risk_check: HandlerFn = Arc::new(|event: Event| {
//!     Box::pin(async move {
//!         tracing::info!(correlation_id = %event.correlation_id, "screening");
//!         Ok::<(), HandlerError>(())
//!     })
//! });
//! let consumer = EventConsumer::new(
//!     ConsumerConfig::new("risk_manager"),
//!     broker.clone(),
//!     registry.clone(),
//! )
//! .with_binding(HandlerBinding::new(
//!     EventType::CandidateTrade,
//!     "risk_check",
//!     HandlerPriority::Critical,
//!     risk_check,
//! ));
//! consumer.start().await.unwrap();
//!
//! let publisher = EventPublisher::new("strategy_builder", broker);
//! publisher
//!     .publish(EventType::CandidateTrade, HashMap::new(), None)
//!     .await
//!     .unwrap();
//! # consumer.stop().await.unwrap();
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod event;
pub mod factory;
pub mod middleware;
pub mod publisher;
pub mod registry;

pub use broker::{BrokerError, ChannelCallback, MessageBroker, SubscriptionId};
pub use config::{BrokerType, MessageBusConfig};
pub use consumer::{ConsumerConfig, ConsumerStatus, EventConsumer, HandlerBinding};
pub use dlq::{DeadLetterQueue, DlqEntry};
pub use error::{BusResult, Error};
pub use event::{Event, EventError, EventType, Value};
pub use factory::{create_broker, create_message_bus, create_message_bus_from_env};
pub use middleware::{EventMiddleware, MiddlewareChain};
pub use publisher::{EventPublisher, PublishError};
pub use registry::{
    DispatchResult, HandlerError, HandlerFn, HandlerPriority, HandlerRegistry, HandlerStats,
    RegistryStats,
};
