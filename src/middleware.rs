//! Pre-dispatch middleware chain.
//!
//! A consumer runs every inbound event through its middleware chain before
//! handing it to the registry. Each stage may pass the event through,
//! rewrite its metadata, or drop it entirely by returning `None`. Stages
//! run sequentially in the order they were added.
//!
//! The event a middleware sees is the consumer's own copy; the published
//! event itself is never mutated.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::event::{Event, Value};

#[async_trait]
pub trait EventMiddleware: Send + Sync {
    /// Returns the (possibly modified) event to continue with, or `None`
    /// to drop it before dispatch.
    async fn process(&self, event: Event) -> Option<Event>;
}

/// Ordered set of middleware stages.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    stages: Vec<Arc<dyn EventMiddleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Arc<dyn EventMiddleware>) {
        self.stages.push(stage);
    }

    pub fn with(mut self, stage: Arc<dyn EventMiddleware>) -> Self {
        self.push(stage);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn run(&self, event: Event) -> Option<Event> {
        let mut current = event;
        for stage in &self.stages {
            match stage.process(current).await {
                Some(next) => current = next,
                None => return None,
            }
        }
        Some(current)
    }
}

/// Logs every event passing through the chain.
pub struct LoggingMiddleware;

#[async_trait]
impl EventMiddleware for LoggingMiddleware {
    async fn process(&self, event: Event) -> Option<Event> {
        info!(
            event_type = %event.event_type,
            source = %event.source_agent,
            correlation_id = %event.correlation_id,
            "event received"
        );
        Some(event)
    }
}

/// Drops events that fail a predicate.
pub struct FilteringMiddleware {
    predicate: Arc<dyn Fn(&Event) -> bool + Send + Sync>,
}

impl FilteringMiddleware {
    pub fn new(predicate: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }
}

#[async_trait]
impl EventMiddleware for FilteringMiddleware {
    async fn process(&self, event: Event) -> Option<Event> {
        if (self.predicate)(&event) {
            Some(event)
        } else {
            debug!(event_type = %event.event_type, "event filtered");
            None
        }
    }
}

/// Stamps a fixed metadata entry onto every event.
pub struct EnrichmentMiddleware {
    key: String,
    value: Value,
}

impl EnrichmentMiddleware {
    pub fn new(key: &str, value: Value) -> Self {
        Self {
            key: key.to_string(),
            value,
        }
    }
}

#[async_trait]
impl EventMiddleware for EnrichmentMiddleware {
    async fn process(&self, mut event: Event) -> Option<Event> {
        event.metadata.insert(self.key.clone(), self.value.clone());
        Some(event)
    }
}
