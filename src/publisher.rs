//! # Event Publisher
//!
//! The producing side of the bus. A publisher constructs events, stamps
//! them with its agent name, serializes them, and hands them to the broker
//! on the event kind's canonical channel.
//!
//! Three publish shapes cover the spectrum of delivery needs:
//!
//! - [`publish`](EventPublisher::publish): fail loudly, caller handles it
//! - [`publish_batch`](EventPublisher::publish_batch): best-effort, caller
//!   compares the returned count against the batch length
//! - [`publish_with_retry`](EventPublisher::publish_with_retry): bounded
//!   retries with a fixed delay, boolean outcome, never an error

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::broker::{BrokerError, MessageBroker};
use crate::event::{Event, EventError, EventType, Value};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("broker rejected publish: {0}")]
    Broker(#[from] BrokerError),

    #[error("could not serialize event: {0}")]
    Event(#[from] EventError),
}

pub type PublishResult<T> = Result<T, PublishError>;

pub struct EventPublisher {
    agent_name: String,
    broker: Arc<dyn MessageBroker>,
    published: AtomicU64,
    failed: AtomicU64,
}

impl EventPublisher {
    pub fn new(agent_name: &str, broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            broker,
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Constructs an event and sends it on the kind's canonical channel.
    ///
    /// With `correlation_id` the event joins an existing causal chain;
    /// without it a new chain begins.
    pub async fn publish(
        &self,
        event_type: EventType,
        payload: HashMap<String, Value>,
        correlation_id: Option<&str>,
    ) -> PublishResult<()> {
        let event = match correlation_id {
            Some(correlation_id) => {
                Event::with_correlation(event_type, payload, &self.agent_name, correlation_id)
            }
            None => Event::new(event_type, payload, &self.agent_name),
        };
        self.publish_event(event).await
    }

    /// Sends a pre-built event, e.g. one derived from a received event via
    /// [`Event::derived`] to keep its correlation chain intact.
    pub async fn publish_event(&self, event: Event) -> PublishResult<()> {
        let channel = event.channel();
        let raw = event.to_json()?;
        match self.broker.publish(&channel, &raw).await {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    agent = %self.agent_name,
                    channel,
                    message_id = %event.message_id,
                    "published"
                );
                Ok(())
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Publishes each event independently and returns how many succeeded.
    /// Partial failure is reported only through the count; compare it
    /// against the batch length.
    pub async fn publish_batch(
        &self,
        batch: Vec<(EventType, HashMap<String, Value>)>,
    ) -> usize {
        let total = batch.len();
        let mut succeeded = 0;
        for (event_type, payload) in batch {
            match self.publish(event_type, payload, None).await {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    warn!(
                        agent = %self.agent_name,
                        event_type = %event_type,
                        error = %e,
                        "skipped event in batch"
                    );
                }
            }
        }
        debug!(agent = %self.agent_name, succeeded, total, "batch published");
        succeeded
    }

    /// Publishes with up to `max_retries` retries after the initial
    /// attempt (so `max_retries + 1` attempts in total), sleeping
    /// `retry_delay` between attempts. The delay is fixed rather than
    /// exponential; retry budgets on this bus are small enough that
    /// backoff would only delay the inevitable escalation.
    ///
    /// Returns `false` once the budget is exhausted; deciding whether
    /// that is fatal is the caller's call.
    pub async fn publish_with_retry(
        &self,
        event_type: EventType,
        payload: HashMap<String, Value>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> bool {
        let event = Event::new(event_type, payload, &self.agent_name);
        for attempt in 0..=max_retries {
            match self.publish_event(event.clone()).await {
                Ok(()) => return true,
                Err(e) if attempt < max_retries => {
                    warn!(
                        agent = %self.agent_name,
                        event_type = %event_type,
                        attempt = attempt + 1,
                        max_attempts = max_retries + 1,
                        error = %e,
                        "publish failed, retrying"
                    );
                    sleep(retry_delay).await;
                }
                Err(e) => {
                    error!(
                        agent = %self.agent_name,
                        event_type = %event_type,
                        attempts = max_retries + 1,
                        error = %e,
                        "publish failed, retry budget exhausted"
                    );
                }
            }
        }
        false
    }

    /// Events successfully handed to the broker.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Publish attempts rejected by the broker.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
