//! # Handler Registry
//!
//! Central registry mapping event kinds to their registered handlers, and
//! the dispatch engine that invokes them. One registry instance is shared
//! (via `Arc`, dependency-injected) by every consumer on the bus; tests
//! construct their own isolated instances.
//!
//! ## Dispatch Contract
//!
//! Handlers run in priority order (`Critical` before `High` before `Normal`
//! before `Low`), stable by registration order within a tier. A failing
//! handler is recorded and skipped over; it never prevents its peers from
//! seeing the event, and `dispatch` itself never fails.
//!
//! ## Locking
//!
//! Registration and dispatch share a `tokio::sync::RwLock`. Dispatch takes
//! a read-locked snapshot of the handler list and releases the lock before
//! invoking anything, so a slow handler never blocks registration. A
//! mid-dispatch `register` takes effect on the *next* dispatch, while
//! `unregister` takes effect immediately: each record carries a live flag
//! that dispatch re-checks right before invoking, so a handler is never
//! invoked after its `unregister` call has returned. No lock is held
//! across a handler await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::dlq::DeadLetterQueue;
use crate::event::{Event, EventType};

/// Handler execution priority. Lower tiers dispatch first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, strum::Display)]
pub enum HandlerPriority {
    Critical,
    High,
    Normal,
    Low,
}

/// Error a handler reports when it cannot process an event.
///
/// Handler failures are contained at the registry boundary: they show up
/// in the [`DispatchResult`] and the handler's counters, never as an error
/// from `dispatch`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// Async handler function registered for one event kind.
pub type HandlerFn =
    Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// One live registration. Shared between the registry's indexes; the
/// registry is the source of truth for its lifetime.
pub struct HandlerRecord {
    pub handler_id: String,
    pub event_type: EventType,
    pub priority: HandlerPriority,
    pub owning_agent: String,
    pub created_at: DateTime<Utc>,
    handler: HandlerFn,
    seq: u64,
    // Cleared on unregister/replacement; dispatch checks it right before
    // invoking so in-flight snapshots never run a removed handler.
    active: AtomicBool,
    invocation_count: AtomicU64,
    error_count: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_invoked: Mutex<Option<DateTime<Utc>>>,
}

impl HandlerRecord {
    /// Copy of the mutable statistics for observability callers.
    pub fn stats(&self) -> HandlerStats {
        HandlerStats {
            handler_id: self.handler_id.clone(),
            event_type: self.event_type,
            priority: self.priority,
            owning_agent: self.owning_agent.clone(),
            invocation_count: self.invocation_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_error: self.last_error.lock().expect("lock poisoned").clone(),
            last_invoked: *self.last_invoked.lock().expect("lock poisoned"),
        }
    }
}

/// Point-in-time copy of one handler's registration and counters.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerStats {
    pub handler_id: String,
    pub event_type: EventType,
    pub priority: HandlerPriority,
    pub owning_agent: String,
    pub invocation_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_invoked: Option<DateTime<Utc>>,
}

/// Outcome of invoking one handler during a dispatch.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub handler_id: String,
    pub priority: HandlerPriority,
    pub error: Option<String>,
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of one dispatch: every handler that was invoked, in invocation
/// order, with its result.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub event_type: EventType,
    pub message_id: String,
    pub outcomes: Vec<HandlerOutcome>,
}

impl DispatchResult {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// Aggregate registry counters for observability exporters.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_handlers: usize,
    pub event_types: usize,
    pub total_invocations: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub handlers_by_event: HashMap<String, usize>,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    /// The same handler id was registered against two different event
    /// kinds, which makes its identity ambiguous. Re-registering with the
    /// same kind is allowed and replaces the prior registration.
    #[error("handler {handler_id} already registered for {existing}, refusing {requested}")]
    HandlerIdConflict {
        handler_id: String,
        existing: EventType,
        requested: EventType,
    },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Default)]
struct RegistryIndex {
    // Vec is kept sorted by (priority, seq) so dispatch order is a plain
    // iteration.
    by_type: HashMap<EventType, Vec<Arc<HandlerRecord>>>,
    by_id: HashMap<String, Arc<HandlerRecord>>,
}

/// See the [module docs](self) for the dispatch and locking contract.
#[derive(Default)]
pub struct HandlerRegistry {
    index: RwLock<RegistryIndex>,
    dead_letter: Option<Arc<DeadLetterQueue>>,
    next_seq: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that forwards failed handler outcomes to `dlq`.
    pub fn with_dead_letter(dlq: Arc<DeadLetterQueue>) -> Self {
        Self {
            dead_letter: Some(dlq),
            ..Self::default()
        }
    }

    /// Registers a handler for an event kind.
    ///
    /// Idempotent by `handler_id`: re-registering the same id for the same
    /// kind replaces the prior registration (fresh counters, new position
    /// at the end of its priority tier). The same id with a *different*
    /// kind is rejected.
    pub async fn register(
        &self,
        event_type: EventType,
        handler: HandlerFn,
        owning_agent: &str,
        handler_id: &str,
        priority: HandlerPriority,
    ) -> RegistryResult<()> {
        let mut index = self.index.write().await;

        if let Some(existing) = index.by_id.get(handler_id) {
            if existing.event_type != event_type {
                return Err(RegistryError::HandlerIdConflict {
                    handler_id: handler_id.to_string(),
                    existing: existing.event_type,
                    requested: event_type,
                });
            }
            let stale = existing.clone();
            stale.active.store(false, Ordering::Release);
            index
                .by_type
                .entry(stale.event_type)
                .or_default()
                .retain(|record| record.handler_id != handler_id);
            index.by_id.remove(handler_id);
            debug!(handler_id, "replacing existing registration");
        }

        let record = Arc::new(HandlerRecord {
            handler_id: handler_id.to_string(),
            event_type,
            priority,
            owning_agent: owning_agent.to_string(),
            created_at: Utc::now(),
            handler,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            invocation_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_invoked: Mutex::new(None),
        });

        let tier = index.by_type.entry(event_type).or_default();
        tier.push(record.clone());
        tier.sort_by_key(|r| (r.priority, r.seq));
        index.by_id.insert(handler_id.to_string(), record);

        info!(
            handler_id,
            event_type = %event_type,
            agent = owning_agent,
            priority = %priority,
            "registered handler"
        );
        Ok(())
    }

    /// Removes a registration. Returns whether it existed. Once this
    /// returns, the handler will not be invoked again, even by a dispatch
    /// already in flight with an older snapshot.
    pub async fn unregister(&self, handler_id: &str) -> bool {
        let mut index = self.index.write().await;
        let Some(record) = index.by_id.remove(handler_id) else {
            return false;
        };
        record.active.store(false, Ordering::Release);
        if let Some(tier) = index.by_type.get_mut(&record.event_type) {
            tier.retain(|r| r.handler_id != handler_id);
        }
        info!(handler_id, "unregistered handler");
        true
    }

    /// Statistics snapshots for every handler on `event_type`, in
    /// dispatch order.
    pub async fn handlers_for(&self, event_type: EventType) -> Vec<HandlerStats> {
        let index = self.index.read().await;
        index
            .by_type
            .get(&event_type)
            .map(|tier| tier.iter().map(|r| r.stats()).collect())
            .unwrap_or_default()
    }

    /// Invokes every handler registered for the event's kind, in priority
    /// order, isolating failures. Never fails; an event kind with no
    /// handlers produces an empty result.
    pub async fn dispatch(&self, event: Event) -> DispatchResult {
        let snapshot: Vec<Arc<HandlerRecord>> = {
            let index = self.index.read().await;
            index
                .by_type
                .get(&event.event_type)
                .cloned()
                .unwrap_or_default()
        };

        let mut result = DispatchResult {
            event_type: event.event_type,
            message_id: event.message_id.clone(),
            outcomes: Vec::with_capacity(snapshot.len()),
        };

        if snapshot.is_empty() {
            debug!(event_type = %event.event_type, "no handlers registered");
            return result;
        }

        for record in &snapshot {
            if !record.active.load(Ordering::Acquire) {
                debug!(handler_id = %record.handler_id, "skipping removed handler");
                continue;
            }
            let outcome = (record.handler)(event.clone()).await;
            record.invocation_count.fetch_add(1, Ordering::Relaxed);
            *record.last_invoked.lock().expect("lock poisoned") = Some(Utc::now());

            let error_message = match outcome {
                Ok(()) => None,
                Err(e) => {
                    record.error_count.fetch_add(1, Ordering::Relaxed);
                    let message = e.to_string();
                    *record.last_error.lock().expect("lock poisoned") = Some(message.clone());
                    error!(
                        handler_id = %record.handler_id,
                        event_type = %event.event_type,
                        error = %message,
                        "handler failed"
                    );
                    if let Some(dlq) = &self.dead_letter {
                        dlq.capture(&event, &record.handler_id, &message).await;
                    }
                    Some(message)
                }
            };

            result.outcomes.push(HandlerOutcome {
                handler_id: record.handler_id.clone(),
                priority: record.priority,
                error: error_message,
            });
        }

        debug!(
            event_type = %event.event_type,
            succeeded = result.succeeded(),
            failed = result.failed(),
            "dispatched"
        );
        result
    }

    pub async fn get_stats(&self) -> RegistryStats {
        let index = self.index.read().await;
        let total_invocations: u64 = index
            .by_id
            .values()
            .map(|r| r.invocation_count.load(Ordering::Relaxed))
            .sum();
        let total_errors: u64 = index
            .by_id
            .values()
            .map(|r| r.error_count.load(Ordering::Relaxed))
            .sum();
        RegistryStats {
            total_handlers: index.by_id.len(),
            event_types: index.by_type.values().filter(|v| !v.is_empty()).count(),
            total_invocations,
            total_errors,
            error_rate: total_errors as f64 / (total_invocations.max(1)) as f64,
            handlers_by_event: index
                .by_type
                .iter()
                .filter(|(_, tier)| !tier.is_empty())
                .map(|(event_type, tier)| (event_type.to_string(), tier.len()))
                .collect(),
        }
    }

    /// Drops every registration. Intended for shutdown and tests.
    pub async fn clear(&self) {
        let mut index = self.index.write().await;
        index.by_type.clear();
        index.by_id.clear();
        info!("handler registry cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tokio::sync::Mutex as AsyncMutex;

    fn event(event_type: EventType) -> Event {
        Event::new(event_type, HashMap::new(), "test_agent")
    }

    fn recording_handler(log: Arc<AsyncMutex<Vec<String>>>, name: &str) -> HandlerFn {
        let name = name.to_string();
        Arc::new(move |_event| {
            let log = log.clone();
            let name = name.clone();
            Box::pin(async move {
                log.lock().await.push(name);
                Ok(())
            })
        })
    }

    fn failing_handler(message: &str) -> HandlerFn {
        let message = message.to_string();
        Arc::new(move |_event| {
            let message = message.clone();
            Box::pin(async move { Err(HandlerError::new(message)) })
        })
    }

    #[tokio::test]
    async fn test_priority_order() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        for (id, priority) in [
            ("h_low", HandlerPriority::Low),
            ("h_normal", HandlerPriority::Normal),
            ("h_critical", HandlerPriority::Critical),
            ("h_high", HandlerPriority::High),
        ] {
            registry
                .register(
                    EventType::OrderExecuted,
                    recording_handler(log.clone(), id),
                    "executor",
                    id,
                    priority,
                )
                .await
                .unwrap();
        }

        registry.dispatch(event(EventType::OrderExecuted)).await;
        assert_eq!(
            *log.lock().await,
            vec!["h_critical", "h_high", "h_normal", "h_low"]
        );
    }

    #[tokio::test]
    async fn test_stable_order_within_tier() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        for id in ["first", "second", "third"] {
            registry
                .register(
                    EventType::RiskAlert,
                    recording_handler(log.clone(), id),
                    "risk",
                    id,
                    HandlerPriority::Normal,
                )
                .await
                .unwrap();
        }
        registry.dispatch(event(EventType::RiskAlert)).await;
        assert_eq!(*log.lock().await, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_peers() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        registry
            .register(
                EventType::TradeApproved,
                failing_handler("boom"),
                "risk",
                "h_fail",
                HandlerPriority::Critical,
            )
            .await
            .unwrap();
        registry
            .register(
                EventType::TradeApproved,
                recording_handler(log.clone(), "h_ok"),
                "risk",
                "h_ok",
                HandlerPriority::Normal,
            )
            .await
            .unwrap();

        let result = registry.dispatch(event(EventType::TradeApproved)).await;

        assert_eq!(*log.lock().await, vec!["h_ok"]);
        assert_eq!(result.succeeded(), 1);
        assert_eq!(result.failed(), 1);
        assert_eq!(result.outcomes[0].error.as_deref(), Some("boom"));

        let stats = registry.handlers_for(EventType::TradeApproved).await;
        let failed = stats.iter().find(|s| s.handler_id == "h_fail").unwrap();
        assert_eq!(failed.error_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_reregister_same_id_replaces() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        registry
            .register(
                EventType::AgentHeartbeat,
                recording_handler(log.clone(), "old"),
                "monitor",
                "h1",
                HandlerPriority::Normal,
            )
            .await
            .unwrap();
        registry
            .register(
                EventType::AgentHeartbeat,
                recording_handler(log.clone(), "new"),
                "monitor",
                "h1",
                HandlerPriority::Normal,
            )
            .await
            .unwrap();

        registry.dispatch(event(EventType::AgentHeartbeat)).await;
        // Replaced, not duplicated.
        assert_eq!(*log.lock().await, vec!["new"]);
        assert_eq!(registry.get_stats().await.total_handlers, 1);
    }

    #[tokio::test]
    async fn test_same_id_different_kind_conflicts() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        registry
            .register(
                EventType::AgentHeartbeat,
                recording_handler(log.clone(), "a"),
                "monitor",
                "h1",
                HandlerPriority::Normal,
            )
            .await
            .unwrap();
        let err = registry
            .register(
                EventType::AgentError,
                recording_handler(log.clone(), "b"),
                "monitor",
                "h1",
                HandlerPriority::Normal,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::HandlerIdConflict { .. }));
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        registry
            .register(
                EventType::SystemShutdown,
                recording_handler(log.clone(), "h1"),
                "system",
                "h1",
                HandlerPriority::Critical,
            )
            .await
            .unwrap();

        assert!(registry.unregister("h1").await);
        assert!(!registry.unregister("h1").await);

        registry.dispatch(event(EventType::SystemShutdown)).await;
        assert!(log.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_takes_effect_during_in_flight_dispatch() {
        let registry = Arc::new(HandlerRegistry::new());
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());

        // Critical handler parks the dispatch until released.
        let gate: HandlerFn = {
            let entered = entered.clone();
            let release = release.clone();
            Arc::new(move |_event| {
                let entered = entered.clone();
                let release = release.clone();
                Box::pin(async move {
                    entered.notify_one();
                    release.notified().await;
                    Ok(())
                })
            })
        };
        registry
            .register(
                EventType::RiskAlert,
                gate,
                "risk",
                "gate",
                HandlerPriority::Critical,
            )
            .await
            .unwrap();
        registry
            .register(
                EventType::RiskAlert,
                recording_handler(log.clone(), "victim"),
                "risk",
                "victim",
                HandlerPriority::Normal,
            )
            .await
            .unwrap();

        let in_flight = tokio::spawn({
            let registry = registry.clone();
            async move { registry.dispatch(event(EventType::RiskAlert)).await }
        });

        // The dispatch snapshot now includes both handlers and is parked
        // on the gate. Unregistering must still keep the victim from
        // running when the dispatch resumes.
        entered.notified().await;
        assert!(registry.unregister("victim").await);
        release.notify_one();

        let result = in_flight.await.unwrap();
        assert!(log.lock().await.is_empty());
        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(result.outcomes[0].handler_id, "gate");
    }

    #[tokio::test]
    async fn test_stats_aggregation() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        registry
            .register(
                EventType::OrderFailed,
                recording_handler(log.clone(), "ok"),
                "executor",
                "h_ok",
                HandlerPriority::Normal,
            )
            .await
            .unwrap();
        registry
            .register(
                EventType::OrderFailed,
                failing_handler("db down"),
                "executor",
                "h_fail",
                HandlerPriority::Normal,
            )
            .await
            .unwrap();

        registry.dispatch(event(EventType::OrderFailed)).await;
        registry.dispatch(event(EventType::OrderFailed)).await;

        let stats = registry.get_stats().await;
        assert_eq!(stats.total_handlers, 2);
        assert_eq!(stats.total_invocations, 4);
        assert_eq!(stats.total_errors, 2);
        assert!((stats.error_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.handlers_by_event["order_failed"], 2);
    }

    #[tokio::test]
    async fn test_failed_outcome_reaches_dead_letter() {
        let dlq = Arc::new(DeadLetterQueue::new(8));
        let registry = HandlerRegistry::with_dead_letter(dlq.clone());
        registry
            .register(
                EventType::OrderFailed,
                failing_handler("venue rejected"),
                "executor",
                "h_fail",
                HandlerPriority::Normal,
            )
            .await
            .unwrap();

        let dispatched = event(EventType::OrderFailed);
        let message_id = dispatched.message_id.clone();
        registry.dispatch(dispatched).await;

        let entries = dlq.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event.message_id, message_id);
        assert_eq!(entries[0].error, "venue rejected");
    }
}
