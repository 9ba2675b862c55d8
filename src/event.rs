//! # Event Model
//!
//! Events are the fundamental unit of communication between LEGION agents.
//! An [`Event`] is an immutable record of something that happened: a tagged
//! kind, an opaque payload, and the identifiers needed to trace it through
//! the system.
//!
//! ## Correlation Chains
//!
//! Every event carries a `correlation_id` linking causally related events
//! (one market tick, the signal derived from it, the order it produced).
//! A consumer that re-publishes a derived event must reuse the parent's
//! correlation id; [`Event::derived`] does this for you. Constructing an
//! event without an explicit correlation id starts a new chain.
//!
//! ## Wire Format
//!
//! Both broker implementations move events as JSON. Unknown fields are
//! ignored on deserialization so payload shapes can grow without breaking
//! older consumers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// All event kinds in the LEGION system.
///
/// The snake_case string form doubles as the broker channel name, so
/// producers and consumers agree on routing without sharing any code
/// beyond this enum.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Market data
    MarketDataReceived,
    DepthSnapshot,
    FundingUpdate,
    // Feature computation
    FeaturesComputed,
    IndicatorsUpdated,
    // Strategy
    SignalGenerated,
    CandidateTrade,
    // Backtesting
    BacktestComplete,
    BacktestResult,
    // Risk management
    TradeApproved,
    TradeRejected,
    RiskAlert,
    // Execution
    OrderExecuted,
    OrderFailed,
    PositionUpdated,
    // Agent health
    AgentHeartbeat,
    AgentHealthCheck,
    AgentStatusUpdate,
    // System lifecycle
    AgentReady,
    AgentError,
    SystemShutdown,
}

impl EventType {
    /// Canonical broker channel for this event kind.
    pub fn channel(&self) -> String {
        self.to_string()
    }
}

/// Payload value type.
///
/// A closed JSON-like value so payloads stay opaque to the bus while still
/// round-tripping cleanly over the wire. Handlers extract only the fields
/// relevant to their event kind via the `as_*` accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

/// A single occurrence on the bus.
///
/// Immutable once constructed; consumers receive their own copy and must
/// not rely on shared state with the producer. Identity is the
/// `message_id`, which is also what equality compares.
///
/// ## Example
///
/// ```rust,no_run
/// use legion_bus::event::{Event, EventType, Value};
/// use std::collections::HashMap;
///
/// let mut payload = HashMap::new();
/// payload.insert("symbol".to_string(), Value::from("BTCUSDT"));
/// payload.insert("price".to_string(), Value::from(64250.5));
///
/// let event = Event::new(EventType::MarketDataReceived, payload, "market_scanner");
/// assert_eq!(event.channel(), "market_data_received");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Kind of event, which determines routing and handler selection
    pub event_type: EventType,
    /// Opaque payload as key-value pairs
    #[serde(default)]
    pub payload: HashMap<String, Value>,
    /// Name of the agent that produced the event
    pub source_agent: String,
    /// Creation time, set at construction
    pub timestamp: DateTime<Utc>,
    /// Links causally related events across a processing chain
    pub correlation_id: String,
    /// Globally unique identifier for logging and dedup
    pub message_id: String,
    /// Additional context (headers, tags); not interpreted by the bus
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Event {
    /// Creates an event starting a new correlation chain.
    pub fn new(event_type: EventType, payload: HashMap<String, Value>, source_agent: &str) -> Self {
        Self::with_correlation(
            event_type,
            payload,
            source_agent,
            &Uuid::new_v4().to_string(),
        )
    }

    /// Creates an event joining an existing correlation chain.
    pub fn with_correlation(
        event_type: EventType,
        payload: HashMap<String, Value>,
        source_agent: &str,
        correlation_id: &str,
    ) -> Self {
        Self {
            event_type,
            payload,
            source_agent: source_agent.to_string(),
            timestamp: Utc::now(),
            correlation_id: correlation_id.to_string(),
            message_id: Uuid::new_v4().to_string(),
            metadata: HashMap::new(),
        }
    }

    /// Creates an event caused by this one, inheriting its correlation id.
    pub fn derived(
        &self,
        event_type: EventType,
        payload: HashMap<String, Value>,
        source_agent: &str,
    ) -> Self {
        Self::with_correlation(event_type, payload, source_agent, &self.correlation_id)
    }

    /// Attaches a metadata entry. Consumes the event, so this is only
    /// usable while building, before the event is published.
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Broker channel this event is routed on.
    pub fn channel(&self) -> String {
        self.event_type.channel()
    }

    /// Serializes the event for broker transport.
    pub fn to_json(&self) -> EventResult<String> {
        serde_json::to_string(self).map_err(EventError::Serialize)
    }

    /// Deserializes an event from its wire form.
    pub fn from_json(raw: &str) -> EventResult<Self> {
        serde_json::from_str(raw).map_err(EventError::Deserialize)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.message_id == other.message_id
    }
}

impl Eq for Event {}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("event serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("event deserialization failed: {0}")]
    Deserialize(#[source] serde_json::Error),
}

pub type EventResult<T> = Result<T, EventError>;
