//! Bounded in-memory dead-letter capture.
//!
//! When a handler fails during dispatch, the registry forwards a snapshot
//! of the event plus the error to the configured [`DeadLetterQueue`] so an
//! operator (or a supervising agent) can inspect and re-drive it. Storage
//! is in-memory only; when the queue is full the oldest entry is evicted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::event::Event;

/// One captured handler failure.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub dlq_id: String,
    pub event: Event,
    pub handler_id: String,
    pub error: String,
    pub captured_at: DateTime<Utc>,
}

pub struct DeadLetterQueue {
    capacity: usize,
    entries: Mutex<VecDeque<DlqEntry>>,
    evicted: AtomicU64,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            evicted: AtomicU64::new(0),
        }
    }

    /// Records a failed handler outcome, evicting the oldest entry when full.
    pub async fn capture(&self, event: &Event, handler_id: &str, error: &str) -> String {
        let entry = DlqEntry {
            dlq_id: Uuid::new_v4().to_string(),
            event: event.clone(),
            handler_id: handler_id.to_string(),
            error: error.to_string(),
            captured_at: Utc::now(),
        };
        let dlq_id = entry.dlq_id.clone();
        warn!(
            handler_id,
            event_type = %event.event_type,
            message_id = %event.message_id,
            dlq_id = %dlq_id,
            "event moved to dead-letter queue"
        );

        let mut entries = self.entries.lock().await;
        if entries.len() == self.capacity {
            entries.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        entries.push_back(entry);
        dlq_id
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Snapshot of the current entries, oldest first.
    pub async fn entries(&self) -> Vec<DlqEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    /// Removes and returns all entries, oldest first. The caller decides
    /// whether to re-publish, alert, or discard them.
    pub async fn drain(&self) -> Vec<DlqEntry> {
        self.entries.lock().await.drain(..).collect()
    }

    /// Entries dropped because the queue was at capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use std::collections::HashMap;

    fn event() -> Event {
        Event::new(EventType::TradeApproved, HashMap::new(), "risk_manager")
    }

    #[tokio::test]
    async fn test_capture_and_drain() {
        let dlq = DeadLetterQueue::new(10);
        dlq.capture(&event(), "h1", "boom").await;
        dlq.capture(&event(), "h2", "bust").await;
        assert_eq!(dlq.len().await, 2);

        let drained = dlq.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].handler_id, "h1");
        assert_eq!(drained[1].error, "bust");
        assert!(dlq.is_empty().await);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let dlq = DeadLetterQueue::new(2);
        dlq.capture(&event(), "h1", "a").await;
        dlq.capture(&event(), "h2", "b").await;
        dlq.capture(&event(), "h3", "c").await;

        let entries = dlq.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].handler_id, "h2");
        assert_eq!(dlq.evicted(), 1);
    }
}
