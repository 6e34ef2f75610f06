//! In-memory [`EventStore`] implementation.
//!
//! A bounded map with insertion-order eviction and TTL cleanup.  Suitable
//! for a single-process deployment; swap in an externalized implementation
//! of the trait for anything that must survive restarts.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::models::{Event, EventFilter, EventMetrics, EventStatus};
use crate::repository::EventStore;

/// Default ceiling on retained events before oldest-first eviction.
pub const DEFAULT_MAX_EVENTS: usize = 10_000;

struct Inner {
    events: HashMap<String, Event>,
    /// Insertion order, oldest first.  Drives capacity eviction.
    order: VecDeque<String>,
}

pub struct InMemoryEventStore {
    inner: RwLock<Inner>,
    max_events: usize,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that retains at most `max_events` entries; the oldest
    /// entry is evicted when the ceiling is hit.
    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            inner: RwLock::new(Inner { events: HashMap::new(), order: VecDeque::new() }),
            max_events: max_events.max(1),
        }
    }

    /// Number of retained events (test and status-endpoint helper).
    pub async fn len(&self) -> usize {
        self.inner.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn put(&self, event: Event) -> Result<String, StoreError> {
        let id = event.id.clone();
        let mut inner = self.inner.write().await;

        if inner.events.len() >= self.max_events {
            if let Some(oldest) = inner.order.pop_front() {
                inner.events.remove(&oldest);
                warn!(evicted = %oldest, "event store at capacity; evicted oldest event");
            }
        }

        inner.order.push_back(id.clone());
        inner.events.insert(id.clone(), event);
        Ok(id)
    }

    async fn update_status(
        &self,
        id: &str,
        status: EventStatus,
        error: Option<String>,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Event, StoreError> {
        let mut inner = self.inner.write().await;
        let event = inner
            .events
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if event.status.is_terminal() {
            return Err(StoreError::TerminalStatus {
                id: id.to_string(),
                status: event.status,
                requested: status,
            });
        }

        if status == EventStatus::Processing {
            event.attempts += 1;
        }
        event.status = status;
        event.last_processed_at = Some(Utc::now());
        event.last_error = if status == EventStatus::Processed { None } else { error };

        if let Some(extra) = metadata {
            for (k, v) in extra {
                event.metadata.insert(k, v);
            }
        }

        debug!(event_id = %id, status = %status, attempts = event.attempts, "event status updated");
        Ok(event.clone())
    }

    async fn get(&self, id: &str) -> Result<Event, StoreError> {
        self.inner
            .read()
            .await
            .events
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn query(&self, limit: usize, filter: EventFilter) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read().await;
        let mut matched: Vec<Event> =
            inner.events.values().filter(|e| filter.matches(e)).cloned().collect();
        matched.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn metrics(&self, timeframe: Duration) -> Result<EventMetrics, StoreError> {
        let cutoff = Utc::now() - timeframe;
        let inner = self.inner.read().await;

        let mut metrics = EventMetrics::default();
        let mut processed = 0u64;
        let mut failed = 0u64;
        let mut latency_sum_ms = 0f64;
        let mut latency_count = 0u64;

        for event in inner.events.values().filter(|e| e.received_at >= cutoff) {
            metrics.total += 1;
            *metrics.by_type.entry(event.event_type.clone()).or_insert(0) += 1;
            *metrics.by_status.entry(event.status.to_string()).or_insert(0) += 1;
            *metrics.by_source.entry(event.source.to_string()).or_insert(0) += 1;

            match event.status {
                EventStatus::Processed => processed += 1,
                EventStatus::Failed | EventStatus::FailedPermanently => failed += 1,
                _ => {}
            }

            if let Some(latency) = event.processing_latency() {
                latency_sum_ms += latency.num_milliseconds() as f64;
                latency_count += 1;
            }
        }

        let completed = processed + failed;
        if completed > 0 {
            metrics.success_rate = Some(processed as f64 / completed as f64);
            metrics.error_rate = Some(failed as f64 / completed as f64);
        }
        if latency_count > 0 {
            metrics.avg_processing_ms = Some(latency_sum_ms / latency_count as f64);
        }
        Ok(metrics)
    }

    async fn cleanup(&self, max_age: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - max_age;
        let mut inner = self.inner.write().await;

        let expired: Vec<String> = inner
            .events
            .values()
            .filter(|e| e.received_at < cutoff)
            .map(|e| e.id.clone())
            .collect();

        for id in &expired {
            inner.events.remove(id);
        }
        inner.order.retain(|id| !expired.contains(id));

        if !expired.is_empty() {
            debug!(evicted = expired.len(), "event store TTL cleanup");
        }
        Ok(expired.len())
    }
}
