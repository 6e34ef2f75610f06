//! The [`EventStore`] trait — the pluggable persistence contract.
//!
//! The default implementation is [`crate::InMemoryEventStore`].  An
//! externalized implementation maps onto a single `events` table:
//!
//! ```text
//! id TEXT PK, source TEXT, type TEXT, status TEXT, attempts INT,
//! received_at TIMESTAMP, last_processed_at TIMESTAMP NULL,
//! last_error TEXT NULL, payload BLOB, metadata JSON
//! -- index on (source, type, status, received_at DESC)
//! ```

use async_trait::async_trait;
use chrono::Duration;

use crate::error::StoreError;
use crate::models::{Event, EventFilter, EventMetrics, EventStatus};

/// Persistence contract for ingress events.
///
/// Implementations must enforce the status invariants:
/// terminal statuses are frozen, `attempts` is non-decreasing, and
/// `Processed` clears `last_error`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a new event, returning its id.
    async fn put(&self, event: Event) -> Result<String, StoreError>;

    /// Transition an event's status, recording an error message and merging
    /// metadata.  A transition into `Processing` counts one attempt.
    async fn update_status(
        &self,
        id: &str,
        status: EventStatus,
        error: Option<String>,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Event, StoreError>;

    async fn get(&self, id: &str) -> Result<Event, StoreError>;

    /// Matching events in descending `received_at` order, at most `limit`.
    async fn query(&self, limit: usize, filter: EventFilter) -> Result<Vec<Event>, StoreError>;

    /// Aggregate counts over `[now - timeframe, now]`.
    async fn metrics(&self, timeframe: Duration) -> Result<EventMetrics, StoreError>;

    /// Evict events older than `max_age`; returns the number removed.
    async fn cleanup(&self, max_age: Duration) -> Result<usize, StoreError>;
}
