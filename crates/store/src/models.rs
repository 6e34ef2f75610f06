//! Core event models for the ingress pipeline.
//!
//! These types are the source of truth for what a persisted webhook event
//! looks like in memory.  They serialize cleanly to JSON for the status
//! endpoints and for externalized store implementations.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EventSource
// ---------------------------------------------------------------------------

/// Which external producer delivered the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    SourceHost,
    IssueTracker,
    Agent,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceHost => write!(f, "source_host"),
            Self::IssueTracker => write!(f, "issue_tracker"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

impl std::str::FromStr for EventSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source_host" => Ok(Self::SourceHost),
            "issue_tracker" => Ok(Self::IssueTracker),
            "agent" => Ok(Self::Agent),
            other => Err(format!("unknown event source: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// EventStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a persisted event.
///
/// Transition rules (enforced by the store):
/// - `Processed`, `Failed` and `FailedPermanently` are terminal.
/// - `attempts` only ever increases.
/// - `Processed` clears `last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Received,
    Processing,
    Processed,
    Failed,
    FailedPermanently,
}

impl EventStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed | Self::FailedPermanently)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Received => write!(f, "received"),
            Self::Processing => write!(f, "processing"),
            Self::Processed => write!(f, "processed"),
            Self::Failed => write!(f, "failed"),
            Self::FailedPermanently => write!(f, "failed_permanently"),
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A persisted ingress event.
///
/// Raw request bytes and signatures are never stored; `payload` is the
/// parsed JSON view and `metadata` carries a `signature_checked` marker
/// instead of the signature itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Opaque unique id, monotonic-ish (`evt_<millis>_<8hex>`).
    pub id: String,
    pub source: EventSource,
    /// Source-qualified event type, e.g. `source_host.push`.
    pub event_type: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub status: EventStatus,
    /// Number of dispatch attempts made by the processor.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    /// Create a freshly-received event with a new id.
    pub fn new(source: EventSource, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: new_event_id(),
            source,
            event_type: event_type.into(),
            payload,
            received_at: Utc::now(),
            status: EventStatus::Received,
            attempts: 0,
            last_error: None,
            last_processed_at: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Time spent from ingress to the last processor touch, if any.
    pub fn processing_latency(&self) -> Option<Duration> {
        self.last_processed_at.map(|t| t - self.received_at)
    }
}

/// `evt_<unix_millis>_<8 hex chars>` — sortable by creation time, unique
/// enough for an in-process store.
pub fn new_event_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix: String = (0..8)
        .map(|_| {
            let n: u8 = rand::thread_rng().gen_range(0..16);
            char::from_digit(n as u32, 16).unwrap_or('0')
        })
        .collect();
    format!("evt_{millis}_{suffix}")
}

// ---------------------------------------------------------------------------
// EventFilter
// ---------------------------------------------------------------------------

/// Filters accepted by [`crate::EventStore::query`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub source: Option<EventSource>,
    pub event_type: Option<String>,
    pub status: Option<EventStatus>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(source) = self.source {
            if event.source != source {
                return false;
            }
        }
        if let Some(ref event_type) = self.event_type {
            if &event.event_type != event_type {
                return false;
            }
        }
        if let Some(status) = self.status {
            if event.status != status {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// EventMetrics
// ---------------------------------------------------------------------------

/// Aggregated counts over a timeframe, served by the status endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMetrics {
    pub total: u64,
    pub by_type: std::collections::HashMap<String, u64>,
    pub by_status: std::collections::HashMap<String, u64>,
    pub by_source: std::collections::HashMap<String, u64>,
    /// `processed / (processed + failed + failed_permanently)`, when any
    /// event has completed.
    pub success_rate: Option<f64>,
    pub error_rate: Option<f64>,
    /// Mean of `last_processed_at - received_at` across touched events.
    pub avg_processing_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ids_are_prefixed_and_unique() {
        let a = new_event_id();
        let b = new_event_id();
        assert!(a.starts_with("evt_"));
        assert_ne!(a, b);
    }

    #[test]
    fn terminal_statuses() {
        assert!(EventStatus::Processed.is_terminal());
        assert!(EventStatus::Failed.is_terminal());
        assert!(EventStatus::FailedPermanently.is_terminal());
        assert!(!EventStatus::Received.is_terminal());
        assert!(!EventStatus::Processing.is_terminal());
    }

    #[test]
    fn filter_matches_on_all_axes() {
        let event = Event::new(
            EventSource::SourceHost,
            "source_host.push",
            serde_json::json!({"ref": "main"}),
        );

        let all = EventFilter::default();
        assert!(all.matches(&event));

        let by_source = EventFilter { source: Some(EventSource::Agent), ..Default::default() };
        assert!(!by_source.matches(&event));

        let by_type = EventFilter {
            event_type: Some("source_host.push".into()),
            ..Default::default()
        };
        assert!(by_type.matches(&event));

        let by_status = EventFilter { status: Some(EventStatus::Processed), ..Default::default() };
        assert!(!by_status.matches(&event));
    }

    #[test]
    fn source_round_trips_through_strings() {
        for source in [EventSource::SourceHost, EventSource::IssueTracker, EventSource::Agent] {
            let s = source.to_string();
            assert_eq!(s.parse::<EventSource>().unwrap(), source);
        }
    }
}
