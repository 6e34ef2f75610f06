//! Bus-level error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    /// A single event type may carry at most `max_listeners_per_type`
    /// registrations.
    #[error("listener limit reached for '{event_type}' ({limit})")]
    ListenerLimit { event_type: String, limit: usize },
}
