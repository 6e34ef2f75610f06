//! Typed error type for the store crate.

use thiserror::Error;

use crate::models::EventStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    /// No event exists under the given id.
    #[error("event not found: '{0}'")]
    NotFound(String),

    /// The event is already in a terminal status; transitions out of it
    /// are rejected.
    #[error("event '{id}' is terminal ({status}); refusing transition to {requested}")]
    TerminalStatus {
        id: String,
        status: EventStatus,
        requested: EventStatus,
    },

    /// Backing-store failure (I/O, serialization, external engine).
    #[error("storage backend error: {0}")]
    Backend(String),
}
