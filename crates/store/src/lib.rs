//! `store` crate — event persistence layer.
//!
//! Provides the [`EventStore`] trait (the pluggable persistence contract for
//! ingress events), typed event models, and the in-memory implementation
//! used by default.  No business logic lives here; dispatch and retry
//! decisions belong to the `processor` crate.

pub mod error;
pub mod memory;
pub mod models;
pub mod repository;

pub use error::StoreError;
pub use memory::InMemoryEventStore;
pub use models::{Event, EventFilter, EventMetrics, EventSource, EventStatus};
pub use repository::EventStore;
