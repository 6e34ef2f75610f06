//! `processor` crate — at-least-once event dispatch with bounded retry.
//!
//! The processor routes stored events to per-source handlers.  Retryable
//! failures are rescheduled on the `1s, 5s, 15s` ladder up to three
//! attempts, after which the event is marked `failed_permanently` and
//! leaves the retry map.  Handlers must be idempotent by event id.

pub mod error;
pub mod handlers;
pub mod retry;

pub use error::{ProcessError, ProcessorError};
pub use handlers::{SourceHandler, WorkflowDispatchHandler};

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use bus::EventBus;
use store::{Event, EventSource, EventStatus, EventStore};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Total dispatch attempts before an event is permanently failed.
    /// Default 3.
    pub max_attempts: u32,
    /// Delay ladder between attempts.  Defaults to `1s, 5s, 15s`.
    pub retry_delays: Vec<Duration>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_attempts: retry::MAX_ATTEMPTS,
            retry_delays: retry::RETRY_DELAYS.to_vec(),
        }
    }
}

// ---------------------------------------------------------------------------
// EventProcessor
// ---------------------------------------------------------------------------

pub struct EventProcessor {
    store: Arc<dyn EventStore>,
    bus: EventBus,
    handlers: RwLock<HashMap<EventSource, Arc<dyn SourceHandler>>>,
    /// Events awaiting a scheduled retry, keyed by event id.
    retrying: RwLock<HashMap<String, u32>>,
    config: ProcessorConfig,
}

impl EventProcessor {
    pub fn new(store: Arc<dyn EventStore>, bus: EventBus, config: ProcessorConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            handlers: RwLock::new(HashMap::new()),
            retrying: RwLock::new(HashMap::new()),
            config,
        })
    }

    pub async fn register_handler(&self, source: EventSource, handler: Arc<dyn SourceHandler>) {
        self.handlers.write().await.insert(source, handler);
    }

    pub async fn retry_map_len(&self) -> usize {
        self.retrying.read().await.len()
    }

    /// Persist a freshly-ingested event and dispatch it in the background.
    pub async fn submit(self: &Arc<Self>, event: Event) -> Result<String, ProcessorError> {
        let id = self.store.put(event).await?;
        let this = self.clone();
        let dispatch_id = id.clone();
        tokio::spawn(async move {
            if let Err(err) = this.process(&dispatch_id).await {
                debug!(event_id = %dispatch_id, %err, "background dispatch ended with error");
            }
        });
        Ok(id)
    }

    /// Dispatch one event through its source handler.
    ///
    /// Safe to call repeatedly: a terminal event is a no-op.
    #[instrument(skip(self))]
    pub async fn process(self: &Arc<Self>, event_id: &str) -> Result<(), ProcessorError> {
        let event = self.store.get(event_id).await?;
        if event.status.is_terminal() {
            debug!(event_id, status = %event.status, "event already terminal; skipping");
            return Ok(());
        }

        // Marks processing and counts the attempt.
        let event = self
            .store
            .update_status(event_id, EventStatus::Processing, None, None)
            .await?;

        let handler = self.handlers.read().await.get(&event.source).cloned();
        let Some(handler) = handler else {
            self.store
                .update_status(
                    event_id,
                    EventStatus::Failed,
                    Some(format!("no handler for source '{}'", event.source)),
                    None,
                )
                .await?;
            self.publish_failed(event_id, "no handler registered", false).await;
            return Err(ProcessorError::NoHandler(event.source));
        };

        match handler.handle(&event).await {
            Ok(outcome) => {
                let mut metadata = serde_json::Map::new();
                metadata.insert("handler_outcome".into(), outcome);
                self.store
                    .update_status(event_id, EventStatus::Processed, None, Some(metadata))
                    .await?;
                self.retrying.write().await.remove(event_id);
                self.bus
                    .publish(
                        "event.processed",
                        json!({ "event_id": event_id, "source": event.source.to_string() }),
                        false,
                    )
                    .await;
                info!(event_id, attempts = event.attempts, "event processed");
                Ok(())
            }
            Err(err) if err.is_retryable() && event.attempts < self.config.max_attempts => {
                // Back to `received` while it waits on the retry ladder.
                self.store
                    .update_status(event_id, EventStatus::Received, Some(err.to_string()), None)
                    .await?;
                self.schedule_retry(event_id.to_string(), event.attempts).await;
                Ok(())
            }
            Err(err) => {
                let permanent = err.is_retryable();
                let status = if permanent {
                    // Retry budget exhausted.
                    EventStatus::FailedPermanently
                } else {
                    EventStatus::Failed
                };
                self.store
                    .update_status(event_id, status, Some(err.to_string()), None)
                    .await?;
                self.retrying.write().await.remove(event_id);
                self.publish_failed(event_id, &err.to_string(), permanent).await;
                warn!(event_id, attempts = event.attempts, %err, permanent, "event failed");
                Ok(())
            }
        }
    }

    /// Operator-forced immediate redispatch.  Terminal events are refused
    /// (the store never transitions them back).
    pub async fn retry_now(self: &Arc<Self>, event_id: &str) -> Result<(), ProcessorError> {
        let event = self.store.get(event_id).await?;
        if event.status.is_terminal() {
            return Err(ProcessorError::Terminal(event_id.to_string()));
        }
        self.retrying.write().await.remove(event_id);
        self.process(event_id).await
    }

    /// Drop a pending retry; the sleeping rescheduler checks the map before
    /// redispatching.  Returns whether a retry was pending.
    pub async fn cancel_pending_retry(&self, event_id: &str) -> bool {
        self.retrying.write().await.remove(event_id).is_some()
    }

    fn schedule_retry(
        self: &Arc<Self>,
        event_id: String,
        failed_attempt: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let delay = self
                .config
                .retry_delays
                .get((failed_attempt.max(1) as usize - 1).min(self.config.retry_delays.len() - 1))
                .copied()
                .unwrap_or_else(|| retry::delay_after_attempt(failed_attempt));

            self.retrying.write().await.insert(event_id.clone(), failed_attempt + 1);
            self.bus
                .publish(
                    "event.retry_scheduled",
                    json!({
                        "event_id": event_id,
                        "next_attempt": failed_attempt + 1,
                        "delay_ms": delay.as_millis() as u64,
                    }),
                    false,
                )
                .await;
            debug!(event_id = %event_id, next_attempt = failed_attempt + 1, ?delay, "retry scheduled");

            let weak: Weak<Self> = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(this) = weak.upgrade() else { return };
                // A cancelled retry leaves the map and must not redispatch.
                if this.retrying.read().await.contains_key(&event_id) {
                    if let Err(err) = this.process(&event_id).await {
                        debug!(event_id = %event_id, %err, "scheduled retry ended with error");
                    }
                }
            });
        })
    }

    async fn publish_failed(&self, event_id: &str, error: &str, permanent: bool) {
        self.bus
            .publish(
                "event.failed",
                json!({ "event_id": event_id, "error": error, "permanent": permanent }),
                false,
            )
            .await;
    }
}
