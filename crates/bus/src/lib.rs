//! `bus` crate — in-process pub/sub for lifecycle notifications.
//!
//! Listeners register per event type with a priority and optional timeout;
//! delivery within one publish is strictly priority-desc, registration-asc.
//! Asynchronous publishes are queued and drained FIFO by a background
//! worker.  A failing or timing-out listener never prevents its siblings
//! from running.

pub mod error;

pub use error::BusError;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Identifier handed back by `subscribe`; also encodes registration order.
pub type ListenerId = u64;

type ListenerFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type ListenerFn = Arc<dyn Fn(PublishedEvent) -> ListenerFuture + Send + Sync>;

/// A single published event as seen by listeners and the history buffer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PublishedEvent {
    pub event_type: String,
    pub data: Value,
    pub published_at: DateTime<Utc>,
}

struct Listener {
    id: ListenerId,
    callback: ListenerFn,
    priority: i32,
    once: bool,
    timeout: Option<Duration>,
}

/// Registration options.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOpts {
    /// Higher priority listeners run first.
    pub priority: i32,
    /// Deregister after the first invocation, successful or not.
    pub once: bool,
    /// Bound each invocation; expiry is recorded as a listener error.
    pub timeout: Option<Duration>,
}

/// Closed configuration with documented defaults.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Hard cap on listeners per event type.  Default 100.
    pub max_listeners_per_type: usize,
    /// History ring-buffer size.  Default 1000.
    pub history_capacity: usize,
    /// Interval at which the background worker drains the async queue.
    /// Default 10 ms.
    pub drain_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_listeners_per_type: 100,
            history_capacity: 1000,
            drain_interval: Duration::from_millis(10),
        }
    }
}

struct Inner {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
    queue: Mutex<VecDeque<PublishedEvent>>,
    history: Mutex<VecDeque<PublishedEvent>>,
    next_id: AtomicU64,
    config: BusConfig,
}

/// Cheaply cloneable handle to the shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    /// Create the bus and spawn its queue-drain worker.  The worker holds a
    /// weak handle and exits once every `EventBus` clone is dropped.
    pub fn new(config: BusConfig) -> Self {
        let inner = Arc::new(Inner {
            listeners: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            history: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            config,
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let interval = inner.config.drain_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let bus = EventBus { inner };
                bus.drain_queue().await;
            }
        });

        Self { inner }
    }

    /// Register a listener for `event_type`.
    pub async fn subscribe<F, Fut>(
        &self,
        event_type: &str,
        opts: SubscribeOpts,
        callback: F,
    ) -> Result<ListenerId, BusError>
    where
        F: Fn(PublishedEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let mut listeners = self.inner.listeners.write().await;
        let entry = listeners.entry(event_type.to_string()).or_default();

        if entry.len() >= self.inner.config.max_listeners_per_type {
            return Err(BusError::ListenerLimit {
                event_type: event_type.to_string(),
                limit: self.inner.config.max_listeners_per_type,
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        entry.push(Listener {
            id,
            callback: Arc::new(move |event| Box::pin(callback(event))),
            priority: opts.priority,
            once: opts.once,
            timeout: opts.timeout,
        });
        Ok(id)
    }

    /// Register a listener that fires exactly once.
    pub async fn subscribe_once<F, Fut>(
        &self,
        event_type: &str,
        mut opts: SubscribeOpts,
        callback: F,
    ) -> Result<ListenerId, BusError>
    where
        F: Fn(PublishedEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        opts.once = true;
        self.subscribe(event_type, opts, callback).await
    }

    /// Remove one listener; returns whether it existed.
    pub async fn unsubscribe(&self, event_type: &str, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write().await;
        if let Some(entry) = listeners.get_mut(event_type) {
            let before = entry.len();
            entry.retain(|l| l.id != id);
            return entry.len() < before;
        }
        false
    }

    /// Remove every listener for `event_type`.
    pub async fn clear(&self, event_type: &str) {
        self.inner.listeners.write().await.remove(event_type);
    }

    pub async fn listener_count(&self, event_type: &str) -> usize {
        self.inner
            .listeners
            .read()
            .await
            .get(event_type)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Publish an event.  With `is_async` the event is enqueued and this
    /// call returns immediately; otherwise listeners run before returning.
    pub async fn publish(&self, event_type: &str, data: Value, is_async: bool) {
        let event = PublishedEvent {
            event_type: event_type.to_string(),
            data,
            published_at: Utc::now(),
        };

        {
            let mut history = self.inner.history.lock().await;
            if history.len() >= self.inner.config.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        if is_async {
            self.inner.queue.lock().await.push_back(event);
        } else {
            self.deliver(event).await;
        }
    }

    /// Most recent published events, newest last, at most `limit`.
    pub async fn history(&self, limit: usize) -> Vec<PublishedEvent> {
        let history = self.inner.history.lock().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    async fn drain_queue(&self) {
        loop {
            let next = self.inner.queue.lock().await.pop_front();
            match next {
                Some(event) => self.deliver(event).await,
                None => break,
            }
        }
    }

    /// Invoke every listener for the event, priority-desc then
    /// registration-asc.  The listener table lock is NOT held across
    /// callbacks; a snapshot is taken first.
    async fn deliver(&self, event: PublishedEvent) {
        let snapshot: Vec<(ListenerId, ListenerFn, Option<Duration>, bool)> = {
            let listeners = self.inner.listeners.read().await;
            let Some(entry) = listeners.get(&event.event_type) else { return };
            let mut ordered: Vec<&Listener> = entry.iter().collect();
            // Stable by registration id within equal priorities.
            ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
            ordered
                .into_iter()
                .map(|l| (l.id, l.callback.clone(), l.timeout, l.once))
                .collect()
        };

        let mut spent: Vec<ListenerId> = Vec::new();

        for (id, callback, timeout, once) in snapshot {
            let fut = callback(event.clone());
            let outcome = match timeout {
                Some(limit) => {
                    // Child task so an expired listener can be cancelled
                    // without blocking the rest of the delivery.
                    let mut handle = tokio::spawn(fut);
                    match tokio::time::timeout(limit, &mut handle).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(join_err)) => Err(format!("listener panicked: {join_err}")),
                        Err(_) => {
                            handle.abort();
                            Err(format!("listener timed out after {limit:?}"))
                        }
                    }
                }
                None => fut.await,
            };

            if let Err(message) = outcome {
                // Listener failures are isolated; siblings still run.
                warn!(listener_id = id, event_type = %event.event_type, %message, "listener error");
            }
            if once {
                spent.push(id);
            }
        }

        if !spent.is_empty() {
            let mut listeners = self.inner.listeners.write().await;
            if let Some(entry) = listeners.get_mut(&event.event_type) {
                entry.retain(|l| !spent.contains(&l.id));
            }
            debug!(event_type = %event.event_type, removed = spent.len(), "one-shot listeners removed");
        }
    }
}
