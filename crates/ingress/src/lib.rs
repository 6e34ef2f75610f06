//! `ingress` crate — HTTP surface for webhook ingest and status.
//!
//! Exposes:
//!   GET  /health
//!   GET  /status/ (+ /metrics, /events, /config)
//!   POST /webhooks/source_host | issue_tracker | agent   (signed)
//!   POST /webhooks/agent/status | /webhooks/agent/trigger (webhook auth)
//!   GET  /webhooks/:source/events                         (debug)
//!   POST /webhooks/:source/retry/:event_id                (webhook auth)

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ratelimit;
pub mod signature;

pub use config::IngressConfig;
pub use error::ApiError;
pub use ratelimit::{RateLimitConfig, RateLimiter, Tier};
pub use signature::{wire_signature, SignatureVerifier};

use std::future::Future;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use bus::EventBus;
use engine::WorkflowEngine;
use processor::EventProcessor;
use store::EventStore;
use validation::ValidationExecutor;

/// Request body ceiling; the raw bytes are buffered for signature checks.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub processor: Arc<EventProcessor>,
    pub engine: Arc<WorkflowEngine>,
    pub executor: Option<Arc<ValidationExecutor>>,
    pub bus: EventBus,
    pub verifier: Arc<SignatureVerifier>,
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<IngressConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let status_router = Router::new()
        .route("/", get(handlers::status::overview))
        .route("/metrics", get(handlers::status::metrics))
        .route("/events", get(handlers::status::events))
        .route("/config", get(handlers::status::config));

    Router::new()
        .route("/health", get(handlers::status::health))
        .nest("/status", status_router)
        .route("/webhooks/source_host", post(handlers::webhooks::ingest_source_host))
        .route("/webhooks/issue_tracker", post(handlers::webhooks::ingest_issue_tracker))
        .route("/webhooks/agent", post(handlers::webhooks::ingest_agent))
        .route("/webhooks/agent/status", post(handlers::webhooks::agent_status))
        .route("/webhooks/agent/trigger", post(handlers::webhooks::trigger_workflow))
        .route("/webhooks/:source/events", get(handlers::webhooks::debug_events))
        .route("/webhooks/:source/retry/:event_id", post(handlers::webhooks::force_retry))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves.
pub async fn serve(
    bind: &str,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("ingress listening on {}", listener.local_addr()?);

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}
