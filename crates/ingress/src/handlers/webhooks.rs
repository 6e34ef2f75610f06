//! Webhook ingest and operator routes.
//!
//! Ingest order matters: rate limit first, then signature verification over
//! the raw bytes, and only then JSON parsing.  A valid per-source signature
//! is sufficient auth on the ingest routes; the operator routes require
//! webhook auth (API key, bearer token, or the agent internal key).

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{AppendHeaders, IntoResponse};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use store::{Event, EventFilter, EventSource, EventStore};

use crate::auth;
use crate::error::ApiError;
use crate::ratelimit::RateDecision;
use crate::AppState;

type RateHeaders = AppendHeaders<[(&'static str, String); 4]>;

fn rate_headers(decision: &RateDecision) -> RateHeaders {
    AppendHeaders([
        ("RateLimit-Limit", decision.limit.to_string()),
        ("RateLimit-Remaining", decision.remaining.to_string()),
        ("RateLimit-Reset", decision.reset_ms.to_string()),
        ("RateLimit-Window", decision.window_ms.to_string()),
    ])
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

pub async fn ingest_source_host(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    ingest(state, EventSource::SourceHost, headers, body).await
}

pub async fn ingest_issue_tracker(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    ingest(state, EventSource::IssueTracker, headers, body).await
}

pub async fn ingest_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    ingest(state, EventSource::Agent, headers, body).await
}

async fn ingest(
    state: AppState,
    source: EventSource,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, RateHeaders, Json<Value>), ApiError> {
    let auth = auth::authenticate(&headers, &state.config);
    let tier = auth::resolve_tier(&auth, true);
    let client = auth::client_id(&headers, &auth);

    let decision = state.limiter.check(tier, &client).await;
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            retry_after_ms: decision.retry_after_ms.unwrap_or(1000),
            limit: decision.limit,
            window_ms: decision.window_ms,
        });
    }

    // Raw bytes, untouched, up to this point.
    let (signature, timestamp) = signature_headers(source, &headers);
    state.verifier.verify(source, &body, signature, timestamp)?;

    if source == EventSource::Agent && !auth::internal_key_ok(&headers, &state.config) {
        return Err(ApiError::Unauthorized("internal key mismatch".into()));
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|err| ApiError::Validation(format!("body is not valid JSON: {err}")))?;

    let event_type = event_type_of(source, &headers, &payload)?;
    let mut event = Event::new(source, event_type, payload);
    // Marker only; the signature itself is never persisted.
    event.metadata.insert("signature_checked".into(), json!(signature.is_some()));
    if let Some(delivery) = header_str(&headers, "x-delivery") {
        event.metadata.insert("delivery_id".into(), json!(delivery));
    }

    let event_id = state.processor.submit(event).await?;
    debug!(%event_id, source = %source, "webhook accepted");

    Ok((
        StatusCode::OK,
        rate_headers(&decision),
        Json(json!({ "event_id": event_id, "status": "received" })),
    ))
}

fn signature_headers(
    source: EventSource,
    headers: &HeaderMap,
) -> (Option<&str>, Option<&str>) {
    match source {
        EventSource::SourceHost => (header_str(headers, "x-signature-256"), None),
        EventSource::IssueTracker => {
            (header_str(headers, "signature"), header_str(headers, "timestamp"))
        }
        EventSource::Agent => {
            (header_str(headers, "x-signature"), header_str(headers, "x-timestamp"))
        }
    }
}

fn event_type_of(
    source: EventSource,
    headers: &HeaderMap,
    payload: &Value,
) -> Result<String, ApiError> {
    match source {
        EventSource::SourceHost | EventSource::Agent => header_str(headers, "x-event")
            .map(str::to_owned)
            .ok_or_else(|| ApiError::Validation("missing X-Event header".into())),
        EventSource::IssueTracker => Ok(payload
            .get("type")
            .or_else(|| payload.get("action"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned()),
    }
}

// ---------------------------------------------------------------------------
// Agent operator routes
// ---------------------------------------------------------------------------

fn require_webhook_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let auth = auth::authenticate(headers, &state.config);
    let internal = state.config.agent_internal_key.is_some()
        && auth::internal_key_ok(headers, &state.config);
    if auth.is_webhook_authorized() || internal {
        Ok(())
    } else {
        Err(ApiError::Unauthorized("webhook auth required".into()))
    }
}

pub async fn agent_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    require_webhook_auth(&state, &headers)?;

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|err| ApiError::Validation(format!("body is not valid JSON: {err}")))?;
    let event = Event::new(EventSource::Agent, "status", payload);
    let event_id = state.processor.submit(event).await?;

    Ok(Json(json!({ "event_id": event_id, "status": "accepted" })))
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub kind: String,
    #[serde(default)]
    pub context: Value,
}

/// Manually start a workflow, bypassing event routing.
pub async fn trigger_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    require_webhook_auth(&state, &headers)?;

    let request: TriggerRequest = serde_json::from_slice(&body)
        .map_err(|err| ApiError::Validation(format!("invalid trigger request: {err}")))?;

    let workflow = state.engine.create(&request.kind, request.context).await?;
    let workflow_id = workflow.id.clone();
    let engine = state.engine.clone();
    let spawned = workflow_id.clone();
    tokio::spawn(async move {
        let _ = engine.execute(&spawned).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "workflow_id": workflow_id, "kind": request.kind, "status": "started" })),
    ))
}

// ---------------------------------------------------------------------------
// Debug + forced retry
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DebugEventsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub event_type: Option<String>,
}

pub async fn debug_events(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Query(query): Query<DebugEventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let source: EventSource = source
        .parse()
        .map_err(|_| ApiError::NotFound(format!("unknown source '{source}'")))?;

    let limit = query.limit.unwrap_or(20).min(200);
    let offset = query.offset.unwrap_or(0);
    let filter = EventFilter {
        source: Some(source),
        event_type: query.event_type,
        ..Default::default()
    };

    let events = state.store.query(limit + offset, filter).await?;
    let page: Vec<Value> = events
        .into_iter()
        .skip(offset)
        .map(|e| {
            json!({
                "id": e.id,
                "type": e.event_type,
                "status": e.status,
                "attempts": e.attempts,
                "received_at": e.received_at,
                "last_error": e.last_error,
            })
        })
        .collect();

    Ok(Json(json!({ "source": source.to_string(), "count": page.len(), "events": page })))
}

pub async fn force_retry(
    State(state): State<AppState>,
    Path((_source, event_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_webhook_auth(&state, &headers)?;
    state.processor.retry_now(&event_id).await?;
    Ok(Json(json!({ "event_id": event_id, "status": "retry_dispatched" })))
}
