//! Liveness and observability endpoints.

use axum::extract::{Query, State};
use axum::Json;
use chrono::Duration;
use serde::Deserialize;
use serde_json::{json, Value};

use store::{EventFilter, EventStore};

use crate::error::ApiError;
use crate::AppState;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Overall health plus headline metrics.
pub async fn overview(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let events = state.store.metrics(Duration::hours(24)).await?;
    let validations = match &state.executor {
        Some(executor) => serde_json::to_value(executor.metrics().await)
            .unwrap_or(Value::Null),
        None => Value::Null,
    };

    Ok(Json(json!({
        "status": "ok",
        "events": events,
        "workflows": {
            "active": state.engine.active_count().await,
        },
        "validations": validations,
    })))
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub timeframe: Option<String>,
}

pub async fn metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<Value>, ApiError> {
    let timeframe = parse_timeframe(query.timeframe.as_deref().unwrap_or("24h"))?;
    let metrics = state.store.metrics(timeframe).await?;
    Ok(Json(json!({ "timeframe_ms": timeframe.num_milliseconds(), "metrics": metrics })))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

/// Recent events with a one-line summary each.
pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(20).min(200);
    let events = state.store.query(limit, EventFilter::default()).await?;

    let summaries: Vec<Value> = events
        .iter()
        .map(|e| {
            json!({
                "id": e.id,
                "source": e.source,
                "type": e.event_type,
                "status": e.status,
                "attempts": e.attempts,
                "received_at": e.received_at,
            })
        })
        .collect();

    Ok(Json(json!({ "count": summaries.len(), "events": summaries })))
}

/// Non-secret feature flags.
pub async fn config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "features": state.config.feature_flags() }))
}

/// `"24h"`, `"30m"`, `"7d"`, `"90s"`.
fn parse_timeframe(raw: &str) -> Result<Duration, ApiError> {
    let raw = raw.trim();
    let unit = raw
        .chars()
        .last()
        .ok_or_else(|| ApiError::Validation(format!("invalid timeframe '{raw}'")))?;
    let number = &raw[..raw.len() - unit.len_utf8()];
    let quantity: i64 = number
        .parse()
        .map_err(|_| ApiError::Validation(format!("invalid timeframe '{raw}'")))?;
    if quantity <= 0 {
        return Err(ApiError::Validation(format!("invalid timeframe '{raw}'")));
    }

    let duration = match unit {
        's' => Duration::try_seconds(quantity),
        'm' => Duration::try_minutes(quantity),
        'h' => Duration::try_hours(quantity),
        'd' => Duration::try_days(quantity),
        _ => return Err(ApiError::Validation(format!("invalid timeframe unit in '{raw}'"))),
    };
    duration.ok_or_else(|| ApiError::Validation(format!("timeframe out of range '{raw}'")))
}
