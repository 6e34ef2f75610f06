//! API error taxonomy and its HTTP mapping.
//!
//! Every failure surfaces as JSON `{ "error": <category>, "message": ... }`
//! plus whatever correlation extras the category carries.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("signature header is missing")]
    MissingSignature,

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("timestamp missing or outside the replay window")]
    TimestampTooOld,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("rate limit exceeded")]
    RateLimited { retry_after_ms: u64, limit: u32, window_ms: u64 },

    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    fn category(&self) -> &'static str {
        match self {
            Self::MissingSignature => "MissingSignature",
            Self::InvalidSignature => "InvalidSignature",
            Self::TimestampTooOld => "TimestampTooOld",
            Self::Configuration(_) => "ConfigurationError",
            Self::RateLimited { .. } => "RateLimitExceeded",
            Self::Overloaded(_) => "Overloaded",
            Self::Unauthorized(_) => "Unauthorized",
            Self::NotFound(_) => "NotFound",
            Self::Validation(_) => "Validation",
            Self::Internal(_) => "Internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::MissingSignature | Self::InvalidSignature | Self::TimestampTooOld => {
                StatusCode::UNAUTHORIZED
            }
            Self::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.category(),
            "message": self.to_string(),
        });

        if let Self::RateLimited { retry_after_ms, limit, window_ms } = &self {
            body["retry_after_ms"] = json!(retry_after_ms);
            body["limit"] = json!(limit);
            body["window_ms"] = json!(window_ms);
        }
        // Internal detail stays in the logs, not on the wire.
        if let Self::Internal(detail) = &self {
            tracing::error!(detail, "internal error surfaced to client");
        }

        let mut response = (self.status(), Json(body)).into_response();
        if let Self::RateLimited { retry_after_ms, limit, window_ms } = &self {
            let headers = response.headers_mut();
            let seconds = (retry_after_ms / 1000).max(1);
            if let Ok(value) = seconds.to_string().parse() {
                headers.insert(header::RETRY_AFTER, value);
            }
            for (name, value) in [
                ("RateLimit-Limit", limit.to_string()),
                ("RateLimit-Remaining", "0".to_string()),
                ("RateLimit-Reset", retry_after_ms.to_string()),
                ("RateLimit-Window", window_ms.to_string()),
            ] {
                if let Ok(value) = value.parse() {
                    headers.insert(name, value);
                }
            }
        }
        response
    }
}

impl From<crate::signature::SignatureError> for ApiError {
    fn from(err: crate::signature::SignatureError) -> Self {
        use crate::signature::SignatureError;
        match err {
            SignatureError::Missing => Self::MissingSignature,
            SignatureError::Invalid => Self::InvalidSignature,
            SignatureError::TimestampExpired => Self::TimestampTooOld,
            SignatureError::MissingSecret => {
                Self::Configuration("webhook secret not configured".into())
            }
        }
    }
}

impl From<store::StoreError> for ApiError {
    fn from(err: store::StoreError) -> Self {
        match err {
            store::StoreError::NotFound(id) => Self::NotFound(id),
            store::StoreError::TerminalStatus { id, .. } => {
                Self::Validation(format!("event '{id}' is terminal"))
            }
            store::StoreError::Backend(message) => Self::Internal(message),
        }
    }
}

impl From<engine::EngineError> for ApiError {
    fn from(err: engine::EngineError) -> Self {
        match err {
            engine::EngineError::Overloaded { .. } => Self::Overloaded(err.to_string()),
            engine::EngineError::UnknownKind(kind) => {
                Self::NotFound(format!("workflow kind '{kind}'"))
            }
            engine::EngineError::NotFound(id) => Self::NotFound(id),
            engine::EngineError::InvalidContext { .. } => Self::Validation(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<processor::ProcessorError> for ApiError {
    fn from(err: processor::ProcessorError) -> Self {
        match err {
            processor::ProcessorError::Store(inner) => inner.into(),
            processor::ProcessorError::Terminal(id) => {
                Self::Validation(format!("event '{id}' is terminal"))
            }
            processor::ProcessorError::NoHandler(source) => {
                Self::Configuration(format!("no handler for source '{source}'"))
            }
        }
    }
}
