//! Webhook signature verification.
//!
//! All three producer profiles share one primitive,
//! `hex(HMAC_SHA256(secret, signing_string))`; they differ in signing
//! string, wire format, and replay window:
//!
//! | profile       | signing string        | wire format        | window |
//! |---------------|-----------------------|--------------------|--------|
//! | source-host   | body                  | `sha256=<hex>`     | none   |
//! | issue-tracker | `body + "." + ts`     | `<hex>`            | 5 min  |
//! | agent         | `body + "." + ts`     | `agent-<hex>`      | 10 min |
//!
//! The issue-tracker format deliberately has no `sha256=` prefix — the
//! existing producer signs without it.  Comparison is constant time; the
//! body must reach here byte-exact from the transport.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use store::EventSource;

use crate::config::IngressConfig;

type HmacSha256 = Hmac<Sha256>;

/// Replay window for issue-tracker timestamps.
const ISSUE_TRACKER_WINDOW_MS: i64 = 5 * 60 * 1000;
/// Replay window for agent timestamps.
const AGENT_WINDOW_MS: i64 = 10 * 60 * 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,

    #[error("signature mismatch")]
    Invalid,

    #[error("timestamp missing or outside replay window")]
    TimestampExpired,

    #[error("no webhook secret configured for this source")]
    MissingSecret,
}

pub struct SignatureVerifier {
    source_host_secret: Option<String>,
    issue_tracker_secret: Option<String>,
    agent_secret: Option<String>,
    allow_unverified: bool,
}

impl SignatureVerifier {
    pub fn from_config(config: &IngressConfig) -> Self {
        Self {
            source_host_secret: config.source_host_secret.clone(),
            issue_tracker_secret: config.issue_tracker_secret.clone(),
            agent_secret: config.agent_secret.clone(),
            allow_unverified: config.allow_unverified,
        }
    }

    /// Verify a request body against its signature header.
    ///
    /// `timestamp` is the raw millisecond header value where the profile
    /// consumes one.
    pub fn verify(
        &self,
        source: EventSource,
        body: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
    ) -> Result<(), SignatureError> {
        if self.allow_unverified {
            return Ok(());
        }

        let secret = self.secret_for(source).ok_or(SignatureError::MissingSecret)?;
        let provided = signature.ok_or(SignatureError::Missing)?;

        let ts = match source {
            EventSource::SourceHost => None,
            EventSource::IssueTracker => {
                Some(check_window(timestamp, ISSUE_TRACKER_WINDOW_MS)?)
            }
            EventSource::Agent => Some(check_window(timestamp, AGENT_WINDOW_MS)?),
        };

        let expected = wire_signature(source, secret, body, ts.as_deref());
        if expected.as_bytes().ct_eq(provided.as_bytes()).into() {
            Ok(())
        } else {
            Err(SignatureError::Invalid)
        }
    }

    fn secret_for(&self, source: EventSource) -> Option<&str> {
        match source {
            EventSource::SourceHost => self.source_host_secret.as_deref(),
            EventSource::IssueTracker => self.issue_tracker_secret.as_deref(),
            EventSource::Agent => self.agent_secret.as_deref(),
        }
    }
}

/// The exact header value a producer sends for the given inputs.  Shared
/// by verification and by the test suites.
pub fn wire_signature(
    source: EventSource,
    secret: &str,
    body: &[u8],
    timestamp: Option<&str>,
) -> String {
    let digest = hex::encode(hmac_digest(secret, body, timestamp));
    match source {
        EventSource::SourceHost => format!("sha256={digest}"),
        EventSource::IssueTracker => digest,
        EventSource::Agent => format!("agent-{digest}"),
    }
}

/// `HMAC_SHA256(secret, body)` or `HMAC_SHA256(secret, body + "." + ts)`.
fn hmac_digest(secret: &str, body: &[u8], timestamp: Option<&str>) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    if let Some(ts) = timestamp {
        mac.update(b".");
        mac.update(ts.as_bytes());
    }
    mac.finalize().into_bytes().to_vec()
}

/// Parse the timestamp header and enforce `|now - ts| <= window`.
fn check_window(timestamp: Option<&str>, window_ms: i64) -> Result<String, SignatureError> {
    let raw = timestamp.ok_or(SignatureError::TimestampExpired)?;
    let ts: i64 = raw.parse().map_err(|_| SignatureError::TimestampExpired)?;
    let now = Utc::now().timestamp_millis();
    if (now - ts).abs() > window_ms {
        return Err(SignatureError::TimestampExpired);
    }
    Ok(raw.to_string())
}
