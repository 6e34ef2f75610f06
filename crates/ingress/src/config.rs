//! Closed configuration for the ingress surface.
//!
//! Secrets arrive through the environment at the binary edge; nothing in
//! here is ever serialized back out except through the redacted
//! `feature_flags` view.

use serde_json::json;

/// Per-source HMAC secrets plus auth material.
#[derive(Debug, Clone, Default)]
pub struct IngressConfig {
    pub source_host_secret: Option<String>,
    pub issue_tracker_secret: Option<String>,
    pub agent_secret: Option<String>,
    /// Optional constant-time-checked `X-Internal-Key` for agent calls.
    pub agent_internal_key: Option<String>,
    /// Accepted `X-Api-Key` values.
    pub api_keys: Vec<String>,
    /// Master key; grants admin tier.
    pub master_key: Option<String>,
    /// Shared secret for bearer-token verification.
    pub jwt_secret: Option<String>,
    /// Test-only bypass of signature verification.
    pub allow_unverified: bool,
}

impl IngressConfig {
    /// Non-secret view for `GET /status/config`.
    pub fn feature_flags(&self) -> serde_json::Value {
        json!({
            "source_host_signatures": self.source_host_secret.is_some(),
            "issue_tracker_signatures": self.issue_tracker_secret.is_some(),
            "agent_signatures": self.agent_secret.is_some(),
            "agent_internal_key": self.agent_internal_key.is_some(),
            "api_keys_configured": !self.api_keys.is_empty(),
            "jwt_auth": self.jwt_secret.is_some(),
        })
    }
}
