//! Request authentication: API keys, bearer tokens, and client identity.
//!
//! A valid per-source signature is itself sufficient auth on the webhook
//! ingest routes; these helpers cover everything else (admin/status calls,
//! manual triggers, forced retries).

use axum::http::HeaderMap;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::IngressConfig;
use crate::ratelimit::Tier;

/// Who the caller turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthContext {
    /// Master key or an admin-role bearer token.
    Admin { subject: String },
    /// Valid bearer token without the admin role.
    Authenticated { subject: String },
    /// Valid configured API key.
    ApiKey,
    Anonymous,
}

impl AuthContext {
    /// Satisfies "webhook auth" (API key, token, or better).
    pub fn is_webhook_authorized(&self) -> bool {
        !matches!(self, Self::Anonymous)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin { .. })
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    role: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

/// Resolve the caller from `X-Api-Key` / `Authorization: Bearer`.
pub fn authenticate(headers: &HeaderMap, config: &IngressConfig) -> AuthContext {
    if let Some(key) = header_str(headers, "x-api-key") {
        if let Some(master) = &config.master_key {
            if constant_time_eq(key, master) {
                return AuthContext::Admin { subject: "master-key".into() };
            }
        }
        if config.api_keys.iter().any(|candidate| constant_time_eq(key, candidate)) {
            return AuthContext::ApiKey;
        }
        return AuthContext::Anonymous;
    }

    if let Some(token) = bearer_token(headers) {
        if let Some(secret) = &config.jwt_secret {
            let key = DecodingKey::from_secret(secret.as_bytes());
            if let Ok(data) = decode::<Claims>(token, &key, &Validation::default()) {
                let subject = data.claims.sub.unwrap_or_else(|| "unknown".into());
                if data.claims.role.as_deref() == Some("admin") {
                    return AuthContext::Admin { subject };
                }
                return AuthContext::Authenticated { subject };
            }
        }
        return AuthContext::Anonymous;
    }

    AuthContext::Anonymous
}

/// Constant-time check of the agent `X-Internal-Key` header, when one is
/// configured.
pub fn internal_key_ok(headers: &HeaderMap, config: &IngressConfig) -> bool {
    match &config.agent_internal_key {
        None => true,
        Some(expected) => header_str(headers, "x-internal-key")
            .map(|provided| constant_time_eq(provided, expected))
            .unwrap_or(false),
    }
}

/// Rate-limit tier: admin → authenticated → webhook → default.
pub fn resolve_tier(auth: &AuthContext, is_webhook_route: bool) -> Tier {
    match auth {
        AuthContext::Admin { .. } => Tier::Admin,
        AuthContext::Authenticated { .. } => Tier::Authenticated,
        AuthContext::ApiKey => Tier::Webhook,
        AuthContext::Anonymous if is_webhook_route => Tier::Webhook,
        AuthContext::Anonymous => Tier::Default,
    }
}

/// Client identity for rate limiting: credential hash, else token subject,
/// else forwarded/remote address.
pub fn client_id(headers: &HeaderMap, auth: &AuthContext) -> String {
    if let Some(key) = header_str(headers, "x-api-key") {
        return format!("key:{}", short_hash(key));
    }
    if let Some(token) = bearer_token(headers) {
        if let AuthContext::Admin { subject } | AuthContext::Authenticated { subject } = auth {
            return format!("user:{subject}");
        }
        return format!("token:{}", short_hash(token));
    }
    header_str(headers, "x-forwarded-for")
        .map(|ip| ip.split(',').next().unwrap_or(ip).trim().to_string())
        .map(|ip| format!("ip:{ip}"))
        .unwrap_or_else(|| "ip:unknown".into())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "authorization")?.strip_prefix("Bearer ")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn config() -> IngressConfig {
        IngressConfig {
            api_keys: vec!["api-key-1".into()],
            master_key: Some("master-key".into()),
            jwt_secret: Some("jwt-secret".into()),
            agent_internal_key: Some("internal-key".into()),
            ..Default::default()
        }
    }

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, value.parse().unwrap());
        headers
    }

    fn token(sub: &str, role: Option<&str>, secret: &str) -> String {
        let exp = (chrono::Utc::now().timestamp() + 3600) as usize;
        let claims = json!({ "sub": sub, "role": role, "exp": exp });
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
            .unwrap()
    }

    #[test]
    fn api_key_paths() {
        let config = config();
        assert_eq!(
            authenticate(&headers_with("x-api-key", "api-key-1"), &config),
            AuthContext::ApiKey
        );
        assert!(authenticate(&headers_with("x-api-key", "master-key"), &config).is_admin());
        assert_eq!(
            authenticate(&headers_with("x-api-key", "wrong"), &config),
            AuthContext::Anonymous
        );
    }

    #[test]
    fn bearer_token_paths() {
        let config = config();

        let user = token("dev-1", None, "jwt-secret");
        let ctx = authenticate(
            &headers_with("authorization", &format!("Bearer {user}")),
            &config,
        );
        assert_eq!(ctx, AuthContext::Authenticated { subject: "dev-1".into() });

        let admin = token("ops-1", Some("admin"), "jwt-secret");
        let ctx = authenticate(
            &headers_with("authorization", &format!("Bearer {admin}")),
            &config,
        );
        assert!(ctx.is_admin());

        let forged = token("dev-1", Some("admin"), "other-secret");
        let ctx = authenticate(
            &headers_with("authorization", &format!("Bearer {forged}")),
            &config,
        );
        assert_eq!(ctx, AuthContext::Anonymous);
    }

    #[test]
    fn tier_resolution_order() {
        assert_eq!(resolve_tier(&AuthContext::Admin { subject: "a".into() }, true), Tier::Admin);
        assert_eq!(
            resolve_tier(&AuthContext::Authenticated { subject: "a".into() }, true),
            Tier::Authenticated
        );
        assert_eq!(resolve_tier(&AuthContext::ApiKey, false), Tier::Webhook);
        assert_eq!(resolve_tier(&AuthContext::Anonymous, true), Tier::Webhook);
        assert_eq!(resolve_tier(&AuthContext::Anonymous, false), Tier::Default);
    }

    #[test]
    fn client_id_prefers_credentials_over_address() {
        let auth = AuthContext::ApiKey;
        let id = client_id(&headers_with("x-api-key", "api-key-1"), &auth);
        assert!(id.starts_with("key:"));
        // Same key, same identity.
        assert_eq!(id, client_id(&headers_with("x-api-key", "api-key-1"), &auth));

        let anon = AuthContext::Anonymous;
        let id = client_id(&headers_with("x-forwarded-for", "10.1.2.3, 10.0.0.1"), &anon);
        assert_eq!(id, "ip:10.1.2.3");

        assert_eq!(client_id(&HeaderMap::new(), &anon), "ip:unknown");
    }

    #[test]
    fn internal_key_is_constant_time_checked() {
        let config = config();
        assert!(internal_key_ok(&headers_with("x-internal-key", "internal-key"), &config));
        assert!(!internal_key_ok(&headers_with("x-internal-key", "nope"), &config));
        assert!(!internal_key_ok(&HeaderMap::new(), &config));

        let unconfigured = IngressConfig::default();
        assert!(internal_key_ok(&HeaderMap::new(), &unconfigured));
    }
}
