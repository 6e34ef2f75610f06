//! Sliding-window rate limiting per `(tier, client)`.
//!
//! Each client keeps a timestamp sequence per tier; a call drops entries
//! older than the window, rejects when the remainder is at the limit, and
//! appends otherwise.  Webhook-tier calls additionally pass a short burst
//! window.  Decisions carry everything the `RateLimit-*` headers need.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// Tiers
// ---------------------------------------------------------------------------

/// Resolution order is admin → authenticated → webhook → default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Admin,
    Authenticated,
    Webhook,
    Default,
}

impl Tier {
    fn name(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Authenticated => "authenticated",
            Self::Webhook => "webhook",
            Self::Default => "default",
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub default_window: Duration,
    pub default_max: u32,
    pub webhook_window: Duration,
    pub webhook_max: u32,
    pub authenticated_window: Duration,
    pub authenticated_max: u32,
    pub admin_window: Duration,
    pub admin_max: u32,
    /// Short-window guard applied to every webhook-tier call.
    pub burst_window: Duration,
    pub burst_max: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_window: Duration::from_secs(15 * 60),
            default_max: 100,
            webhook_window: Duration::from_secs(60),
            webhook_max: 30,
            authenticated_window: Duration::from_secs(15 * 60),
            authenticated_max: 500,
            admin_window: Duration::from_secs(15 * 60),
            admin_max: 1000,
            burst_window: Duration::from_secs(10),
            burst_max: 5,
        }
    }
}

impl RateLimitConfig {
    fn limits_for(&self, tier: Tier) -> (Duration, u32) {
        match tier {
            Tier::Admin => (self.admin_window, self.admin_max),
            Tier::Authenticated => (self.authenticated_window, self.authenticated_max),
            Tier::Webhook => (self.webhook_window, self.webhook_max),
            Tier::Default => (self.default_window, self.default_max),
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Outcome of one check, allowed or not.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Milliseconds until the oldest counted entry ages out.
    pub reset_ms: u64,
    pub window_ms: u64,
    /// Populated on rejection: how long until a slot frees.
    pub retry_after_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

struct Buckets {
    /// (tier name, client id) → timestamps inside the window.
    tiered: HashMap<(&'static str, String), Vec<Instant>>,
    /// client id → timestamps inside the burst window.
    burst: HashMap<String, Vec<Instant>>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<Buckets>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(Buckets { tiered: HashMap::new(), burst: HashMap::new() }),
        }
    }

    /// Check and (when allowed) record one request for the client.
    pub async fn check(&self, tier: Tier, client_id: &str) -> RateDecision {
        let now = Instant::now();
        let (window, limit) = self.config.limits_for(tier);
        let mut buckets = self.buckets.lock().await;

        let entries = buckets
            .tiered
            .entry((tier.name(), client_id.to_string()))
            .or_default();
        prune(entries, now, window);
        let tier_verdict = verdict(entries, now, window, limit);

        // Both the tier window and the burst window must pass.
        let burst_verdict = if tier == Tier::Webhook {
            let burst = buckets.burst.entry(client_id.to_string()).or_default();
            prune(burst, now, self.config.burst_window);
            Some(verdict(burst, now, self.config.burst_window, self.config.burst_max))
        } else {
            None
        };

        let allowed =
            tier_verdict.allowed && burst_verdict.as_ref().map(|v| v.allowed).unwrap_or(true);

        if allowed {
            buckets
                .tiered
                .get_mut(&(tier.name(), client_id.to_string()))
                .expect("entry just created")
                .push(now);
            if tier == Tier::Webhook {
                buckets.burst.get_mut(client_id).expect("entry just created").push(now);
            }
        }

        // Report the stricter of the two on rejection.
        let binding = match (&tier_verdict.allowed, &burst_verdict) {
            (false, _) => tier_verdict.clone(),
            (true, Some(b)) if !b.allowed => b.clone(),
            _ => tier_verdict.clone(),
        };

        RateDecision {
            allowed,
            limit: binding.limit,
            remaining: if allowed {
                binding.remaining.saturating_sub(1)
            } else {
                binding.remaining
            },
            reset_ms: binding.reset_ms,
            window_ms: binding.window_ms,
            retry_after_ms: if allowed { None } else { Some(binding.retry_after_ms.max(1)) },
        }
    }
}

#[derive(Debug, Clone)]
struct Verdict {
    allowed: bool,
    limit: u32,
    remaining: u32,
    reset_ms: u64,
    window_ms: u64,
    retry_after_ms: u64,
}

fn prune(entries: &mut Vec<Instant>, now: Instant, window: Duration) {
    entries.retain(|t| now.duration_since(*t) < window);
}

fn verdict(entries: &[Instant], now: Instant, window: Duration, limit: u32) -> Verdict {
    let count = entries.len() as u32;
    let oldest = entries.first().copied();
    // `oldest + window - now`: when the next slot frees up.
    let reset_ms = oldest
        .map(|t| window.saturating_sub(now.duration_since(t)).as_millis() as u64)
        .unwrap_or_else(|| window.as_millis() as u64);

    Verdict {
        allowed: count < limit,
        limit,
        remaining: limit.saturating_sub(count),
        reset_ms,
        window_ms: window.as_millis() as u64,
        retry_after_ms: reset_ms,
    }
}
