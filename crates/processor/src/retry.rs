//! Retry schedule and the transport-style failure classifier.

use std::time::Duration;

/// Dispatch attempts are capped here; the third failure is permanent.
pub const MAX_ATTEMPTS: u32 = 3;

/// Delay before attempt n+1, indexed by n-1.
pub const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(1000),
    Duration::from_millis(5000),
    Duration::from_millis(15_000),
];

/// Markers that make an otherwise-unclassified failure worth retrying.
const TRANSPORT_MARKERS: [&str; 6] = [
    "connection reset",
    "not found",
    "timeout",
    "timed out",
    "refused",
    "network",
];

/// Transport-style failures (resets, timeouts, refusals, explicit network
/// markers) retry; validation/permission/config failures do not.
pub fn is_transport_style(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSPORT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Delay for the retry following the given (1-based) failed attempt.
pub fn delay_after_attempt(attempt: u32) -> Duration {
    let index = (attempt.max(1) as usize - 1).min(RETRY_DELAYS.len() - 1);
    RETRY_DELAYS[index]
}
