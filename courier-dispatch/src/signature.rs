//! Rate-limit signatures
//!
//! Providers report throttling in free text. A message matching any of these
//! (case-insensitive substring) means "this identity is being throttled",
//! not "this recipient is bad".

/// Known throttling phrases and SMTP reply codes, lower-case
pub const RATE_LIMIT_SIGNATURES: &[&str] = &[
    "too many login attempts",
    "rate limit",
    "454",
    "421",
    "temporarily blocked",
    "try again later",
    "sending limit exceeded",
];

/// Whether a provider error message carries a rate-limit signature
pub fn is_rate_limited(message: &str) -> bool {
    let message = message.to_lowercase();
    RATE_LIMIT_SIGNATURES
        .iter()
        .any(|signature| message.contains(signature))
}
