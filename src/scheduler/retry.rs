//! Retry and error recovery utilities for commit submission
//!
//! Provides exponential backoff, gas bumping and the string classification of
//! chain-client error messages.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Commit retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts before a transient failure becomes terminal (0 = unlimited)
    pub max_attempts: u32,
    /// Backoff after the first failed attempt
    pub initial_backoff: Duration,
    /// Upper bound of the backoff
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Fee increase per retry on the side chain, in percent of the estimate
    pub gas_bump_percent: u32,
    /// Ceiling of the bumped fee as a multiple of the estimate
    pub max_gas_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            gas_bump_percent: 20,
            max_gas_multiplier: 3.0,
        }
    }
}

impl RetryConfig {
    /// Backoff after `attempts` failed attempts (1-indexed: the first failure waits `initial_backoff`)
    pub fn backoff_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(64) as i32;
        let backoff_secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Whether `attempts` failures still leave room for another attempt
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }

    /// Fee for the `attempt`-th retry: `gas_bump_percent` more per retry, capped
    /// at `max_gas_multiplier` times the estimate
    pub fn gas_price_for_attempt(&self, estimate: u128, attempt: u32) -> u128 {
        let cap_percent = ((self.max_gas_multiplier - 1.0).max(0.0) * 100.0) as u128;
        let bump_percent = (u128::from(self.gas_bump_percent) * u128::from(attempt)).min(cap_percent);
        estimate.saturating_mul(100 + bump_percent) / 100
    }

    /// Earliest retry time after `attempts` failures
    pub fn next_retry_after(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        let backoff = self.backoff_for_attempt(attempts);
        now + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(60))
    }
}

/// Retry class of a chain-client error message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Node unreachable or overloaded
    Transient,
    /// Nonce or fee contention; the next attempt re-reads both
    Contention,
    /// The destination already holds the event
    Duplicate,
    /// Proof or payload rejected
    Permanent,
    /// Unrecognised, retried like a transient error
    Unknown,
}

// Checked in this order: bridge contracts report duplicates as reverts
const DUPLICATE_MARKERS: &[&str] = &[
    "already relayed",
    "has been executed",
    "already executed",
    "already done",
    "tx already exist",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "network",
    "rate limit",
    "too many requests",
    "502",
    "503",
    "temporarily unavailable",
];

const CONTENTION_MARKERS: &[&str] = &[
    "underpriced",
    "replacement transaction",
    "gas price too low",
    "max fee per gas less than",
    "nonce too low",
    "nonce too high",
    "already known",
    "insufficient funds",
];

const PERMANENT_MARKERS: &[&str] = &[
    "reverted",
    "invalid proof",
    "verify proof",
    "invalid signature",
    "invalid header",
    "invalid parameters",
    "malformed",
];

/// Classify a raw chain-client error message
pub fn classify_error(message: &str) -> ErrorClass {
    let message = message.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| message.contains(m));

    if has(DUPLICATE_MARKERS) {
        ErrorClass::Duplicate
    } else if has(TRANSIENT_MARKERS) {
        ErrorClass::Transient
    } else if has(CONTENTION_MARKERS) {
        ErrorClass::Contention
    } else if has(PERMANENT_MARKERS) {
        ErrorClass::Permanent
    } else {
        ErrorClass::Unknown
    }
}
