//! Retry and expiration policy
//!
//! Failed requests back off exponentially, seeded by how many times in a row
//! the resource has failed. Expired responses are revalidated at their
//! expiry, or with the same exponential backoff when the server keeps handing
//! out already-expired copies.

use crate::core::config::RetryConfig;
use crate::core::constants::DEFAULT_RATE_LIMIT_DELAY_MS;
use crate::storage::resource::{ErrorReason, ResponseError, Timestamp};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_retries: u32,
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            max_retries: config.max_retries,
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }
}

impl BackoffPolicy {
    /// `base * 2^(failures - 1)` capped at `max`, plus jitter, re-capped
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let delay = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let jitter = delay.mul_f64(self.jitter_ratio * fastrand::f64());
        (delay + jitter).min(self.max)
    }

    /// How long to wait before retrying after the `failures`-th consecutive
    /// error, or `None` when the error is permanent or retries are exhausted.
    pub fn retry_delay(
        &self,
        error: &ResponseError,
        failures: u32,
        now: Timestamp,
    ) -> Option<Duration> {
        if !error.reason.is_retryable() || failures > self.max_retries {
            return None;
        }
        if let Some(retry_after) = error.retry_after {
            return Some((retry_after - now).to_std().unwrap_or(Duration::ZERO));
        }
        let delay = self.delay_for(failures);
        if error.reason == ErrorReason::RateLimit {
            return Some(delay.max(Duration::from_millis(DEFAULT_RATE_LIMIT_DELAY_MS)));
        }
        Some(delay)
    }
}

/// Delay until an expired or expiring resource should be revalidated.
///
/// `expired_requests` counts consecutive responses that arrived already
/// expired; while it is non-zero the delay is `2^(expired_requests - 1)`
/// seconds instead of the server's expiry.
pub fn expiration_timeout(
    expires: Option<Timestamp>,
    expired_requests: u32,
    now: Timestamp,
) -> Option<Duration> {
    if expired_requests > 0 {
        let exponent = (expired_requests - 1).min(31);
        return Some(Duration::from_secs(1u64 << exponent));
    }
    expires.map(|expires| (expires - now).to_std().unwrap_or(Duration::ZERO))
}

/// Reconciles a fresh expiry with the one previously stored.
///
/// A server whose clock lags can hand out an expiry that goes backwards; in
/// that case the prior expiry is kept. Returns the expiry to use and whether
/// the response should count as already expired.
pub fn interpolate_expiration(
    current: Option<Timestamp>,
    prior: Option<Timestamp>,
    now: Timestamp,
) -> (Option<Timestamp>, bool) {
    let Some(current) = current else {
        return (None, false);
    };
    if let Some(prior) = prior {
        if current <= prior {
            // Same or older expiry than the copy we had: treat as expired so
            // the caller backs off instead of hammering the server.
            return (Some(prior), true);
        }
    }
    (Some(current), current <= now)
}
