//! Backoff schedule and failure classification for archive downloads.
//!
//! One download attempt either succeeds, fails transiently (connection
//! problems, timeouts, truncated bodies, HTTP 429, HTTP 5xx, local disk
//! errors) or fails permanently (other HTTP 4xx, checksum mismatch).
//! Only transient failures are retried, after [`retry_delay`].

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use taxroll_source_models::config::RetryConfig;

use crate::SourceError;

/// Lower bound of the jitter factor applied to each delay.
pub const JITTER_MIN: f64 = 0.5;

/// Upper bound of the jitter factor applied to each delay.
pub const JITTER_MAX: f64 = 1.0;

/// Outcome of a single failed attempt.
#[derive(Debug)]
pub enum AttemptError {
    /// Worth retrying.
    Transient(SourceError),
    /// Retrying cannot help.
    Permanent(SourceError),
}

impl AttemptError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    #[must_use]
    pub fn into_inner(self) -> SourceError {
        match self {
            Self::Transient(e) | Self::Permanent(e) => e,
        }
    }
}

/// Delay before retry number `attempt + 1`, without jitter.
///
/// `min(max_delay, initial_delay * base^attempt)`. Non-decreasing in
/// `attempt` as long as `base >= 1.0`, and saturates at `max_delay` instead
/// of overflowing.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let initial = config.initial_delay_ms as f64;
    let max = config.max_delay_ms as f64;
    let raw = initial * config.exponential_base.powf(f64::from(attempt));
    Duration::from_secs_f64(raw.min(max).max(0.0) / 1000.0)
}

/// Scales `delay` by `factor`, clamped to the jitter range.
#[must_use]
pub fn jittered(delay: Duration, factor: f64) -> Duration {
    delay.mul_f64(factor.clamp(JITTER_MIN, JITTER_MAX))
}

/// Delay before retry number `attempt + 1`, with jitter if enabled.
#[must_use]
pub fn retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let delay = backoff_delay(config, attempt);
    if config.jitter {
        jittered(delay, rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX))
    } else {
        delay
    }
}

/// Classifies a response status. `None` means success.
#[must_use]
pub fn classify_status(url: &str, status: StatusCode) -> Option<AttemptError> {
    if status.is_success() {
        return None;
    }
    let error = SourceError::HttpStatus {
        url: url.to_string(),
        status: status.as_u16(),
    };
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Some(AttemptError::Transient(error))
    } else {
        Some(AttemptError::Permanent(error))
    }
}

/// Classifies a transport-level error.
#[must_use]
pub fn classify_error(e: reqwest::Error) -> AttemptError {
    if is_transient(&e) {
        AttemptError::Transient(SourceError::Http(e))
    } else {
        AttemptError::Permanent(SourceError::Http(e))
    }
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
}
