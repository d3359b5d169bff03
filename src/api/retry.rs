//! Retry policy for station fetches.
//!
//! The retry loop is an explicit state machine. [`RetryPolicy::after_failure`] is a pure
//! transition from a failed attempt to the next state, so the rules can be tested
//! without a network:
//! - 5xx and network errors back off exponentially with jitter, capped at `max_delay`;
//! - 429 waits exactly what the server asks for (or the default), never the exponential delay,
//!   and still consumes an attempt;
//! - other 4xx responses and undecodable bodies stop immediately;
//! - running out of attempts ends in `Exhausted`.

use crate::config::FetchConfig;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Typed failure of a station fetch, as seen by callers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("station {station} rejected with HTTP {status}")]
    ClientError { station: String, status: u16 },

    #[error("station {station} unavailable after {attempts} attempts: {last}")]
    Exhausted {
        station: String,
        attempts: u32,
        last: String,
    },

    #[error("station {station} still rate limited after {attempts} attempts")]
    RateLimited { station: String, attempts: u32 },

    #[error("station {station} returned an undecodable body: {reason}")]
    Decode { station: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Build(String),
}

/// Why a single HTTP attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    Server { status: u16 },
    Network(String),
    Client { status: u16 },
    RateLimited { retry_after: Option<Duration> },
    Decode(String),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Server { status } => write!(f, "HTTP {}", status),
            AttemptFailure::Network(msg) => write!(f, "network error: {}", msg),
            AttemptFailure::Client { status } => write!(f, "HTTP {}", status),
            AttemptFailure::RateLimited { .. } => write!(f, "HTTP 429"),
            AttemptFailure::Decode(msg) => write!(f, "decode error: {}", msg),
        }
    }
}

/// States of one station's fetch. `attempt` is zero-based.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryState<T> {
    Attempting { attempt: u32 },
    BackingOff { attempt: u32, delay: Duration },
    RateLimited { attempt: u32, wait: Duration },
    Rejected(FetchError),
    Exhausted(FetchError),
    Succeeded { attempts: u32, value: T },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
    pub rate_limit_wait: Duration,
    pub rate_limit_max_wait: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: config.base_delay(),
            multiplier: config.multiplier,
            max_delay: config.max_delay(),
            jitter_ratio: config.jitter_ratio.max(0.0),
            rate_limit_wait: config.rate_limit_wait(),
            rate_limit_max_wait: config.rate_limit_max_wait(),
        }
    }

    /// `base × multiplier^attempt`, plus `jitter × jitter_ratio` of that, capped at `max_delay`.
    ///
    /// `jitter` is a uniform sample from `[0, 1)`.
    pub fn backoff_delay(&self, attempt: u32, jitter: f64) -> Duration {
        let exp = self.multiplier.powi(attempt as i32);
        let base = self.base_delay.as_secs_f64() * exp;
        let jittered = base + base * self.jitter_ratio * jitter.clamp(0.0, 1.0);
        let capped = jittered.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Wait for a 429: the server's value when given, bounded by `rate_limit_max_wait`.
    pub fn rate_limit_delay(&self, retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or(self.rate_limit_wait)
            .min(self.rate_limit_max_wait)
    }

    /// Transition after attempt number `attempt` failed with `failure`.
    pub fn after_failure<T>(
        &self,
        station: &str,
        attempt: u32,
        failure: &AttemptFailure,
        jitter: f64,
    ) -> RetryState<T> {
        let attempts_used = attempt + 1;
        let budget_left = attempts_used < self.max_attempts;

        match failure {
            AttemptFailure::Client { status } => RetryState::Rejected(FetchError::ClientError {
                station: station.to_string(),
                status: *status,
            }),
            AttemptFailure::Decode(reason) => RetryState::Rejected(FetchError::Decode {
                station: station.to_string(),
                reason: reason.clone(),
            }),
            AttemptFailure::RateLimited { retry_after } if budget_left => RetryState::RateLimited {
                attempt: attempts_used,
                wait: self.rate_limit_delay(*retry_after),
            },
            AttemptFailure::RateLimited { .. } => RetryState::Exhausted(FetchError::RateLimited {
                station: station.to_string(),
                attempts: attempts_used,
            }),
            AttemptFailure::Server { .. } | AttemptFailure::Network(_) if budget_left => {
                RetryState::BackingOff {
                    attempt: attempts_used,
                    delay: self.backoff_delay(attempt, jitter),
                }
            },
            AttemptFailure::Server { .. } | AttemptFailure::Network(_) => {
                RetryState::Exhausted(FetchError::Exhausted {
                    station: station.to_string(),
                    attempts: attempts_used,
                    last: failure.to_string(),
                })
            },
        }
    }
}
