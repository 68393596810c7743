// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Longest server-supplied rate-limit reset the retry layer will honour.
/// Anything beyond this is treated as a normal backoff so a bad header
/// cannot stall the agent for an hour.
pub const MAX_HONOURED_RESET: Duration = Duration::from_secs(300);

/// Coarse error class used by the retry controller and the circuit
/// breaker's histogram.  Never match on error message text; match on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimit,
    ServerTransient,
    Overloaded,
    Client,
    Validation,
    Cancelled,
    Timeout,
    Parse,
    CircuitOpen,
    RetriesExhausted,
    Redirect,
}

/// Typed error surfaced by the model client, retry controller, and circuit
/// breaker.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        /// Server-supplied reset delay, when present and parseable.
        reset_after: Option<Duration>,
    },

    #[error("server error {status}: {message}")]
    ServerTransient { status: u16, message: String },

    #[error("server overloaded: {message}")]
    Overloaded { message: String },

    #[error("client error {status}: {message}")]
    Client { status: u16, message: String },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timed out")]
    Timeout,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("circuit open; retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ApiError> },

    #[error("cross-host redirect ({status}): {original} -> {target}")]
    CrossHostRedirect {
        original: String,
        target: String,
        status: u16,
    },
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::ServerTransient { .. } => ErrorKind::ServerTransient,
            Self::Overloaded { .. } => ErrorKind::Overloaded,
            Self::Client { .. } => ErrorKind::Client,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout => ErrorKind::Timeout,
            Self::Parse(_) => ErrorKind::Parse,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            Self::CrossHostRedirect { .. } => ErrorKind::Redirect,
        }
    }

    /// Whether the retry controller may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::RateLimit { .. }
                | Self::ServerTransient { .. }
                | Self::Overloaded { .. }
                | Self::Timeout
                | Self::CircuitOpen { .. }
        )
    }

    /// Server-mandated delay before the next attempt, when one exists and
    /// is within [`MAX_HONOURED_RESET`].
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimit {
                reset_after: Some(d),
                ..
            } if *d <= MAX_HONOURED_RESET => Some(*d),
            Self::CircuitOpen { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Classify an HTTP status into the taxonomy.  `reset_after` comes from
    /// the response's rate-limit headers when present.
    pub fn from_status(status: u16, message: String, reset_after: Option<Duration>) -> Self {
        match status {
            429 => Self::RateLimit {
                message,
                reset_after,
            },
            529 => Self::Overloaded { message },
            408 | 500 | 502 | 503 | 504 => Self::ServerTransient { status, message },
            s if (400..500).contains(&s) => Self::Client { status, message },
            s => Self::ServerTransient { status: s, message },
        }
    }

    /// Short human-readable suggestion for the UI layer.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::RateLimit {
                reset_after: Some(d),
                ..
            } => Some(format!("rate limited; retrying in {}s", d.as_secs().max(1))),
            Self::RateLimit { .. } => Some("rate limited; backing off".into()),
            Self::CircuitOpen { retry_after } => Some(format!(
                "endpoint circuit open; next probe in {}s",
                retry_after.as_secs().max(1)
            )),
            Self::Overloaded { .. } => {
                Some("model overloaded; consider a fallback model".into())
            }
            Self::Network(_) | Self::Timeout => Some("check network connectivity".into()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(e.to_string())
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Status classification ─────────────────────────────────────────────────

    #[test]
    fn status_429_is_rate_limit() {
        let e = ApiError::from_status(429, "slow down".into(), None);
        assert_eq!(e.kind(), ErrorKind::RateLimit);
        assert!(e.is_retryable());
    }

    #[test]
    fn status_529_is_overloaded() {
        let e = ApiError::from_status(529, "overloaded".into(), None);
        assert_eq!(e.kind(), ErrorKind::Overloaded);
        assert!(e.is_retryable());
    }

    #[test]
    fn transient_statuses_are_retryable() {
        for status in [408u16, 500, 502, 503, 504] {
            let e = ApiError::from_status(status, "x".into(), None);
            assert_eq!(e.kind(), ErrorKind::ServerTransient, "status {status}");
            assert!(e.is_retryable(), "status {status}");
        }
    }

    #[test]
    fn other_4xx_is_client_and_not_retryable() {
        let e = ApiError::from_status(404, "nope".into(), None);
        assert_eq!(e.kind(), ErrorKind::Client);
        assert!(!e.is_retryable());
    }

    // ── Retry hints ───────────────────────────────────────────────────────────

    #[test]
    fn rate_limit_reset_within_bound_is_honoured() {
        let e = ApiError::RateLimit {
            message: "x".into(),
            reset_after: Some(Duration::from_secs(10)),
        };
        assert_eq!(e.retry_delay(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn rate_limit_reset_beyond_bound_is_ignored() {
        let e = ApiError::RateLimit {
            message: "x".into(),
            reset_after: Some(Duration::from_secs(3600)),
        };
        assert_eq!(e.retry_delay(), None);
    }

    #[test]
    fn cancelled_and_validation_are_terminal() {
        assert!(!ApiError::Cancelled.is_retryable());
        assert!(!ApiError::Validation("bad".into()).is_retryable());
        assert!(!ApiError::Parse("bad".into()).is_retryable());
    }

    #[test]
    fn retries_exhausted_preserves_last_error() {
        let e = ApiError::RetriesExhausted {
            attempts: 4,
            last: Box::new(ApiError::Timeout),
        };
        assert!(e.to_string().contains("timed out"));
        assert_eq!(e.kind(), ErrorKind::RetriesExhausted);
    }

    #[test]
    fn rate_limit_suggestion_names_the_wait() {
        let e = ApiError::RateLimit {
            message: "x".into(),
            reset_after: Some(Duration::from_secs(7)),
        };
        assert!(e.suggestion().unwrap().contains("7s"));
    }
}
