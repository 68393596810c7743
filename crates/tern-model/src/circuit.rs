// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use tern_config::CircuitConfig;

use crate::error::{ApiError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Counters retained across the breaker's lifetime.
#[derive(Debug, Clone, Default)]
pub struct CircuitStats {
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub times_opened: u64,
    pub error_kinds: HashMap<ErrorKind, u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    stats: CircuitStats,
}

/// Per-endpoint circuit breaker.
///
/// ```text
/// closed ──consecutive failures ≥ threshold──► open
/// open   ──reset timeout elapsed─────────────► half_open
/// half_open ──successThreshold successes──► closed
/// half_open ──any failure─────────────────► open
/// ```
///
/// Only endpoint-side failures (network, timeout, transient, overloaded,
/// rate-limit) count toward opening; cancellations, validation failures, and
/// client errors are recorded in the histogram but never trip the circuit.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(cfg: &CircuitConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                stats: CircuitStats::default(),
            }),
            failure_threshold: cfg.failure_threshold.max(1),
            success_threshold: cfg.success_threshold.max(1),
            reset_timeout: Duration::from_secs(cfg.reset_timeout_secs),
        }
    }

    /// Gate a call.  While open and within the reset timeout this returns
    /// `CircuitOpen` without the caller invoking anything; once the timeout
    /// elapses the breaker moves to half-open and lets a probe through.
    pub fn check(&self) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.stats.total_calls += 1;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(self.reset_timeout);
                if elapsed >= self.reset_timeout {
                    debug!("circuit reset timeout elapsed; half-open probe allowed");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(ApiError::CircuitOpen {
                        retry_after: self.reset_timeout - elapsed,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.stats.successes += 1;
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.success_threshold {
                    debug!("circuit closed after successful probes");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, kind: ErrorKind) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.stats.failures += 1;
        *inner.stats.error_kinds.entry(kind).or_insert(0) += 1;

        let trips = matches!(
            kind,
            ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::ServerTransient
                | ErrorKind::Overloaded
                | ErrorKind::RateLimit
        );
        if !trips {
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "circuit opened after sustained failures"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.stats.times_opened += 1;
                }
            }
            CircuitState::HalfOpen => {
                warn!("probe failed; circuit re-opened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.stats.times_opened += 1;
            }
            CircuitState::Open => {}
        }
    }

    /// Run an operation through the breaker, recording the outcome.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ApiError>>,
    {
        self.check()?;
        match op().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure(e.kind());
                Err(e)
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn stats(&self) -> CircuitStats {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stats
            .clone()
    }
}

/// Lazily-created breaker per endpoint, sharing one configuration.
pub struct CircuitRegistry {
    config: CircuitConfig,
    map: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_endpoint(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(&self.config)))
            .clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(failures: u32, successes: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(&CircuitConfig {
            failure_threshold: failures,
            success_threshold: successes,
            reset_timeout_secs: 0,
        })
        .with_reset(Duration::from_millis(reset_ms))
    }

    impl CircuitBreaker {
        fn with_reset(mut self, d: Duration) -> Self {
            self.reset_timeout = d;
            self
        }
    }

    fn transient() -> ApiError {
        ApiError::ServerTransient {
            status: 503,
            message: "x".into(),
        }
    }

    // ── Opening ───────────────────────────────────────────────────────────────

    #[test]
    fn stays_closed_below_threshold() {
        let cb = breaker(3, 1, 1000);
        cb.record_failure(ErrorKind::ServerTransient);
        cb.record_failure(ErrorKind::ServerTransient);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_at_consecutive_failure_threshold() {
        let cb = breaker(3, 1, 1000);
        for _ in 0..3 {
            cb.record_failure(ErrorKind::Network);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().times_opened, 1);
    }

    #[test]
    fn success_resets_consecutive_count() {
        let cb = breaker(3, 1, 1000);
        cb.record_failure(ErrorKind::Network);
        cb.record_failure(ErrorKind::Network);
        cb.record_success();
        cb.record_failure(ErrorKind::Network);
        cb.record_failure(ErrorKind::Network);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn non_endpoint_errors_never_trip() {
        let cb = breaker(2, 1, 1000);
        for _ in 0..10 {
            cb.record_failure(ErrorKind::Validation);
            cb.record_failure(ErrorKind::Cancelled);
            cb.record_failure(ErrorKind::Client);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().error_kinds[&ErrorKind::Validation], 10);
    }

    // ── Short-circuiting ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn open_circuit_short_circuits_without_invoking() {
        let cb = breaker(1, 1, 60_000);
        cb.record_failure(ErrorKind::Network);
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result: Result<(), _> = cb
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ApiError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn circuit_open_error_carries_retry_after() {
        let cb = breaker(1, 1, 60_000);
        cb.record_failure(ErrorKind::Timeout);
        match cb.check().unwrap_err() {
            ApiError::CircuitOpen { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
                assert!(retry_after > Duration::from_secs(50));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    // ── Half-open probing ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn half_open_probe_after_reset_timeout() {
        let cb = breaker(3, 2, 20);
        for _ in 0..3 {
            cb.record_failure(ErrorKind::ServerTransient);
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        // The reset timeout has elapsed: the next check lets a probe through.
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // One success is not enough at success_threshold = 2.
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = breaker(1, 1, 10);
        cb.record_failure(ErrorKind::Network);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure(ErrorKind::Network);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().times_opened, 2);
    }

    #[tokio::test]
    async fn call_records_success_and_failure() {
        let cb = breaker(5, 1, 1000);
        let _ = cb.call(|| async { Ok::<_, ApiError>(1) }).await;
        let _: Result<i32, _> = cb.call(|| async { Err(transient()) }).await;
        let stats = cb.stats();
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.error_kinds[&ErrorKind::ServerTransient], 1);
    }

    // ── Registry ──────────────────────────────────────────────────────────────

    #[test]
    fn registry_returns_same_breaker_per_endpoint() {
        let reg = CircuitRegistry::new(CircuitConfig::default());
        let a1 = reg.for_endpoint("api.example.com");
        let a2 = reg.for_endpoint("api.example.com");
        let b = reg.for_endpoint("other.example.com");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }
}
