// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use tern_config::{BackoffCurve, JitterMode, RetryConfig};

use crate::error::ApiError;

/// Immutable retry policy for one call site.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub strategy: BackoffCurve,
    pub jitter: JitterMode,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        // `jitter: decorrelated` selects the decorrelated curve regardless
        // of the configured strategy; it is a curve, not an additive noise.
        let strategy = match cfg.jitter {
            JitterMode::Decorrelated => BackoffCurve::Decorrelated,
            _ => cfg.strategy,
        };
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            multiplier: cfg.multiplier,
            strategy,
            jitter: cfg.jitter,
        }
    }

    /// Base delay before jitter for a 0-based attempt index.
    /// `previous` is the delay actually slept before this attempt, used by
    /// the decorrelated strategy.
    pub fn base_delay(&self, attempt: u32, previous: Option<Duration>) -> Duration {
        let initial = self.initial_delay.as_secs_f64();
        let cap = self.max_delay.as_secs_f64();
        let secs = match self.strategy {
            BackoffCurve::Exponential => initial * self.multiplier.powi(attempt as i32),
            BackoffCurve::Linear => initial * (attempt as f64 + 1.0),
            BackoffCurve::Fibonacci => initial * fib(attempt + 1) as f64,
            BackoffCurve::Decorrelated => {
                let prev = previous.map(|d| d.as_secs_f64()).unwrap_or(initial);
                let hi = (prev * 3.0).clamp(initial, cap);
                if hi <= initial {
                    initial
                } else {
                    rand::thread_rng().gen_range(initial..=hi)
                }
            }
        };
        Duration::from_secs_f64(secs.min(cap))
    }

    /// Full delay for an attempt: base delay plus configured jitter.
    /// Full jitter adds 0–25 % noise on top of the base delay.
    pub fn delay_for(&self, attempt: u32, previous: Option<Duration>) -> Duration {
        let base = self.base_delay(attempt, previous);
        match self.jitter {
            JitterMode::Full if self.strategy != BackoffCurve::Decorrelated => {
                let noise = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
                Duration::from_secs_f64((base.as_secs_f64() * noise).min(self.max_delay.as_secs_f64()))
            }
            _ => base,
        }
    }
}

fn fib(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Run `op` until it succeeds, the error is terminal, or attempts run out.
///
/// Each attempt receives its 0-based index.  Retryable failures sleep the
/// policy delay — or the server's reset hint when one is present and within
/// bounds — before the next attempt.  Exhaustion surfaces as
/// [`ApiError::RetriesExhausted`] carrying the last underlying error.
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, ApiError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut previous: Option<Duration> = None;
    let mut last: Option<ApiError> = None;

    for attempt in 0..policy.max_attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt + 1 >= policy.max_attempts {
                    last = Some(e);
                    break;
                }
                let delay = e
                    .retry_delay()
                    .unwrap_or_else(|| policy.delay_for(attempt, previous));
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                tokio::time::sleep(delay).await;
                previous = Some(delay);
                last = Some(e);
            }
        }
    }

    Err(ApiError::RetriesExhausted {
        attempts: policy.max_attempts,
        last: Box::new(last.unwrap_or(ApiError::Timeout)),
    })
}

/// [`ModelClient`] decorator that routes every call through the retry
/// controller and a circuit breaker.
///
/// Only the request setup is retried: once the event stream is flowing,
/// a mid-stream failure surfaces to the consumer instead of silently
/// replaying the call.  While the breaker is open, calls short-circuit with
/// `CircuitOpen` and the retry loop waits out the advertised retry-after.
pub struct RetryingClient {
    inner: std::sync::Arc<dyn crate::types::ModelClient>,
    policy: RetryPolicy,
    breaker: std::sync::Arc<crate::circuit::CircuitBreaker>,
}

impl RetryingClient {
    pub fn new(
        inner: std::sync::Arc<dyn crate::types::ModelClient>,
        policy: RetryPolicy,
        breaker: std::sync::Arc<crate::circuit::CircuitBreaker>,
    ) -> Self {
        Self {
            inner,
            policy,
            breaker,
        }
    }

    pub fn breaker(&self) -> &std::sync::Arc<crate::circuit::CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait::async_trait]
impl crate::types::ModelClient for RetryingClient {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn stream(
        &self,
        req: crate::types::CompletionRequest,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<crate::types::EventStream, ApiError> {
        retry_async(&self.policy, |_attempt| {
            let req = req.clone();
            let cancel = cancel.clone();
            async move {
                self.breaker
                    .call(|| self.inner.stream(req, cancel))
                    .await
            }
        })
        .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
