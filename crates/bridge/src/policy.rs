// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry, backoff, and circuit-breaker primitives shared by the device
//! session, the cloud batcher, and the sync worker.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

// -- Backoff ------------------------------------------------------------------

/// Exponential backoff with jitter: `base * 2^attempt`, capped at `max`, then
/// scaled by a random factor in `[1 - jitter, 1 + jitter]`.
///
/// `attempt` is zero-based; `jitter` is a fraction (0.25 = ±25%).
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration, jitter: f64) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt)).min(max);
    if jitter <= 0.0 {
        return exp;
    }
    let spread: f64 = rand::Rng::random_range(&mut rand::rng(), -jitter..=jitter);
    exp.mul_f64((1.0 + spread).max(0.0))
}

/// Retry policy for an operation class.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl RetryPolicy {
    /// Device connect policy: 3 attempts, 2 s → 10 s, ±25% jitter.
    pub fn device_connect() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(2),
            max: Duration::from_secs(10),
            jitter: 0.25,
        }
    }

    /// Delay before the given zero-based retry attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base, self.max, self.jitter)
    }
}

/// Whether an error looks like a transient transport fault worth retrying.
///
/// Matches the classic socket error kinds plus anything that self-describes
/// as a timeout. Everything else aborts the retry loop immediately.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    if let Some(io) = err.downcast_ref::<std::io::Error>() {
        use std::io::ErrorKind;
        if matches!(
            io.kind(),
            ErrorKind::TimedOut
                | ErrorKind::ConnectionRefused
                | ErrorKind::HostUnreachable
                | ErrorKind::NetworkUnreachable
        ) {
            return true;
        }
    }
    let msg = format!("{err:#}").to_ascii_lowercase();
    msg.contains("timeout") || msg.contains("timed out")
}

/// Run `op` under a retry policy gated by a circuit breaker.
///
/// The breaker is consulted before every attempt; a rejected attempt fails
/// fast without touching the operation. Non-retryable errors abort the loop.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    breaker: &CircuitBreaker,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut last_err = anyhow::anyhow!("retry: no attempts made");
    for attempt in 0..policy.max_attempts {
        if !breaker.allow() {
            anyhow::bail!("circuit breaker open");
        }
        match op().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(e) => {
                breaker.record_failure();
                let retryable = is_retryable(&e);
                tracing::debug!(attempt, retryable, err = %e, "attempt failed");
                if !retryable || attempt + 1 == policy.max_attempts {
                    return Err(e);
                }
                last_err = e;
                tokio::time::sleep(policy.delay(attempt)).await;
            }
        }
    }
    Err(last_err)
}

// -- Circuit breaker ----------------------------------------------------------

/// Breaker state, in the usual three-state scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
    times_opened: u64,
}

/// Failure-counting circuit breaker.
///
/// Opens after `threshold` consecutive failures; after `reset_after` a single
/// probe attempt is allowed (half-open). A success closes the breaker, a
/// failure re-opens it.
pub struct CircuitBreaker {
    threshold: u32,
    reset_after: Duration,
    inner: Mutex<BreakerInner>,
}

/// Point-in-time breaker counters for the stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub times_opened: u64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_after: Duration) -> Self {
        Self {
            threshold,
            reset_after,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                total_failures: 0,
                total_successes: 0,
                times_opened: 0,
            }),
        }
    }

    /// Device connect breaker: threshold 3, reset 30 s.
    pub fn device_connect() -> Self {
        Self::new(3, Duration::from_secs(30))
    }

    /// Whether a call may proceed right now. Transitions Open → HalfOpen once
    /// the reset window has elapsed.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.reset_after {
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        let should_open = match inner.state {
            BreakerState::HalfOpen => true,
            _ => inner.consecutive_failures >= self.threshold,
        };
        if should_open && inner.state != BreakerState::Open {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.times_opened += 1;
            tracing::warn!(
                consecutive_failures = inner.consecutive_failures,
                "circuit breaker opened"
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            times_opened: inner.times_opened,
        }
    }
}

#[cfg(test)]
#[path = "policy_tests.rs"]
mod policy_tests;
