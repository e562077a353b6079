// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use proptest::prelude::*;

use super::{calculate_backoff, is_retryable, retry, BreakerState, CircuitBreaker, RetryPolicy};

// ── calculate_backoff ─────────────────────────────────────────────────────

#[test]
fn backoff_without_jitter_doubles_until_cap() {
    let base = Duration::from_secs(2);
    let max = Duration::from_secs(10);
    assert_eq!(calculate_backoff(0, base, max, 0.0), Duration::from_secs(2));
    assert_eq!(calculate_backoff(1, base, max, 0.0), Duration::from_secs(4));
    assert_eq!(calculate_backoff(2, base, max, 0.0), Duration::from_secs(8));
    assert_eq!(calculate_backoff(3, base, max, 0.0), Duration::from_secs(10));
    assert_eq!(calculate_backoff(20, base, max, 0.0), Duration::from_secs(10));
}

proptest! {
    #[test]
    fn backoff_stays_within_jitter_envelope(
        attempt in 0u32..16,
        base_ms in 1u64..5_000,
        max_ms in 1u64..120_000,
        jitter in 0.0f64..0.5,
    ) {
        let base = Duration::from_millis(base_ms);
        let max = Duration::from_millis(max_ms);
        let exp = base.saturating_mul(2u32.saturating_pow(attempt)).min(max);
        let got = calculate_backoff(attempt, base, max, jitter);
        let lo = exp.mul_f64((1.0 - jitter).max(0.0));
        let hi = exp.mul_f64(1.0 + jitter);
        prop_assert!(got >= lo && got <= hi, "{got:?} outside [{lo:?}, {hi:?}]");
    }

    #[test]
    fn backoff_is_monotonic_before_cap(base_ms in 1u64..1_000) {
        let base = Duration::from_millis(base_ms);
        let max = Duration::from_secs(3600);
        for attempt in 0..10u32 {
            let a = calculate_backoff(attempt, base, max, 0.0);
            let b = calculate_backoff(attempt + 1, base, max, 0.0);
            prop_assert!(b >= a);
        }
    }
}

// ── is_retryable ──────────────────────────────────────────────────────────

#[test]
fn transport_kinds_are_retryable() {
    for kind in [
        std::io::ErrorKind::TimedOut,
        std::io::ErrorKind::ConnectionRefused,
        std::io::ErrorKind::HostUnreachable,
        std::io::ErrorKind::NetworkUnreachable,
    ] {
        let err = anyhow::Error::from(std::io::Error::new(kind, "boom"));
        assert!(is_retryable(&err), "{kind:?} should be retryable");
    }
}

#[test]
fn timeout_message_is_retryable() {
    assert!(is_retryable(&anyhow::anyhow!("device connect timeout after 10s")));
    assert!(is_retryable(&anyhow::anyhow!("operation Timed Out")));
}

#[test]
fn other_errors_are_not_retryable() {
    assert!(!is_retryable(&anyhow::anyhow!("invalid user id")));
    let err = anyhow::Error::from(std::io::Error::new(
        std::io::ErrorKind::PermissionDenied,
        "nope",
    ));
    assert!(!is_retryable(&err));
}

// ── retry ─────────────────────────────────────────────────────────────────

fn fast_policy(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts: attempts,
        base: Duration::from_millis(1),
        max: Duration::from_millis(2),
        jitter: 0.0,
    }
}

#[tokio::test]
async fn retry_succeeds_after_transient_failures() -> anyhow::Result<()> {
    let breaker = CircuitBreaker::new(10, Duration::from_secs(30));
    let calls = AtomicU32::new(0);

    let out = retry(fast_policy(3), &breaker, || async {
        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
            anyhow::bail!("connect timeout")
        }
        Ok(42)
    })
    .await?;

    assert_eq!(out, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn retry_aborts_on_non_retryable_error() {
    let breaker = CircuitBreaker::new(10, Duration::from_secs(30));
    let calls = AtomicU32::new(0);

    let out: anyhow::Result<()> = retry(fast_policy(3), &breaker, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("bad request")
    })
    .await;

    assert!(out.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1, "non-retryable should not retry");
}

#[tokio::test]
async fn retry_fails_fast_when_breaker_open() {
    let breaker = CircuitBreaker::new(1, Duration::from_secs(300));
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);

    let calls = AtomicU32::new(0);
    let out: anyhow::Result<()> = retry(fast_policy(3), &breaker, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .await;

    assert!(out.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 0, "open breaker must reject before calling");
}

// ── circuit breaker ───────────────────────────────────────────────────────

#[test]
fn breaker_opens_at_threshold() {
    let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Closed);
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.allow());
}

#[test]
fn breaker_half_opens_after_reset_window() {
    let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
    breaker.record_failure();
    // Zero reset window: the next allow() probes immediately.
    assert!(breaker.allow());
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
    breaker.record_success();
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[test]
fn breaker_reopens_on_half_open_failure() {
    let breaker = CircuitBreaker::new(3, Duration::from_millis(0));
    for _ in 0..3 {
        breaker.record_failure();
    }
    assert!(breaker.allow());
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    let stats = breaker.stats();
    assert_eq!(stats.times_opened, 2);
}

#[test]
fn success_resets_consecutive_failures() {
    let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
    breaker.record_failure();
    breaker.record_failure();
    breaker.record_success();
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Closed);
}
