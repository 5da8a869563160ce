//! Exponential backoff with jitter, and the attempt loop that drives it.
//!
//! The loop consumes an explicit [`AttemptOutcome`] per attempt instead of
//! catching errors for control flow, so retry-budget bookkeeping and breaker
//! reporting are visible in the types.

use crate::error::TransportError;
use crate::transport::breaker::CircuitBreaker;
use rand::RngExt;
use std::future::Future;
use std::time::Duration;

/// Ceiling applied to peer-supplied Retry-After hints.
const RETRY_AFTER_CAP: Duration = Duration::from_secs(30);

/// Retry tuning for one client.
///
/// Delays are raw `f64` seconds. A negative `base_delay_secs` is NOT clamped
/// to zero: `delay()` returns the negative value unchanged and the sleep
/// site skips it. That is part of the documented contract; do not "fix" it
/// without revisiting the pinned tests.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 0.5,
            max_delay_secs: 30.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// `min(max_delay, base_delay * 2^attempt)`, plus uniform jitter in
    /// `[0, 0.1 * delay]` when enabled.
    ///
    /// Edge cases, pinned by tests: base 0 yields 0 for every attempt;
    /// `max_delay < base_delay` clamps every attempt including 0; jitter on
    /// a zero delay stays zero.
    pub fn delay(&self, attempt: u32) -> f64 {
        let raw = self.base_delay_secs * 2f64.powi(attempt.min(i32::MAX as u32) as i32);
        let mut delay = raw.min(self.max_delay_secs);
        if self.jitter && delay > 0.0 {
            delay += rand::rng().random_range(0.0..=delay * 0.1);
        }
        delay
    }

    /// Delay for an attempt, floored by the peer's Retry-After hint (capped
    /// at 30s) when the failure carried one.
    fn effective_delay(&self, attempt: u32, err: &TransportError) -> f64 {
        let computed = self.delay(attempt);
        match err {
            TransportError::Remote {
                retry_after: Some(hint),
                ..
            } => computed.max(hint.min(&RETRY_AFTER_CAP).as_secs_f64()),
            _ => computed,
        }
    }
}

/// Result of a single call attempt.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Success(T),
    /// Transient failure: counts against the breaker and the retry budget.
    Retryable(TransportError),
    /// Permanent failure: propagates immediately, touching neither.
    Fatal(TransportError),
}

/// Drive attempts against `target` until success, a fatal error, an open
/// circuit, or an exhausted retry budget.
///
/// The breaker is consulted before every attempt; a fast-fail surfaces
/// [`TransportError::CircuitOpen`] without consuming retry budget. Each
/// retryable failure reports to the breaker; success reports exactly once.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    target: &str,
    mut attempt_fn: F,
) -> Result<T, TransportError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AttemptOutcome<T>>,
{
    let mut last_err: Option<TransportError> = None;

    for attempt in 0..=policy.max_retries {
        if !breaker.can_attempt() {
            tracing::warn!(target = target, "Circuit open - failing fast");
            return Err(TransportError::CircuitOpen {
                target: target.to_string(),
                retry_after: breaker.retry_after(),
            });
        }

        match attempt_fn(attempt).await {
            AttemptOutcome::Success(value) => {
                breaker.record_success();
                if attempt > 0 {
                    tracing::info!(target = target, attempt, "Call recovered after retry");
                }
                return Ok(value);
            }
            AttemptOutcome::Fatal(err) => {
                tracing::warn!(target = target, error = %err, "Non-retryable error");
                return Err(err);
            }
            AttemptOutcome::Retryable(err) => {
                breaker.record_failure();
                if attempt < policy.max_retries {
                    let wait = policy.effective_delay(attempt, &err);
                    tracing::warn!(
                        target = target,
                        attempt = attempt + 1,
                        max_attempts = policy.max_retries + 1,
                        wait_secs = wait,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    if wait > 0.0 {
                        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                    }
                }
                last_err = Some(err);
            }
        }
    }

    let err = last_err.unwrap_or_else(|| {
        TransportError::Internal("retry loop exhausted without an attempt".to_string())
    });
    tracing::warn!(target = target, error = %err, "Retry budget exhausted");
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::breaker::{BreakerConfig, CircuitState};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn policy(base: f64, max: f64, jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay_secs: base,
            max_delay_secs: max,
            jitter,
        }
    }

    fn retryable(detail: &str) -> TransportError {
        TransportError::Connection {
            target: "http://peer".into(),
            detail: detail.into(),
        }
    }

    #[test]
    fn doubles_then_clamps_at_max() {
        let p = policy(1.0, 1000.0, false);
        assert_eq!(p.delay(0), 1.0);
        assert_eq!(p.delay(3), 8.0);
        assert_eq!(p.delay(9), 512.0);
        assert_eq!(p.delay(10), 1000.0);
        assert_eq!(p.delay(11), 1000.0);
    }

    #[test]
    fn max_below_base_clamps_every_attempt_including_zero() {
        let p = policy(10.0, 2.5, false);
        for attempt in 0..12 {
            assert_eq!(p.delay(attempt), 2.5);
        }
    }

    #[test]
    fn zero_base_always_yields_zero_even_with_jitter() {
        let p = policy(0.0, 1000.0, true);
        for attempt in 0..12 {
            assert_eq!(p.delay(attempt), 0.0);
        }
    }

    #[test]
    fn negative_base_is_preserved_not_clamped() {
        let p = policy(-1.0, 1000.0, false);
        assert_eq!(p.delay(0), -1.0);
        assert_eq!(p.delay(2), -4.0);

        // Jitter only applies to positive delays, so the quirk survives it.
        let p = policy(-1.0, 1000.0, true);
        assert_eq!(p.delay(1), -2.0);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let p = policy(2.0, 1000.0, true);
        for attempt in 0..8 {
            let floor = 2.0 * 2f64.powi(attempt);
            for _ in 0..50 {
                let d = p.delay(attempt as u32);
                assert!(d >= floor, "{d} < {floor}");
                assert!(d <= floor * 1.1, "{d} > {}", floor * 1.1);
            }
        }
    }

    #[test]
    fn retry_after_hint_floors_the_delay() {
        let p = policy(0.001, 1000.0, false);
        let err = TransportError::Remote {
            code: -32603,
            message: "busy".into(),
            kind: None,
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(p.effective_delay(0, &err), 2.0);

        let capped = TransportError::Remote {
            code: -32603,
            message: "busy".into(),
            kind: None,
            retry_after: Some(Duration::from_secs(300)),
        };
        assert_eq!(p.effective_delay(0, &capped), 30.0);
    }

    fn fast_breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            open_timeout: Duration::from_secs(60),
        })
    }

    fn instant_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_secs: 0.0,
            max_delay_secs: 0.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try_and_reports_success() {
        let breaker = fast_breaker(2);
        breaker.record_failure();

        let result = run_with_retry(&instant_policy(3), &breaker, "http://peer", |_| async {
            AttemptOutcome::Success(7u32)
        })
        .await
        .unwrap();

        assert_eq!(result, 7);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn retries_until_recovery() {
        let breaker = fast_breaker(10);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_ref = Arc::clone(&calls);

        let result = run_with_retry(
            &instant_policy(3),
            &breaker,
            "http://peer",
            move |_attempt| {
                let calls = Arc::clone(&calls_ref);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        AttemptOutcome::Retryable(retryable("reset"))
                    } else {
                        AttemptOutcome::Success("ok")
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_last_error() {
        let breaker = fast_breaker(100);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_ref = Arc::clone(&calls);

        let err = run_with_retry(&instant_policy(2), &breaker, "http://peer", move |_| {
            let calls = Arc::clone(&calls_ref);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                AttemptOutcome::Retryable::<()>(retryable("down"))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, TransportError::Connection { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.consecutive_failures(), 3);
    }

    #[tokio::test]
    async fn fatal_error_skips_retries_and_breaker() {
        let breaker = fast_breaker(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_ref = Arc::clone(&calls);

        let err = run_with_retry(&instant_policy(5), &breaker, "http://peer", move |_| {
            let calls = Arc::clone(&calls_ref);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                AttemptOutcome::Fatal::<()>(TransportError::HandlerNotFound {
                    payload_type: "task.request".into(),
                })
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, TransportError::HandlerNotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_consuming_budget() {
        let breaker = fast_breaker(1);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_ref = Arc::clone(&calls);

        let err = run_with_retry(&instant_policy(5), &breaker, "http://peer", move |_| {
            let calls = Arc::clone(&calls_ref);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                AttemptOutcome::Success(())
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, TransportError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn breaker_opening_mid_loop_stops_further_attempts() {
        let breaker = fast_breaker(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_ref = Arc::clone(&calls);

        let err = run_with_retry(&instant_policy(10), &breaker, "http://peer", move |_| {
            let calls = Arc::clone(&calls_ref);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                AttemptOutcome::Retryable::<()>(retryable("down"))
            }
        })
        .await
        .unwrap_err();

        // Two failing attempts open the breaker; the third check fast-fails.
        assert!(matches!(err, TransportError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
