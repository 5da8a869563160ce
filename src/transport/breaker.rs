//! Per-target circuit breaker with a process-wide shared registry.
//!
//! One breaker per target base URL, owned by the registry and shared across
//! every client in the process: a burst of failures from one caller protects
//! all callers to that target. Registry entries are never evicted; tests
//! needing isolation call [`BreakerRegistry::clear`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Breaker tuning shared by every entry a registry creates.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit refuses calls before allowing one probe.
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// Failure tracker for a single target.
///
/// State machine:
/// - CLOSED, `threshold` consecutive failures => OPEN
/// - OPEN, first check at/after `open_timeout` => HALF_OPEN (one probe)
/// - HALF_OPEN, success => CLOSED (counter reset); failure => OPEN (timer restarts)
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
            }),
        }
    }

    /// Whether a call may be attempted right now.
    ///
    /// CLOSED always permits. OPEN permits only once the open timeout has
    /// elapsed, transitioning to HALF_OPEN as a side effect; exactly one
    /// caller observes that transition, which is the probe.
    pub fn can_attempt(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = inner
                    .last_failure
                    .is_some_and(|at| at.elapsed() >= self.config.open_timeout);
                if expired {
                    inner.state = CircuitState::HalfOpen;
                    tracing::debug!("Circuit timeout elapsed - allowing probe (half-open)");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call: counter resets, circuit closes.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed || inner.consecutive_failures > 0 {
            tracing::info!(
                previous_failures = inner.consecutive_failures,
                "Target recovered - closing circuit"
            );
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
    }

    /// Record a failed call. Opens the circuit at the threshold, and
    /// re-opens immediately from HALF_OPEN (restarting the timer).
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        let should_open = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;
        if should_open && inner.state != CircuitState::Open {
            tracing::warn!(
                failures = inner.consecutive_failures,
                threshold = self.config.failure_threshold,
                cooldown_secs = self.config.open_timeout.as_secs(),
                "Failure threshold reached - opening circuit"
            );
            inner.state = CircuitState::Open;
        }
    }

    /// Time remaining until an open circuit admits a probe. Zero when the
    /// circuit is not open or the timeout already elapsed.
    pub fn retry_after(&self) -> Duration {
        let inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return Duration::ZERO;
        }
        inner
            .last_failure
            .map(|at| self.config.open_timeout.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }
}

/// Process-wide map from target base URL to its shared breaker.
///
/// Constructed once at the application root and injected (via `Arc`) into
/// every client; identical target means identical breaker instance.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the breaker for a target, creating it lazily on first use.
    pub fn breaker_for(&self, target: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(
            breakers
                .entry(target.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config))),
        )
    }

    /// Drop all breaker state. Entries otherwise persist for the process
    /// lifetime, which leaks state across tests unless cleared.
    pub fn clear(&self) {
        self.breakers.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.breakers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.lock().is_empty()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
