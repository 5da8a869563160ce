//! Resilience primitives: circuit breaking, retry/backoff, bounded
//! execution, and per-connection rate limiting.

pub mod backoff;
pub mod breaker;
pub mod bucket;
pub mod executor;

pub use backoff::{run_with_retry, AttemptOutcome, RetryPolicy};
pub use breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState};
pub use bucket::TokenBucket;
pub use executor::BoundedExecutor;
