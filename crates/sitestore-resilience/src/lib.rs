//! Sitestore Resilience
//!
//! Guards for unreliable storage engines:
//! - `retry` with exponential backoff and jitter for transient failures
//! - a three-state circuit breaker that fails fast while a dependency is down
//! - injectable clock and sleeper so both run on virtual time in tests

mod circuit_breaker;
pub mod clock;
mod retry;

pub use circuit_breaker::{
    is_dependency_failure, CircuitBreaker, CircuitBreakerOptions, CircuitSnapshot, CircuitState,
    FailurePredicate,
};
pub use clock::{Clock, ManualClock, RecordingSleeper, Sleeper, SystemClock, TokioSleeper};
pub use retry::{
    retry, retry_if, retry_network, JitterSource, RetryObserver, RetryOptions, RetryPredicate,
};
