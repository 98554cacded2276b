//! Circuit Breaker
//!
//! ```text
//! Closed
//!   ↓ failure_threshold consecutive failures
//! Open  (calls rejected, operation never invoked)
//!   ↓ reset_timeout elapsed since last failure
//! HalfOpen  (exactly one trial call)
//!   ↓ success → Closed     failure → Open
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sitestore_types::{to_app_error, AppError, BoxError, ErrorCode, Result};

use crate::clock::{Clock, SystemClock};

type Hook = Arc<dyn Fn() + Send + Sync>;
/// Decides whether an error counts against the breaker.
pub type FailurePredicate = Arc<dyn Fn(&AppError) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast
    Open,
    /// One trial call is admitted
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half-open" => Ok(CircuitState::HalfOpen),
            _ => Err(format!("Unknown circuit state: {}", s)),
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreakerOptions {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    is_failure: FailurePredicate,
    on_open: Option<Hook>,
    on_close: Option<Hook>,
    clock: Arc<dyn Clock>,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(60_000),
            is_failure: Arc::new(is_dependency_failure),
            on_open: None,
            on_close: None,
            clock: Arc::new(SystemClock::new()),
        }
    }
}

impl CircuitBreakerOptions {
    pub fn with_failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold;
        self
    }

    pub fn with_reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.reset_timeout = reset_timeout;
        self
    }

    pub fn with_is_failure<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&AppError) -> bool + Send + Sync + 'static,
    {
        self.is_failure = Arc::new(predicate);
        self
    }

    pub fn with_on_open<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_open = Some(Arc::new(hook));
        self
    }

    pub fn with_on_close<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(hook));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl fmt::Debug for CircuitBreakerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerOptions")
            .field("failure_threshold", &self.failure_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .finish()
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_ms: Option<u64>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    options: CircuitBreakerOptions,
    inner: Mutex<BreakerState>,
}

enum Transition {
    None,
    Opened,
    Closed,
}

impl CircuitBreaker {
    pub fn new(options: CircuitBreakerOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_ms: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_ms: inner.last_failure_ms,
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.trial_in_flight = false;
        tracing::debug!("Circuit breaker reset");
    }

    /// Run `operation` through the breaker.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let is_trial = self.admit()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: is_trial,
        };

        let outcome = operation().await;
        guard.armed = false;

        match outcome {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                let error = to_app_error(err);
                // The dependency answered; the request itself was bad.
                if (self.options.is_failure)(&error) {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(error)
            }
        }
    }

    /// Returns whether the admitted call is the half-open trial.
    fn admit(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let now = self.options.clock.now_ms();
                let since = inner.last_failure_ms.unwrap_or(0);
                let elapsed = now.saturating_sub(since);

                if elapsed >= self.options.reset_timeout.as_millis() as u64 {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!(
                        elapsed_ms = elapsed,
                        "Circuit breaker half-open, admitting trial call"
                    );
                    Ok(true)
                } else {
                    Err(open_error())
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(open_error())
                } else {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn record_success(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.trial_in_flight = false;
                    Transition::Closed
                }
                CircuitState::Closed => {
                    inner.failure_count = 0;
                    Transition::None
                }
                CircuitState::Open => Transition::None,
            }
        };

        self.fire(transition);
    }

    fn record_failure(&self) {
        let now = self.options.clock.now_ms();
        let transition = {
            let mut inner = self.inner.lock();
            inner.last_failure_ms = Some(now);
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.state = CircuitState::Open;
                    inner.trial_in_flight = false;
                    tracing::warn!(
                        failure_count = inner.failure_count,
                        "Circuit breaker trial call failed, reopening"
                    );
                    Transition::None
                }
                CircuitState::Closed => {
                    inner.failure_count += 1;
                    if inner.failure_count >= self.options.failure_threshold {
                        inner.state = CircuitState::Open;
                        tracing::warn!(
                            failure_count = inner.failure_count,
                            threshold = self.options.failure_threshold,
                            "Circuit breaker opened"
                        );
                        Transition::Opened
                    } else {
                        Transition::None
                    }
                }
                CircuitState::Open => Transition::None,
            }
        };

        self.fire(transition);
    }

    fn abandon_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            inner.state = CircuitState::Open;
            inner.trial_in_flight = false;
            inner.last_failure_ms = Some(self.options.clock.now_ms());
            tracing::warn!("Circuit breaker trial call abandoned, reopening");
        }
    }

    fn fire(&self, transition: Transition) {
        let hook = match transition {
            Transition::Opened => self.options.on_open.as_ref(),
            Transition::Closed => {
                tracing::info!("Circuit breaker closed");
                self.options.on_close.as_ref()
            }
            Transition::None => None,
        };

        if let Some(hook) = hook {
            hook();
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("options", &self.options)
            .field("state", &*self.inner.lock())
            .finish()
    }
}

/// Re-opens the breaker if a trial call is dropped before it completes.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_trial();
        }
    }
}

/// Default failure predicate: everything except errors caused by the request itself.
pub fn is_dependency_failure(error: &AppError) -> bool {
    !matches!(
        error.code(),
        ErrorCode::ValidationError
            | ErrorCode::StorageQuotaExceeded
            | ErrorCode::NotFound
            | ErrorCode::ConfigError
    )
}

fn open_error() -> AppError {
    AppError::storage_unavailable("circuit breaker open")
        .with_user_message("Storage is temporarily unavailable. Please try again in a minute.")
}
