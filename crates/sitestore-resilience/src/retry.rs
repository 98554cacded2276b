//! Retry with exponential backoff
//!
//! ```text
//! delay(n) = min(initial_delay * multiplier^n, max_delay) * jitter,  jitter in [0, 1)
//! ```
//!
//! Attempts are strictly sequential. Errors are normalized through the taxonomy
//! before the retry decision, so callers always receive an `AppError`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sitestore_types::{to_app_error, AppError, BoxError, Result};

use crate::clock::{Sleeper, TokioSleeper};

/// Decides whether a failed attempt (0-based index) should be retried.
pub type RetryPredicate = Arc<dyn Fn(&AppError, u32) -> bool + Send + Sync>;
/// Observes each scheduled retry: error, 1-based attempt number, actual delay.
pub type RetryObserver = Arc<dyn Fn(&AppError, u32, Duration) + Send + Sync>;
/// Produces jitter samples in `[0, 1)`.
pub type JitterSource = Arc<dyn Fn() -> f64 + Send + Sync>;

#[derive(Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
    should_retry: Option<RetryPredicate>,
    on_retry: Option<RetryObserver>,
    sleeper: Arc<dyn Sleeper>,
    jitter: JitterSource,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            use_jitter: true,
            should_retry: None,
            on_retry: None,
            sleeper: Arc::new(TokioSleeper),
            jitter: Arc::new(rand::random::<f64>),
        }
    }
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for flaky network calls.
    pub fn network() -> Self {
        Self::default()
            .with_max_attempts(5)
            .with_initial_delay(Duration::from_millis(2_000))
            .with_max_delay(Duration::from_millis(30_000))
    }

    /// Preset for transient storage transaction contention.
    pub fn storage_transaction() -> Self {
        Self::default()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(100))
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    pub fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    pub fn with_should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&AppError, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub fn with_on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(&AppError, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_jitter_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.jitter = Arc::new(source);
        self
    }

    fn should_retry(&self, error: &AppError, attempt_index: u32) -> bool {
        match &self.should_retry {
            Some(predicate) => predicate(error, attempt_index),
            None => error.is_retryable(),
        }
    }

    /// Backoff before the retry that follows failed attempt `attempt_index`, without jitter.
    pub fn base_delay(&self, attempt_index: u32) -> Duration {
        Duration::from_millis(self.capped_delay_ms(attempt_index).round() as u64)
    }

    fn capped_delay_ms(&self, attempt_index: u32) -> f64 {
        let cap = self.max_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let raw = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);

        if raw.is_finite() && raw >= 0.0 {
            raw.min(cap)
        } else {
            cap
        }
    }

    fn next_delay(&self, attempt_index: u32) -> Duration {
        if !self.use_jitter {
            return self.base_delay(attempt_index);
        }

        let sample = (self.jitter)();
        let factor = if sample.is_finite() {
            sample.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Duration::from_millis((self.capped_delay_ms(attempt_index) * factor).floor() as u64)
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("use_jitter", &self.use_jitter)
            .field("custom_predicate", &self.should_retry.is_some())
            .finish()
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// exhausts `max_attempts`.
pub async fn retry<T, E, F, Fut>(mut operation: F, options: &RetryOptions) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<BoxError>,
{
    let max_attempts = options.max_attempts.max(1);
    let mut attempt_index = 0;

    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => to_app_error(err),
        };

        let attempt_number = attempt_index + 1;
        if attempt_number >= max_attempts {
            if max_attempts > 1 {
                tracing::warn!(
                    attempts = attempt_number,
                    code = %error.code(),
                    error = %error,
                    "Retry attempts exhausted"
                );
            }
            return Err(error);
        }

        if !options.should_retry(&error, attempt_index) {
            return Err(error);
        }

        let delay = options.next_delay(attempt_index);
        tracing::debug!(
            attempt = attempt_number,
            delay_ms = delay.as_millis() as u64,
            code = %error.code(),
            "Retrying after failure"
        );

        if let Some(observer) = &options.on_retry {
            observer(&error, attempt_number, delay);
        }

        options.sleeper.sleep(delay).await;
        attempt_index += 1;
    }
}

/// [`retry`] with a fixed retry predicate.
pub async fn retry_if<T, E, F, Fut, P>(
    operation: F,
    predicate: P,
    options: &RetryOptions,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<BoxError>,
    P: Fn(&AppError, u32) -> bool + Send + Sync + 'static,
{
    let options = options.clone().with_should_retry(predicate);
    retry(operation, &options).await
}

/// [`retry`] starting from the [`RetryOptions::network`] preset. `customize`
/// runs last, so caller overrides win.
pub async fn retry_network<T, E, F, Fut, C>(operation: F, customize: C) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<BoxError>,
    C: FnOnce(RetryOptions) -> RetryOptions,
{
    let options = customize(RetryOptions::network());
    retry(operation, &options).await
}
