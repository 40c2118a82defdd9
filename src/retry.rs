//! Retry policy for backing-store calls.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - Only `ResilienceError::Inner(E)` values accepted by `should_retry` are retried; every other
//!   variant (including `CircuitOpen`) returns immediately.
//! - The delay before retry `n` is `jitter(backoff.delay(n))`, drawn from the injected
//!   [`RandomSource`].
//! - Cancellation is checked before each attempt and raced against each sleep. A cancelled call
//!   returns `ResilienceError::Cancelled`; the attempt in flight is never interrupted.
//!
//! ```rust
//! use std::time::Duration;
//! use windowgate::{Backoff, CancelToken, InstantSleeper, Jitter, ResilienceError, RetryPolicy, StoreError};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<StoreError>::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::exponential(Duration::from_millis(10)))
//!     .with_jitter(Jitter::None)
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result: Result<(), _> = policy
//!     .execute(&CancelToken::new(), move || async move {
//!         Err(ResilienceError::Inner(StoreError::Connection("refused".into())))
//!     })
//!     .await;
//! assert!(result.unwrap_err().is_retry_exhausted());
//! # });
//! ```

use crate::cancel::CancelToken;
use crate::error::MAX_RETRY_FAILURES;
use crate::random::{RandomSource, ThreadRandom};
use crate::{Backoff, Jitter, ResilienceError, Sleeper, TokioSleeper};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retry policy combining backoff, jitter, predicate, sleeper, and randomness.
#[derive(Clone)]
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
    random: Arc<dyn RandomSource>,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("sleeper", &self.sleeper)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl<E> RetryPolicy<E> {
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Upper bound on the total time spent sleeping between attempts.
    pub fn worst_case_backoff(&self) -> Duration {
        (1..self.max_attempts)
            .map(|n| self.backoff.delay(n).mul_f64(self.jitter.max_factor()))
            .sum()
    }

    /// Execute `operation` with retry semantics, observing `cancel` between attempts.
    pub async fn execute<T, Fut, Op>(
        &self,
        cancel: &CancelToken,
        mut operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        let mut failures: VecDeque<E> = VecDeque::new();
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }

            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(ResilienceError::Inner(e)) if (self.should_retry)(&e) => e,
                Err(e) => return Err(e),
            };

            attempt += 1;
            failures.push_back(err);
            if failures.len() > MAX_RETRY_FAILURES {
                failures.pop_front();
            }

            if attempt >= self.max_attempts {
                tracing::warn!(attempts = attempt, "retry exhausted");
                return Err(ResilienceError::retry_exhausted(attempt, failures.into()));
            }

            let delay = self.jitter.apply(self.backoff.delay(attempt), self.random.as_ref());
            tracing::debug!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ResilienceError::Cancelled),
                _ = self.sleeper.sleep(delay) => {}
            }
        }
    }
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
    random: Arc<dyn RandomSource>,
}

impl<E> RetryPolicyBuilder<E> {
    /// Defaults: 6 attempts, 25ms exponential backoff capped at 400ms, ±20% jitter.
    pub fn new() -> Self {
        Self {
            max_attempts: 6,
            backoff: Backoff::exponential(Duration::from_millis(25))
                .with_max(Duration::from_millis(400))
                .unwrap_or(Backoff::constant(Duration::from_millis(25))),
            jitter: Jitter::Symmetric(0.2),
            should_retry: Arc::new(|_: &E| true),
            sleeper: Arc::new(TokioSleeper),
            random: Arc::new(ThreadRandom),
        }
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Predicate to decide if an `Inner` error is retryable.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Share an existing sleeper.
    pub fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn build(self) -> Result<RetryPolicy<E>, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
            random: self.random,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}
