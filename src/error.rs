//! Error types for the store, the resilience wrapper, and the limiter surface.
//!
//! Classification rules:
//! - [`StoreError::is_transient`] decides what the retry policy retries and what the circuit
//!   breaker counts. Only backing-store communication failures are transient.
//! - [`ResilienceError`] is what the wrapper returns; `CircuitOpen` and `RetryExhausted` mean the
//!   backend is unavailable and trigger the fail-open/fail-closed policy.
//! - [`RateLimiterError`] is what callers of the limiter see.
//!
//! Malformed keys never produce an error: they resolve through the documented `default`
//! limiter fallback.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cap on failures kept inside `RetryExhausted`.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Failure talking to the backing store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Could not connect, or the connection dropped.
    #[error("backing store connection failed: {0}")]
    Connection(String),
    /// The call did not complete in time.
    #[error("backing store call timed out: {0}")]
    Timeout(String),
    /// Malformed or unexpected reply on the wire.
    #[error("backing store protocol error: {0}")]
    Protocol(String),
    /// The store refused the request itself (bad arguments, wrong key type, misconfiguration).
    #[error("backing store rejected the request: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Backing-store unavailability: retried, and counted by the circuit breaker.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Rejected(_))
    }
}

/// Error returned by the resilience wrapper.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The breaker is open (or half-open with no probe slot); the store was not contacted.
    CircuitOpen { failed_calls: usize, open_duration: Duration },
    /// Every attempt failed with a retryable error. Keeps the most recent failures.
    RetryExhausted { attempts: usize, failures: Arc<Vec<E>> },
    /// Cancellation was observed between attempts.
    Cancelled,
    /// A failure that is not retried (passed through unmasked).
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { failed_calls, open_duration } => write!(
                f,
                "circuit breaker open ({} failed calls, open for {:?})",
                failed_calls, open_duration
            ),
            Self::RetryExhausted { attempts, failures } => match failures.last() {
                Some(last) => {
                    write!(f, "retry exhausted after {} attempts; last error: {}", attempts, last)
                }
                None => write!(f, "retry exhausted after {} attempts", attempts),
            },
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Build `RetryExhausted`, keeping only the last [`MAX_RETRY_FAILURES`] failures.
    pub fn retry_exhausted(attempts: usize, mut failures: Vec<E>) -> Self {
        if failures.len() > MAX_RETRY_FAILURES {
            failures.drain(..failures.len() - MAX_RETRY_FAILURES);
        }
        ResilienceError::RetryExhausted { attempts, failures: Arc::new(failures) }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Breaker open or retries exhausted: the fail-open/fail-closed policy applies.
    pub fn is_unavailable(&self) -> bool {
        self.is_circuit_open() || self.is_retry_exhausted()
    }

    /// The most recent underlying failure, if one was recorded.
    pub fn last_failure(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => failures.last(),
            _ => None,
        }
    }
}

/// Error surfaced by [`crate::SlidingWindowLimiter`].
#[derive(Debug, thiserror::Error)]
pub enum RateLimiterError {
    /// The backing store is unavailable and the limiter is configured fail-closed.
    /// Callers typically map this to a 503.
    #[error("rate limiter '{limiter}' unavailable: {cause}")]
    Unavailable {
        limiter: String,
        #[source]
        cause: ResilienceError<StoreError>,
    },
    /// The caller cancelled while the limiter was backing off.
    #[error("rate limiter call cancelled")]
    Cancelled,
    /// A non-transient store failure. Never masked by the fail-open policy.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RateLimiterError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RateLimiterError::Unavailable { .. })
    }
}
