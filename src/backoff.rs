//! Backoff schedules for store retries.
//!
//! Attempt semantics: attempt `0` is the initial call (no delay); retries start at `attempt = 1`.
//! Exponential delays double per retry from `initial` and are capped at `max` when one is set.
//! Arithmetic saturates at [`MAX_BACKOFF`] instead of overflowing.
//!
//! ```rust
//! use std::time::Duration;
//! use windowgate::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(25))
//!     .with_max(Duration::from_millis(400))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(25));
//! assert_eq!(backoff.delay(3), Duration::from_millis(100));
//! assert_eq!(backoff.delay(9), Duration::from_millis(400));
//! ```

use std::time::Duration;

/// Ceiling applied when a computed delay would overflow (1 hour).
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("with_max is only valid for exponential backoff")]
    ConstantDoesNotSupportMax,
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= initial delay ({initial:?})")]
    MaxLessThanInitial { initial: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    Constant(Duration),
    Exponential { initial: Duration, max: Option<Duration> },
}

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    schedule: Schedule,
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { schedule: Schedule::Constant(delay) }
    }

    /// `initial * 2^(attempt - 1)`, uncapped until [`Backoff::with_max`] is applied.
    pub fn exponential(initial: Duration) -> Self {
        Self { schedule: Schedule::Exponential { initial, max: None } }
    }

    /// Cap an exponential schedule. Errors on constant schedules, a zero cap, or `max < initial`.
    pub fn with_max(self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match self.schedule {
            Schedule::Constant(_) => Err(BackoffError::ConstantDoesNotSupportMax),
            Schedule::Exponential { initial, .. } if max < initial => {
                Err(BackoffError::MaxLessThanInitial { initial, max })
            }
            Schedule::Exponential { initial, .. } => {
                Ok(Self { schedule: Schedule::Exponential { initial, max: Some(max) } })
            }
        }
    }

    /// Upper bound of any delay this schedule can produce.
    pub fn ceiling(&self) -> Duration {
        match self.schedule {
            Schedule::Constant(d) => d.min(MAX_BACKOFF),
            Schedule::Exponential { max, .. } => max.unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF),
        }
    }

    /// Delay before `attempt` (0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.schedule {
            Schedule::Constant(d) => d.min(MAX_BACKOFF),
            Schedule::Exponential { initial, max } => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let factor = 2u128.saturating_pow(exponent);
                let nanos = initial.as_nanos().saturating_mul(factor).min(MAX_BACKOFF.as_nanos());
                let raw = Duration::from_nanos(nanos as u64);
                max.map_or(raw, |cap| raw.min(cap))
            }
        }
    }
}
