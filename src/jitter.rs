//! Jitter applied to backoff delays so retrying instances spread out.
//!
//! - `None`: exact delay, for tests or tightly controlled workflows.
//! - `Symmetric(f)`: uniform in `[delay·(1-f), delay·(1+f)]`, the default for store retries.
//! - `Full`: uniform in `[0, delay]`.
//!
//! Randomness comes from an injected [`RandomSource`], never a global RNG.

use crate::random::RandomSource;
use std::time::Duration;

/// Errors produced while validating jitter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JitterError {
    #[error("jitter fraction must be within [0, 1] (got {0})")]
    FractionOutOfRange(f64),
}

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    None,
    /// ± the given fraction of the delay
    Symmetric(f64),
    /// Random between 0 and delay
    Full,
}

impl Jitter {
    /// Symmetric jitter of `± fraction` around the computed delay.
    pub fn symmetric(fraction: f64) -> Result<Self, JitterError> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(JitterError::FractionOutOfRange(fraction));
        }
        Ok(Jitter::Symmetric(fraction))
    }

    pub fn full() -> Self {
        Jitter::Full
    }

    /// Largest factor this strategy can multiply a delay by.
    pub fn max_factor(&self) -> f64 {
        match self {
            Jitter::Symmetric(f) => 1.0 + f,
            Jitter::None | Jitter::Full => 1.0,
        }
    }

    /// Randomize `delay` using `random`.
    pub fn apply(&self, delay: Duration, random: &dyn RandomSource) -> Duration {
        match *self {
            Jitter::None => delay,
            Jitter::Full => delay.mul_f64(random.next_unit()),
            Jitter::Symmetric(fraction) => {
                if fraction == 0.0 || delay.is_zero() {
                    return delay;
                }
                // u in [0,1) maps to a factor in [1-f, 1+f)
                let factor = 1.0 + fraction * (2.0 * random.next_unit() - 1.0);
                delay.mul_f64(factor.max(0.0))
            }
        }
    }
}
