//! Injectable randomness for jitter and window-entry suffixes.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

/// Source of randomness passed explicitly to the components that need it.
pub trait RandomSource: Send + Sync + std::fmt::Debug {
    /// Uniform `u64`.
    fn next_u64(&self) -> u64;

    /// Uniform float in `[0, 1)`.
    fn next_unit(&self) -> f64;
}

/// Production source backed by `rand`'s thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_u64(&self) -> u64 {
        rand::rng().random()
    }

    fn next_unit(&self) -> f64 {
        rand::rng().random_range(0.0..1.0)
    }
}

/// Deterministic source for tests; the same seed yields the same sequence.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }
}

impl RandomSource for SeededRandom {
    fn next_u64(&self) -> u64 {
        self.rng.lock().unwrap_or_else(|p| p.into_inner()).random()
    }

    fn next_unit(&self) -> f64 {
        self.rng.lock().unwrap_or_else(|p| p.into_inner()).random_range(0.0..1.0)
    }
}

/// Source that always returns the same values. Handy for pinning jitter in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom {
    pub unit: f64,
    pub value: u64,
}

impl RandomSource for FixedRandom {
    fn next_u64(&self) -> u64 {
        self.value
    }

    fn next_unit(&self) -> f64 {
        self.unit
    }
}
