#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # windowgate
//!
//! Distributed sliding-window rate limiting that stays correct under concurrency and degrades
//! predictably when its backing store misbehaves.
//!
//! ## Features
//!
//! - **Exact sliding windows**: one atomic evict/count/insert per check, executed by the store
//!   (Redis Lua script, or the in-memory store's own lock)
//! - **Named limiters** keyed as `"limiter:identifier"` with a default fallback
//! - **Circuit breaker** per limiter name with half-open probing
//! - **Retry** with exponential backoff and symmetric jitter, cancellable between attempts
//! - **Fail-open / fail-closed** policy when the store is unavailable
//! - **Telemetry** via `tower::Service` sinks and a tower middleware layer
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use windowgate::{ConfigRegistry, InMemoryWindowStore, LimiterConfig, SlidingWindowLimiter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = ConfigRegistry::new(LimiterConfig::new(100, Duration::from_secs(60)).unwrap())
//!         .with_limiter("login", LimiterConfig::new(5, Duration::from_secs(60)).unwrap());
//!
//!     let limiter = SlidingWindowLimiter::builder(InMemoryWindowStore::new())
//!         .registry(registry)
//!         .fail_open(false)
//!         .build()
//!         .unwrap();
//!
//!     if limiter.try_acquire("login:alice").await.unwrap() {
//!         // handle the request
//!     }
//!     println!("left: {}", limiter.remaining_permits("login:alice").await);
//! }
//! ```

pub mod backoff;
pub mod cancel;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod jitter;
pub mod key;
pub mod limiter;
pub mod middleware;
pub mod random;
pub mod resilience;
pub mod retry;
pub mod sleeper;
pub mod store;
pub mod telemetry;

// Re-exports
pub use backoff::{Backoff, BackoffError};
pub use cancel::CancelToken;
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerMetrics, CircuitBreakerPolicy,
    CircuitState, TransitionListener,
};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{
    CircuitBreakerSettings, ConfigError, ConfigRegistry, LimitSettings, LimiterConfig,
    RateLimiterSettings, RetrySettings, SettingsError,
};
pub use error::{RateLimiterError, ResilienceError, StoreError};
pub use jitter::{Jitter, JitterError};
pub use key::RateLimitKey;
pub use limiter::{SlidingWindowLimiter, SlidingWindowLimiterBuilder};
pub use middleware::{RateLimitError, RateLimitLayer, RateLimitService};
pub use random::{FixedRandom, RandomSource, SeededRandom, ThreadRandom};
pub use resilience::{BreakerRegistry, StoreGuard};
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
#[cfg(feature = "redis-store")]
pub use store::RedisWindowStore;
pub use store::{InMemoryWindowStore, WindowRequest, WindowStore};
pub use telemetry::{LimiterEvent, LogSink, MemorySink, NullSink, TelemetrySink};
