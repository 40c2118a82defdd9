//! Sliding-window rate limiter.
//!
//! Each call parses the key, resolves the limiter's configuration, and runs one atomic
//! [`WindowStore::acquire`] through the [`StoreGuard`]. When the store is unavailable (breaker
//! open or retries exhausted) the fail policy decides:
//!
//! - **fail-open**: the request is allowed, with a `warn!` and a `FailOpen` event
//! - **fail-closed**: [`RateLimiterError::Unavailable`] is returned
//!
//! Non-transient store errors and cancellation are never masked by fail-open.
//!
//! ```rust
//! use std::time::Duration;
//! use windowgate::{ConfigRegistry, InMemoryWindowStore, LimiterConfig, SlidingWindowLimiter};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let registry = ConfigRegistry::new(LimiterConfig::new(100, Duration::from_secs(60)).unwrap())
//!     .with_limiter("login", LimiterConfig::new(2, Duration::from_secs(60)).unwrap());
//! let limiter = SlidingWindowLimiter::builder(InMemoryWindowStore::new())
//!     .registry(registry)
//!     .build()
//!     .unwrap();
//!
//! assert!(limiter.try_acquire("login:alice").await.unwrap());
//! assert!(limiter.try_acquire("login:alice").await.unwrap());
//! assert!(!limiter.try_acquire("login:alice").await.unwrap());
//! assert!(limiter.try_acquire("login:bob").await.unwrap());
//! # }
//! ```

use crate::backoff::Backoff;
use crate::cancel::CancelToken;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState, TransitionListener};
use crate::clock::{Clock, MonotonicClock, SystemClock};
use crate::config::{ConfigRegistry, LimiterConfig, RateLimiterSettings, SettingsError};
use crate::error::{RateLimiterError, ResilienceError, StoreError};
use crate::jitter::Jitter;
use crate::key::{RateLimitKey, DEFAULT_KEY_PREFIX};
use crate::random::{RandomSource, ThreadRandom};
use crate::resilience::{BreakerRegistry, StoreGuard, DEFAULT_CALL_TIMEOUT};
use crate::retry::RetryPolicy;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::{WindowRequest, WindowStore};
use crate::telemetry::{emit_best_effort, LimiterEvent, NullSink, TelemetrySink, UnavailableReason};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tower::Service;
use tracing::{debug, error, warn};

/// Limit applied when no registry is configured.
pub const DEFAULT_LIMIT: u64 = 100;
/// Window applied when no registry is configured.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Extra key lifetime beyond the window.
pub const DEFAULT_TTL_SLACK: Duration = Duration::from_secs(1);

/// Generates window entry members unique across instances and within one.
#[derive(Debug)]
struct EntryIds {
    instance: u64,
    seq: AtomicU64,
}

impl EntryIds {
    fn new(random: &dyn RandomSource) -> Self {
        Self { instance: random.next_u64(), seq: AtomicU64::new(0) }
    }

    fn next(&self, now_millis: u64) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:016x}-{}", now_millis, self.instance, seq)
    }
}

/// Breaker transitions held until the next call on the limiter emits them.
const MAX_PENDING_TRANSITIONS: usize = 64;

#[derive(Debug, Clone, Default)]
struct PendingTransitions(Arc<Mutex<VecDeque<LimiterEvent>>>);

impl PendingTransitions {
    fn listener(&self) -> TransitionListener {
        let pending = self.clone();
        TransitionListener::new(move |limiter, from, to| {
            let mut queue = pending.lock();
            if queue.len() == MAX_PENDING_TRANSITIONS {
                queue.pop_front();
            }
            let limiter = limiter.to_owned();
            queue.push_back(LimiterEvent::CircuitTransition { limiter, from, to });
        })
    }

    fn take(&self) -> Vec<LimiterEvent> {
        self.lock().drain(..).collect()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LimiterEvent>> {
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Distributed sliding-window rate limiter.
#[derive(Debug)]
pub struct SlidingWindowLimiter<S, T = NullSink> {
    store: S,
    registry: ConfigRegistry,
    guard: StoreGuard,
    clock: Arc<dyn Clock>,
    ids: EntryIds,
    transitions: PendingTransitions,
    fail_open: bool,
    key_prefix: String,
    ttl_slack: Duration,
    sink: T,
}

impl<S: WindowStore> SlidingWindowLimiter<S> {
    pub fn builder(store: S) -> SlidingWindowLimiterBuilder<S> {
        SlidingWindowLimiterBuilder::new(store)
    }

    /// Build a limiter from a settings document.
    pub fn from_settings(store: S, settings: &RateLimiterSettings) -> Result<Self, SettingsError> {
        let retry = &settings.retry;
        Self::builder(store)
            .registry(settings.registry()?)
            .fail_open(settings.fail_open)
            .key_prefix(settings.key_prefix.clone())
            .retry(retry.max_attempts(), retry.backoff()?, retry.jitter()?)
            .call_timeout(retry.call_timeout()?)
            .circuit_breaker(settings.circuit_breaker.to_config()?)
            .build()
    }
}

impl<S, T> SlidingWindowLimiter<S, T>
where
    S: WindowStore,
    T: TelemetrySink,
    <T as Service<LimiterEvent>>::Future: Send + 'static,
{
    /// Admission decision for `key` (`"limiter:identifier"`).
    ///
    /// `Ok(true)` when the request fits in the window, `Ok(false)` when it does not. A denied
    /// request adds nothing to the window.
    pub async fn try_acquire(&self, key: &str) -> Result<bool, RateLimiterError> {
        self.try_acquire_with_cancel(key, &CancelToken::new()).await
    }

    /// Like [`try_acquire`](Self::try_acquire), aborting with
    /// [`RateLimiterError::Cancelled`] if `cancel` fires while backing off.
    pub async fn try_acquire_with_cancel(
        &self,
        key: &str,
        cancel: &CancelToken,
    ) -> Result<bool, RateLimiterError> {
        let key = RateLimitKey::parse(key);
        let limiter = key.limiter_name();
        let config = self.registry.config_for(limiter);
        let storage_key = key.storage_key(&self.key_prefix);

        // One member per call: a retry whose first reply was lost finds its own entry and is
        // admitted again without taking a second slot.
        let now = self.clock.now_millis();
        let request = WindowRequest {
            window_millis: config.window_millis(),
            limit: config.limit(),
            now_millis: now,
            member: self.ids.next(now),
            ttl_millis: self.ttl_millis(&config),
        };

        let result = self
            .guard
            .call(limiter, cancel, || self.store.acquire(&storage_key, request.clone()))
            .await;
        self.flush_transitions().await;

        match result {
            Ok(allowed) => {
                debug!(
                    limiter,
                    identifier = key.identifier(),
                    allowed,
                    limit = config.limit(),
                    window_ms = config.window_millis(),
                    "rate limit decision"
                );
                self.emit(LimiterEvent::Decision { limiter: limiter.to_owned(), allowed }).await;
                Ok(allowed)
            }
            Err(ResilienceError::Cancelled) => {
                debug!(limiter, identifier = key.identifier(), "rate limit check cancelled");
                self.emit(LimiterEvent::Cancelled { limiter: limiter.to_owned() }).await;
                Err(RateLimiterError::Cancelled)
            }
            Err(ResilienceError::Inner(err)) => {
                error!(limiter, error = %err, "backing store rejected rate limit check");
                Err(RateLimiterError::Store(err))
            }
            Err(cause) => self.unavailable(limiter, cause).await,
        }
    }

    /// Approximate permits left for `key`: `limit - count(now - window, now)`, never below 0.
    ///
    /// A single attempt with no retry; returns `-1` on any failure, including an open breaker.
    /// The count is not atomic with concurrent admissions and must not gate requests.
    pub async fn remaining_permits(&self, key: &str) -> i64 {
        let key = RateLimitKey::parse(key);
        let limiter = key.limiter_name();
        let config = self.registry.config_for(limiter);
        let storage_key = key.storage_key(&self.key_prefix);
        let now = self.clock.now_millis();
        let window_start = now.saturating_sub(config.window_millis());

        let result =
            self.guard.call_once(limiter, self.store.count(&storage_key, window_start, now)).await;
        self.flush_transitions().await;

        match result {
            Ok(count) => i64::try_from(config.limit().saturating_sub(count)).unwrap_or(i64::MAX),
            Err(err) => {
                debug!(limiter, error = %err, "remaining permits unavailable");
                -1
            }
        }
    }

    async fn unavailable(
        &self,
        limiter: &str,
        cause: ResilienceError<StoreError>,
    ) -> Result<bool, RateLimiterError> {
        let reason = match &cause {
            ResilienceError::RetryExhausted { attempts, .. } => {
                UnavailableReason::RetryExhausted { attempts: *attempts }
            }
            _ => UnavailableReason::CircuitOpen,
        };

        if self.fail_open {
            warn!(limiter, %reason, error = %cause, "backing store unavailable, failing open");
            self.emit(LimiterEvent::FailOpen { limiter: limiter.to_owned(), reason }).await;
            Ok(true)
        } else {
            error!(limiter, %reason, error = %cause, "backing store unavailable, failing closed");
            self.emit(LimiterEvent::FailClosed { limiter: limiter.to_owned(), reason }).await;
            Err(RateLimiterError::Unavailable { limiter: limiter.to_owned(), cause })
        }
    }

    /// Emit the breaker transitions recorded since the last call, in the order they happened.
    /// A transition is reported once, by whichever call flushes it first.
    async fn flush_transitions(&self) {
        for event in self.transitions.take() {
            self.emit(event).await;
        }
    }

    async fn emit(&self, event: LimiterEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}

impl<S, T> SlidingWindowLimiter<S, T> {
    /// State of the breaker guarding `limiter_name`.
    pub fn circuit_state(&self, limiter_name: &str) -> CircuitState {
        self.guard.breakers().state(limiter_name)
    }

    /// Force the named breaker closed. `false` if the limiter has not been used yet.
    pub fn reset_circuit(&self, limiter_name: &str) -> bool {
        self.guard.breakers().reset(limiter_name)
    }

    pub fn registry(&self) -> &ConfigRegistry {
        &self.registry
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        self.guard.breakers()
    }

    pub fn is_fail_open(&self) -> bool {
        self.fail_open
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Upper bound on how long one `try_acquire` can take.
    pub fn worst_case_latency(&self) -> Duration {
        self.guard.worst_case_latency()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn ttl_millis(&self, config: &LimiterConfig) -> u64 {
        let slack = u64::try_from(self.ttl_slack.as_millis()).unwrap_or(u64::MAX);
        config.window_millis().saturating_add(slack)
    }
}

/// Builder for [`SlidingWindowLimiter`].
#[derive(Debug)]
pub struct SlidingWindowLimiterBuilder<S, T = NullSink> {
    store: S,
    registry: Option<ConfigRegistry>,
    fail_open: bool,
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    circuit_breaker: CircuitBreakerConfig,
    call_timeout: Duration,
    clock: Option<Arc<dyn Clock>>,
    random: Arc<dyn RandomSource>,
    sleeper: Arc<dyn Sleeper>,
    key_prefix: String,
    ttl_slack: Duration,
    sink: T,
}

impl<S: WindowStore> SlidingWindowLimiterBuilder<S> {
    fn new(store: S) -> Self {
        Self {
            store,
            registry: None,
            fail_open: false,
            max_attempts: 6,
            backoff: Backoff::exponential(Duration::from_millis(25))
                .with_max(Duration::from_millis(400))
                .unwrap_or_else(|_| Backoff::constant(Duration::from_millis(25))),
            jitter: Jitter::Symmetric(0.2),
            circuit_breaker: CircuitBreakerConfig::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            clock: None,
            random: Arc::new(ThreadRandom),
            sleeper: Arc::new(TokioSleeper),
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            ttl_slack: DEFAULT_TTL_SLACK,
            sink: NullSink,
        }
    }
}

impl<S: WindowStore, T> SlidingWindowLimiterBuilder<S, T> {
    pub fn registry(mut self, registry: ConfigRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Total attempts (initial try plus retries), backoff schedule and jitter.
    pub fn retry(mut self, max_attempts: usize, backoff: Backoff, jitter: Jitter) -> Self {
        self.max_attempts = max_attempts;
        self.backoff = backoff;
        self.jitter = jitter;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Time source for window scores and breaker timing. Defaults to [`SystemClock`] for scores
    /// and [`MonotonicClock`] for the breaker.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Source for backoff jitter and the instance id.
    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn ttl_slack(mut self, slack: Duration) -> Self {
        self.ttl_slack = slack;
        self
    }

    pub fn sink<T2>(self, sink: T2) -> SlidingWindowLimiterBuilder<S, T2>
    where
        T2: TelemetrySink,
    {
        SlidingWindowLimiterBuilder {
            store: self.store,
            registry: self.registry,
            fail_open: self.fail_open,
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            circuit_breaker: self.circuit_breaker,
            call_timeout: self.call_timeout,
            clock: self.clock,
            random: self.random,
            sleeper: self.sleeper,
            key_prefix: self.key_prefix,
            ttl_slack: self.ttl_slack,
            sink,
        }
    }

    pub fn build(self) -> Result<SlidingWindowLimiter<S, T>, SettingsError> {
        if self.call_timeout.is_zero() {
            return Err(SettingsError::ZeroCallTimeout);
        }
        let retry = RetryPolicy::builder()
            .max_attempts(self.max_attempts)
            .backoff(self.backoff)
            .with_jitter(self.jitter)
            .should_retry(StoreError::is_transient)
            .with_shared_sleeper(self.sleeper)
            .with_random(self.random.clone())
            .build()?;

        let (clock, breaker_clock): (Arc<dyn Clock>, Arc<dyn Clock>) = match self.clock {
            Some(clock) => (clock.clone(), clock),
            None => (Arc::new(SystemClock), Arc::new(MonotonicClock::default())),
        };
        let transitions = PendingTransitions::default();
        let breakers = BreakerRegistry::new(self.circuit_breaker)?
            .with_clock(breaker_clock)
            .with_listener(transitions.listener());

        let registry = match self.registry {
            Some(registry) => registry,
            None => ConfigRegistry::new(
                LimiterConfig::new(DEFAULT_LIMIT, DEFAULT_WINDOW).map_err(|source| {
                    SettingsError::Limiter { name: crate::key::DEFAULT_LIMITER.to_owned(), source }
                })?,
            ),
        };

        Ok(SlidingWindowLimiter {
            store: self.store,
            registry,
            guard: StoreGuard::new(retry, breakers, self.call_timeout),
            clock,
            ids: EntryIds::new(self.random.as_ref()),
            transitions,
            fail_open: self.fail_open,
            key_prefix: self.key_prefix,
            ttl_slack: self.ttl_slack,
            sink: self.sink,
        })
    }
}
