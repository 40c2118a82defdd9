//! Resilience wrapper around backing-store calls.
//!
//! Layering, outermost first: retry, circuit breaker, per-attempt timeout, store call. Each
//! retry attempt passes through the breaker, so an opening breaker stops the retry loop early,
//! and a timed-out attempt counts as one breaker failure.
//!
//! Breakers are kept per limiter name in a [`BreakerRegistry`] and created on first use, so
//! one noisy limiter cannot open the circuit for the others.

use crate::cancel::CancelToken;
use crate::circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerPolicy, CircuitState,
    TransitionListener,
};
use crate::clock::{Clock, MonotonicClock};
use crate::error::{ResilienceError, StoreError};
use crate::retry::RetryPolicy;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Default bound on a single store call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(250);

/// Circuit breakers keyed by limiter name. Clones share the same breakers.
#[derive(Debug, Clone)]
pub struct BreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, CircuitBreakerPolicy>>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    listener: Option<TransitionListener>,
}

impl BreakerRegistry {
    /// Validates `config` once; every breaker created later shares it.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, CircuitBreakerError> {
        CircuitBreakerPolicy::new(config.clone())?;
        Ok(Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            config,
            clock: Arc::new(MonotonicClock::default()),
            listener: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Listener attached to every breaker created from now on.
    pub fn with_listener(mut self, listener: TransitionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// The breaker for `name`, created closed if missing.
    pub fn breaker(&self, name: &str) -> Result<CircuitBreakerPolicy, CircuitBreakerError> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }
        let mut map = self.breakers.write().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = map.get(name) {
            return Ok(existing.clone());
        }
        let mut breaker = CircuitBreakerPolicy::new(self.config.clone())?
            .with_clock(self.clock.clone())
            .with_name(name);
        if let Some(listener) = &self.listener {
            breaker = breaker.with_listener(listener.clone());
        }
        map.insert(name.to_owned(), breaker.clone());
        tracing::debug!(breaker = name, "circuit breaker created");
        Ok(breaker)
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreakerPolicy> {
        self.breakers.read().unwrap_or_else(|p| p.into_inner()).get(name).cloned()
    }

    /// State of the named breaker; a breaker never used is closed.
    pub fn state(&self, name: &str) -> CircuitState {
        self.get(name).map_or(CircuitState::Closed, |b| b.state())
    }

    /// Force the named breaker closed. Returns `false` if it was never created.
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// All known breakers and their states, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.breakers.read().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// Retry + breaker + timeout around store calls.
#[derive(Debug, Clone)]
pub struct StoreGuard {
    retry: RetryPolicy<StoreError>,
    breakers: BreakerRegistry,
    call_timeout: Duration,
}

impl StoreGuard {
    pub fn new(
        retry: RetryPolicy<StoreError>,
        breakers: BreakerRegistry,
        call_timeout: Duration,
    ) -> Self {
        Self { retry, breakers, call_timeout }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Upper bound on time spent in [`StoreGuard::call`], ignoring scheduling delays.
    pub fn worst_case_latency(&self) -> Duration {
        let attempts = u32::try_from(self.retry.max_attempts()).unwrap_or(u32::MAX);
        self.call_timeout.saturating_mul(attempts).saturating_add(self.retry.worst_case_backoff())
    }

    /// Run `op` with retries under the breaker for `scope`.
    ///
    /// `op` is invoked once per attempt and must acquire whatever connection it needs itself.
    pub async fn call<T, Fut, Op>(
        &self,
        scope: &str,
        cancel: &CancelToken,
        mut op: Op,
    ) -> Result<T, ResilienceError<StoreError>>
    where
        Fut: Future<Output = Result<T, StoreError>>,
        Op: FnMut() -> Fut,
    {
        let breaker = self.breaker(scope)?;
        let breaker = &breaker;
        let timeout = self.call_timeout;
        self.retry
            .execute(cancel, || {
                let attempt = op();
                async move {
                    breaker
                        .execute_classified(StoreError::is_transient, || {
                            bounded(timeout, attempt)
                        })
                        .await
                }
            })
            .await
    }

    /// One attempt under the breaker for `scope`, no retry.
    pub async fn call_once<T, Fut>(
        &self,
        scope: &str,
        op: Fut,
    ) -> Result<T, ResilienceError<StoreError>>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let breaker = self.breaker(scope)?;
        let timeout = self.call_timeout;
        breaker.execute_classified(StoreError::is_transient, || bounded(timeout, op)).await
    }

    fn breaker(&self, scope: &str) -> Result<CircuitBreakerPolicy, ResilienceError<StoreError>> {
        self.breakers
            .breaker(scope)
            .map_err(|e| ResilienceError::Inner(StoreError::Rejected(e.to_string())))
    }
}

async fn bounded<T, Fut>(limit: Duration, fut: Fut) -> Result<T, ResilienceError<StoreError>>
where
    Fut: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ResilienceError::Inner(e)),
        Err(_) => Err(ResilienceError::Inner(StoreError::Timeout(format!(
            "no reply within {}ms",
            limit.as_millis()
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sleeper::InstantSleeper;
    use crate::{Backoff, Jitter};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard(attempts: usize, clock: ManualClock) -> StoreGuard {
        let retry = RetryPolicy::builder()
            .max_attempts(attempts)
            .backoff(Backoff::constant(Duration::from_millis(1)))
            .with_jitter(Jitter::None)
            .should_retry(StoreError::is_transient)
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();
        let config = CircuitBreakerConfig::builder()
            .sliding_window_size(4)
            .minimum_calls(4)
            .failure_rate_threshold(50.0)
            .wait_duration_in_open(Duration::from_secs(5))
            .half_open_max_calls(1)
            .half_open_success_threshold(1)
            .build()
            .unwrap();
        let breakers = BreakerRegistry::new(config).unwrap().with_clock(Arc::new(clock));
        StoreGuard::new(retry, breakers, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn retries_until_the_breaker_opens() {
        let guard = guard(10, ManualClock::new());
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result: Result<(), _> = guard
            .call("login", &CancelToken::new(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Connection("refused".into()))
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(counter.load(Ordering::SeqCst), 4, "breaker stops the loop at minimum_calls");
        assert_eq!(guard.breakers().state("login"), CircuitState::Open);
        assert_eq!(guard.breakers().state("search"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn non_transient_errors_pass_through_uncounted() {
        let guard = guard(3, ManualClock::new());
        let result: Result<(), _> = guard
            .call("login", &CancelToken::new(), || async {
                Err(StoreError::Rejected("WRONGTYPE".into()))
            })
            .await;
        match result {
            Err(ResilienceError::Inner(StoreError::Rejected(_))) => {}
            other => panic!("unexpected {other:?}"),
        }
        let metrics = guard.breakers().get("login").unwrap().metrics();
        assert_eq!(metrics.buffered_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_call_times_out_as_transient() {
        let guard = guard(1, ManualClock::new());
        let result: Result<(), _> = guard
            .call_once("login", async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        match result {
            Err(ResilienceError::Inner(StoreError::Timeout(_))) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(guard.breakers().get("login").unwrap().metrics().failed_calls, 1);
    }

    #[tokio::test]
    async fn call_once_reports_open_breaker_without_calling() {
        let clock = ManualClock::new();
        let guard = guard(4, clock.clone());
        let _: Result<(), _> = guard
            .call("api", &CancelToken::new(), || async {
                Err(StoreError::Timeout("slow".into()))
            })
            .await;
        assert_eq!(guard.breakers().state("api"), CircuitState::Open);

        let counter = AtomicUsize::new(0);
        let result = guard
            .call_once("api", async {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(1u64)
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        clock.advance(5_000);
        assert_eq!(guard.call_once("api", async { Ok(2u64) }).await.unwrap(), 2);
        assert_eq!(guard.breakers().state("api"), CircuitState::Closed);
    }

    #[test]
    fn registry_reset_and_snapshot() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::default()).unwrap();
        assert!(!registry.reset("login"));
        registry.breaker("search").unwrap();
        registry.breaker("login").unwrap();
        assert!(registry.reset("login"));
        assert_eq!(
            registry.snapshot(),
            vec![
                ("login".to_string(), CircuitState::Closed),
                ("search".to_string(), CircuitState::Closed)
            ]
        );
    }

    #[test]
    fn worst_case_latency_adds_timeouts_and_backoff() {
        let guard = guard(3, ManualClock::new());
        // 3 × 50ms timeouts + 2 × 1ms constant backoff
        assert_eq!(guard.worst_case_latency(), Duration::from_millis(152));
    }
}
