//! Failure-rate circuit breaker guarding backing-store calls.
//!
//! State lives behind an `Arc`, so clones share one lifecycle:
//!
//! - **Closed**: calls run and their outcomes fill a count-based window of the last
//!   `sliding_window_size` calls. Once `minimum_calls` outcomes are recorded and the failure rate
//!   reaches `failure_rate_threshold` percent, the breaker opens.
//! - **Open**: calls are rejected with [`ResilienceError::CircuitOpen`] until
//!   `wait_duration_in_open` has elapsed; the next caller moves the breaker to half-open.
//! - **HalfOpen**: at most `half_open_max_calls` probes run concurrently. Any probe failure
//!   reopens; `half_open_success_threshold` consecutive successes close and clear the window.
//!
//! Only errors the caller classifies as failures are counted. Everything else (non-transient
//! errors, cancellation) releases its probe slot without moving the state machine. Outcomes of
//! calls admitted before the latest state change are dropped, so a slow probe from an earlier
//! half-open period neither frees a slot nor votes in the current one.

use crate::clock::{Clock, MonotonicClock};
use crate::ResilienceError;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the open wait elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("failure_rate_threshold must be within (0, 100] (got {0})")]
    InvalidFailureRate(f64),
    #[error("sliding_window_size must be > 0")]
    InvalidWindowSize,
    #[error("minimum_calls must be within 1..=sliding_window_size (got {provided}, window {window})")]
    InvalidMinimumCalls { provided: usize, window: usize },
    #[error("wait_duration_in_open must be > 0")]
    InvalidOpenWait,
    #[error("half_open_max_calls must be > 0")]
    InvalidHalfOpenLimit,
    #[error("half_open_success_threshold must be > 0")]
    InvalidSuccessThreshold,
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    failure_rate_threshold: f64,
    sliding_window_size: usize,
    minimum_calls: usize,
    wait_duration_in_open: Duration,
    half_open_max_calls: usize,
    half_open_success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            sliding_window_size: 20,
            minimum_calls: 10,
            wait_duration_in_open: Duration::from_secs(30),
            half_open_max_calls: 3,
            half_open_success_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder { config: Self::default() }
    }

    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self {
            failure_rate_threshold: f64::INFINITY,
            minimum_calls: usize::MAX,
            ..Self::default()
        }
    }

    pub fn failure_rate_threshold(&self) -> f64 {
        self.failure_rate_threshold
    }

    pub fn sliding_window_size(&self) -> usize {
        self.sliding_window_size
    }

    pub fn minimum_calls(&self) -> usize {
        self.minimum_calls
    }

    pub fn wait_duration_in_open(&self) -> Duration {
        self.wait_duration_in_open
    }

    pub fn half_open_max_calls(&self) -> usize {
        self.half_open_max_calls
    }

    pub fn half_open_success_threshold(&self) -> usize {
        self.half_open_success_threshold
    }

    fn is_disabled(&self) -> bool {
        self.minimum_calls == usize::MAX
    }

    fn validate(&self) -> Result<(), CircuitBreakerError> {
        if self.sliding_window_size == 0 {
            return Err(CircuitBreakerError::InvalidWindowSize);
        }
        if !self.is_disabled() {
            let rate = self.failure_rate_threshold;
            if !(rate > 0.0 && rate <= 100.0) {
                return Err(CircuitBreakerError::InvalidFailureRate(rate));
            }
            if self.minimum_calls == 0 || self.minimum_calls > self.sliding_window_size {
                return Err(CircuitBreakerError::InvalidMinimumCalls {
                    provided: self.minimum_calls,
                    window: self.sliding_window_size,
                });
            }
        }
        if self.wait_duration_in_open.is_zero() {
            return Err(CircuitBreakerError::InvalidOpenWait);
        }
        if self.half_open_max_calls == 0 {
            return Err(CircuitBreakerError::InvalidHalfOpenLimit);
        }
        if self.half_open_success_threshold == 0 {
            return Err(CircuitBreakerError::InvalidSuccessThreshold);
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]; `build` validates.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Failure percentage (0, 100] at which a closed breaker opens.
    pub fn failure_rate_threshold(mut self, percent: f64) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    /// Number of most recent outcomes considered.
    pub fn sliding_window_size(mut self, size: usize) -> Self {
        self.config.sliding_window_size = size;
        self
    }

    /// Outcomes required before the failure rate is evaluated.
    pub fn minimum_calls(mut self, calls: usize) -> Self {
        self.config.minimum_calls = calls;
        self
    }

    pub fn wait_duration_in_open(mut self, wait: Duration) -> Self {
        self.config.wait_duration_in_open = wait;
        self
    }

    pub fn half_open_max_calls(mut self, calls: usize) -> Self {
        self.config.half_open_max_calls = calls;
        self
    }

    pub fn half_open_success_threshold(mut self, successes: usize) -> Self {
        self.config.half_open_success_threshold = successes;
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, CircuitBreakerError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Ring of the most recent call outcomes (`true` = failed).
#[derive(Debug)]
struct OutcomeWindow {
    outcomes: VecDeque<bool>,
    capacity: usize,
    failures: usize,
}

impl OutcomeWindow {
    fn new(capacity: usize) -> Self {
        Self { outcomes: VecDeque::with_capacity(capacity.min(1024)), capacity, failures: 0 }
    }

    /// Record an outcome; returns `(calls, failures)` afterwards.
    fn record(&mut self, failed: bool) -> (usize, usize) {
        if self.outcomes.len() == self.capacity {
            if let Some(true) = self.outcomes.pop_front() {
                self.failures -= 1;
            }
        }
        self.outcomes.push_back(failed);
        if failed {
            self.failures += 1;
        }
        (self.outcomes.len(), self.failures)
    }

    fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
    }
}

#[derive(Debug, Default)]
struct ProbeCount {
    // epoch at which the current half-open period began
    generation: u64,
    in_flight: usize,
}

#[derive(Debug)]
struct BreakerState {
    state: AtomicU8,
    // bumped on every state change
    epoch: AtomicU64,
    opened_at_millis: AtomicU64,
    probes: Mutex<ProbeCount>,
    half_open_successes: AtomicUsize,
    window: Mutex<OutcomeWindow>,
}

impl BreakerState {
    fn lock_probes(&self) -> MutexGuard<'_, ProbeCount> {
        self.probes.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Callback run on every state change with the breaker name and the `(from, to)` states.
#[derive(Clone)]
pub struct TransitionListener(Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>);

impl TransitionListener {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl std::fmt::Debug for TransitionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransitionListener")
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub buffered_calls: usize,
    pub failed_calls: usize,
    /// Percentage of failed calls in the window; `None` below `minimum_calls`.
    pub failure_rate: Option<f64>,
}

/// Circuit breaker policy guarding an async operation.
#[derive(Debug, Clone)]
pub struct CircuitBreakerPolicy {
    state: Arc<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    name: Arc<str>,
    listener: Option<TransitionListener>,
}

/// Admission ticket for one call. A half-open probe releases its slot on drop, even if the
/// guarded future panics or is dropped, but only within the half-open period that issued it.
struct Permit<'a> {
    state: &'a BreakerState,
    epoch: u64,
    probe: bool,
}

impl Permit<'_> {
    fn is_current(&self) -> bool {
        self.state.epoch.load(Ordering::Acquire) == self.epoch
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.probe {
            return;
        }
        let mut probes = self.state.lock_probes();
        if probes.generation == self.epoch {
            probes.in_flight = probes.in_flight.saturating_sub(1);
        }
    }
}

impl CircuitBreakerPolicy {
    /// Breaker with a validated config and a monotonic clock.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, CircuitBreakerError> {
        config.validate()?;
        let window = OutcomeWindow::new(config.sliding_window_size);
        Ok(Self {
            state: Arc::new(BreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                epoch: AtomicU64::new(0),
                opened_at_millis: AtomicU64::new(0),
                probes: Mutex::new(ProbeCount::default()),
                half_open_successes: AtomicUsize::new(0),
                window: Mutex::new(window),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
            name: Arc::from("default"),
            listener: None,
        })
    }

    /// Run `listener` on every state change of this breaker and its clones.
    pub fn with_listener(mut self, listener: TransitionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Name reported in log fields.
    pub fn with_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.state.load(Ordering::Acquire))
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let window = self.lock_window();
        let calls = window.outcomes.len();
        let failure_rate = (calls >= self.config.minimum_calls && calls > 0)
            .then(|| window.failures as f64 * 100.0 / calls as f64);
        CircuitBreakerMetrics {
            state: self.state(),
            buffered_calls: calls,
            failed_calls: window.failures,
            failure_rate,
        }
    }

    /// Force the breaker closed and forget recorded outcomes.
    pub fn reset(&self) {
        let previous = CircuitState::from_u8(self.state.state.swap(STATE_CLOSED, Ordering::AcqRel));
        let epoch = self.state.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.opened_at_millis.store(0, Ordering::Release);
        self.state.half_open_successes.store(0, Ordering::Release);
        *self.state.lock_probes() = ProbeCount { generation: epoch, in_flight: 0 };
        self.lock_window().clear();
        tracing::info!(breaker = %self.name, from = %previous, "circuit breaker reset → closed");
        if previous != CircuitState::Closed {
            self.notify(previous, CircuitState::Closed);
        }
    }

    /// Run `operation`, counting every `Inner` error as a failure.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        self.execute_classified(|_: &E| true, operation).await
    }

    /// Run `operation` under breaker protection; `is_failure` decides which `Inner` errors count.
    ///
    /// # Errors
    /// `CircuitOpen` when open (before the wait elapses) or when half-open probe slots are taken;
    /// otherwise whatever `operation` returns.
    pub async fn execute_classified<T, E, Fut, Op, C>(
        &self,
        is_failure: C,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
        C: Fn(&E) -> bool,
    {
        let permit = self.admit()?;
        let result = operation().await;
        let current = permit.is_current();
        drop(permit);

        if current {
            match &result {
                Ok(_) => self.on_success(),
                Err(ResilienceError::Inner(e)) if is_failure(e) => self.on_failure(),
                Err(_) => {}
            }
        }
        result
    }

    fn admit<E>(&self) -> Result<Permit<'_>, ResilienceError<E>> {
        loop {
            // read before the state: a change in between leaves this permit stale
            let epoch = self.state.epoch.load(Ordering::Acquire);
            match self.state() {
                CircuitState::Closed => {
                    return Ok(Permit { state: &self.state, epoch, probe: false });
                }
                CircuitState::Open => {
                    let elapsed = self.open_elapsed();
                    if elapsed < self.config.wait_duration_in_open {
                        return Err(self.open_error(elapsed));
                    }
                    if let Some(epoch) = self.enter_half_open() {
                        tracing::info!(
                            breaker = %self.name,
                            waited_ms = elapsed.as_millis() as u64,
                            "circuit breaker → half-open"
                        );
                        self.notify(CircuitState::Open, CircuitState::HalfOpen);
                        return Ok(Permit { state: &self.state, epoch, probe: true });
                    }
                    // lost the race; re-read the state
                }
                CircuitState::HalfOpen => {
                    let mut probes = self.state.lock_probes();
                    if self.state() != CircuitState::HalfOpen {
                        continue;
                    }
                    if probes.in_flight >= self.config.half_open_max_calls {
                        drop(probes);
                        return Err(self.open_error(self.open_elapsed()));
                    }
                    probes.in_flight += 1;
                    let (generation, in_flight) = (probes.generation, probes.in_flight);
                    drop(probes);
                    tracing::debug!(
                        breaker = %self.name,
                        in_flight,
                        max = self.config.half_open_max_calls,
                        "circuit breaker: half-open probe"
                    );
                    return Ok(Permit { state: &self.state, epoch: generation, probe: true });
                }
            }
        }
    }

    /// Open → HalfOpen under the probe lock, so no caller sees half-open before the new
    /// period's slot count is in place. Returns the new epoch on success.
    fn enter_half_open(&self) -> Option<u64> {
        let mut probes = self.state.lock_probes();
        self.state
            .state
            .compare_exchange(STATE_OPEN, STATE_HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let epoch = self.state.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.half_open_successes.store(0, Ordering::Release);
        *probes = ProbeCount { generation: epoch, in_flight: 1 };
        Some(epoch)
    }

    fn on_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.lock_window().record(false);
            }
            CircuitState::HalfOpen => {
                let successes = self.state.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.half_open_success_threshold
                    && self.transition(CircuitState::HalfOpen, CircuitState::Closed)
                {
                    self.lock_window().clear();
                    self.state.half_open_successes.store(0, Ordering::Release);
                    tracing::info!(breaker = %self.name, successes, "circuit breaker → closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let (calls, failures) = self.lock_window().record(true);
                if calls < self.config.minimum_calls {
                    return;
                }
                let rate = failures as f64 * 100.0 / calls as f64;
                if rate >= self.config.failure_rate_threshold
                    && self.transition(CircuitState::Closed, CircuitState::Open)
                {
                    tracing::error!(
                        breaker = %self.name,
                        failures,
                        calls,
                        failure_rate = rate,
                        threshold = self.config.failure_rate_threshold,
                        "circuit breaker → open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                if self.transition(CircuitState::HalfOpen, CircuitState::Open) {
                    tracing::warn!(breaker = %self.name, "circuit breaker: probe failed → open");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        let swapped = self
            .state
            .state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.state.epoch.fetch_add(1, Ordering::AcqRel);
            if to == CircuitState::Open {
                self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                self.state.half_open_successes.store(0, Ordering::Release);
            }
            self.notify(from, to);
        }
        swapped
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        if let Some(listener) = &self.listener {
            (listener.0)(&self.name, from, to);
        }
    }

    fn open_elapsed(&self) -> Duration {
        let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
        Duration::from_millis(self.clock.now_millis().saturating_sub(opened_at))
    }

    fn open_error<E>(&self, elapsed: Duration) -> ResilienceError<E> {
        ResilienceError::CircuitOpen {
            failed_calls: self.lock_window().failures,
            open_duration: elapsed,
        }
    }

    fn lock_window(&self) -> MutexGuard<'_, OutcomeWindow> {
        self.state.window.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::StoreError;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(window: usize, min: usize, probes: usize, successes: usize) -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_rate_threshold(50.0)
            .sliding_window_size(window)
            .minimum_calls(min)
            .wait_duration_in_open(Duration::from_millis(100))
            .half_open_max_calls(probes)
            .half_open_success_threshold(successes)
            .build()
            .expect("valid config")
    }

    fn breaker(cfg: CircuitBreakerConfig) -> (CircuitBreakerPolicy, ManualClock) {
        let clock = ManualClock::new();
        let b = CircuitBreakerPolicy::new(cfg).unwrap().with_clock(Arc::new(clock.clone()));
        (b, clock)
    }

    async fn fail(b: &CircuitBreakerPolicy) -> Result<(), ResilienceError<StoreError>> {
        b.execute_classified(StoreError::is_transient, || async {
            Err(ResilienceError::Inner(StoreError::Connection("down".into())))
        })
        .await
    }

    async fn succeed(b: &CircuitBreakerPolicy) -> Result<(), ResilienceError<StoreError>> {
        b.execute_classified(StoreError::is_transient, || async { Ok(()) }).await
    }

    #[test]
    fn builder_validates() {
        let err = CircuitBreakerConfig::builder().failure_rate_threshold(0.0).build();
        assert_eq!(err, Err(CircuitBreakerError::InvalidFailureRate(0.0)));
        let err = CircuitBreakerConfig::builder().sliding_window_size(4).minimum_calls(5).build();
        assert!(matches!(err, Err(CircuitBreakerError::InvalidMinimumCalls { provided: 5, .. })));
        let err = CircuitBreakerConfig::builder().wait_duration_in_open(Duration::ZERO).build();
        assert_eq!(err, Err(CircuitBreakerError::InvalidOpenWait));
        let err = CircuitBreakerConfig::builder().half_open_max_calls(0).build();
        assert_eq!(err, Err(CircuitBreakerError::InvalidHalfOpenLimit));
        assert!(CircuitBreakerConfig::builder().build().is_ok());
    }

    #[tokio::test]
    async fn stays_closed_below_minimum_calls() {
        let (b, _) = breaker(config(10, 4, 1, 1));
        for _ in 0..3 {
            assert!(matches!(fail(&b).await, Err(ResilienceError::Inner(_))));
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.metrics().failure_rate, None);
    }

    #[tokio::test]
    async fn opens_when_failure_rate_reaches_threshold() {
        let (b, _) = breaker(config(4, 4, 1, 1));
        succeed(&b).await.unwrap();
        succeed(&b).await.unwrap();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);
        // 2 of 4 failed = 50%
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let rejected = b
            .execute(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ResilienceError<StoreError>>(())
            })
            .await;
        assert!(rejected.unwrap_err().is_circuit_open());
        assert_eq!(counter.load(Ordering::SeqCst), 0, "open breaker must not run the operation");
    }

    #[tokio::test]
    async fn window_slides_out_old_failures() {
        let (b, _) = breaker(config(4, 4, 1, 1));
        fail(&b).await.unwrap_err();
        for _ in 0..4 {
            succeed(&b).await.unwrap();
        }
        let m = b.metrics();
        assert_eq!(m.buffered_calls, 4);
        assert_eq!(m.failed_calls, 0);
        assert_eq!(m.failure_rate, Some(0.0));
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_counted() {
        let (b, _) = breaker(config(2, 2, 1, 1));
        for _ in 0..10 {
            let r: Result<(), _> = b
                .execute_classified(StoreError::is_transient, || async {
                    Err(ResilienceError::Inner(StoreError::Rejected("WRONGTYPE".into())))
                })
                .await;
            assert!(matches!(r, Err(ResilienceError::Inner(StoreError::Rejected(_)))));
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.metrics().buffered_calls, 0);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes() {
        let (b, clock) = breaker(config(2, 2, 1, 1));
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        clock.advance(50);
        assert!(succeed(&b).await.unwrap_err().is_circuit_open());

        clock.advance(60);
        succeed(&b).await.expect("probe admitted");
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.metrics().buffered_calls, 0, "window cleared on close");
    }

    #[tokio::test]
    async fn half_open_needs_consecutive_successes() {
        let (b, clock) = breaker(config(2, 2, 3, 2));
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        clock.advance(100);

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let (b, clock) = breaker(config(2, 2, 1, 1));
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        clock.advance(100);

        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
        // the open wait restarts from the probe failure
        clock.advance(50);
        assert!(succeed(&b).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_probes() {
        let (b, clock) = breaker(config(2, 2, 1, 1));
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        clock.advance(100);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let holder = b.clone();
        let probe = tokio::spawn(async move {
            holder
                .execute(|| async move {
                    let _ = rx.await;
                    Ok::<_, ResilienceError<StoreError>>(())
                })
                .await
        });
        tokio::task::yield_now().await;
        while b.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }

        assert!(succeed(&b).await.unwrap_err().is_circuit_open());
        tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn probe_slot_released_on_panic() {
        let (b, clock) = breaker(config(2, 2, 1, 1));
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        clock.advance(100);

        let result = std::panic::AssertUnwindSafe(async {
            let r: Result<(), ResilienceError<StoreError>> =
                b.execute(|| async { panic!("boom") }).await;
            r
        })
        .catch_unwind()
        .await;
        assert!(result.is_err());
        assert_eq!(b.state.lock_probes().in_flight, 0);
    }

    type Held = (
        tokio::sync::oneshot::Sender<()>,
        tokio::task::JoinHandle<Result<(), ResilienceError<StoreError>>>,
    );

    /// Start a call that stays inside the breaker until the sender fires.
    fn hold(b: &CircuitBreakerPolicy, outcome: Result<(), StoreError>) -> Held {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let holder = b.clone();
        let handle = tokio::spawn(async move {
            holder
                .execute_classified(StoreError::is_transient, || async move {
                    let _ = rx.await;
                    outcome.map_err(ResilienceError::Inner)
                })
                .await
        });
        (tx, handle)
    }

    async fn wait_for_probes(b: &CircuitBreakerPolicy, n: usize) {
        while b.state.lock_probes().in_flight != n || b.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn stale_probe_does_not_free_a_slot_in_the_next_half_open_period() {
        let (b, clock) = breaker(config(2, 2, 2, 3));
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        clock.advance(100);

        let (old_tx, old) = hold(&b, Ok(()));
        let (fail_tx, failing) = hold(&b, Err(StoreError::Connection("down".into())));
        wait_for_probes(&b, 2).await;

        fail_tx.send(()).unwrap();
        failing.await.unwrap().unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        clock.advance(100);
        let (new_a_tx, new_a) = hold(&b, Ok(()));
        let (new_b_tx, new_b) = hold(&b, Ok(()));
        wait_for_probes(&b, 2).await;

        // the probe from the first period finishes late
        old_tx.send(()).unwrap();
        old.await.unwrap().unwrap();
        assert_eq!(b.state.lock_probes().in_flight, 2);
        assert_eq!(b.state.half_open_successes.load(Ordering::Acquire), 0);
        assert!(succeed(&b).await.unwrap_err().is_circuit_open(), "both slots still taken");

        new_a_tx.send(()).unwrap();
        new_b_tx.send(()).unwrap();
        new_a.await.unwrap().unwrap();
        new_b.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn listener_sees_every_transition() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let (b, clock) = breaker(config(2, 2, 1, 1));
        let b = b.with_name("login").with_listener(TransitionListener::new(move |name, from, to| {
            log.lock().unwrap().push((name.to_string(), from, to));
        }));

        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        clock.advance(100);
        succeed(&b).await.unwrap();
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        b.reset();
        b.reset();

        use CircuitState::*;
        let seen: Vec<_> = seen.lock().unwrap().iter().map(|(_, f, t)| (*f, *t)).collect();
        assert_eq!(
            seen,
            vec![
                (Closed, Open),
                (Open, HalfOpen),
                (HalfOpen, Closed),
                (Closed, Open),
                (Open, Closed)
            ]
        );
    }

    #[test]
    fn disabled_breaker_still_needs_a_window() {
        let err = CircuitBreakerConfig::builder()
            .minimum_calls(usize::MAX)
            .sliding_window_size(0)
            .build();
        assert_eq!(err, Err(CircuitBreakerError::InvalidWindowSize));
        assert!(CircuitBreakerPolicy::new(CircuitBreakerConfig::disabled()).is_ok());
    }

    #[tokio::test]
    async fn disabled_never_opens() {
        let (b, _) = breaker(CircuitBreakerConfig::disabled());
        for _ in 0..500 {
            fail(&b).await.unwrap_err();
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_closes_and_clears() {
        let (b, _) = breaker(config(2, 2, 1, 1));
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        succeed(&b).await.unwrap();
    }
}
