#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use windowgate::{
    Backoff, CircuitBreakerConfig, ConfigRegistry, InMemoryWindowStore, InstantSleeper, Jitter,
    LimiterConfig, ManualClock, SeededRandom, SlidingWindowLimiterBuilder, StoreError,
    WindowRequest, WindowStore, SlidingWindowLimiter,
};

/// In-memory store that can be switched into an outage.
#[derive(Debug, Clone, Default)]
pub struct FlakyStore {
    inner: InMemoryWindowStore,
    down: Arc<AtomicBool>,
    rejecting: Arc<AtomicBool>,
    lose_reply: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Answer every call with a non-transient rejection.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Apply the next `acquire` but report a timeout to the caller.
    pub fn lose_next_reply(&self) {
        self.lose_reply.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryWindowStore {
        &self.inner
    }

    fn check(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("WRONGTYPE Operation against a key".into()));
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl WindowStore for FlakyStore {
    async fn acquire(&self, key: &str, request: WindowRequest) -> Result<bool, StoreError> {
        self.check()?;
        let allowed = self.inner.acquire(key, request).await?;
        if self.lose_reply.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Timeout("reply lost".into()));
        }
        Ok(allowed)
    }

    async fn count(&self, key: &str, min_score: u64, max_score: u64) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.count(key, min_score, max_score).await
    }
}

pub fn limit(limit: u64, window: Duration) -> LimiterConfig {
    LimiterConfig::new(limit, window).unwrap()
}

/// Small breaker (window 4, opens at 50%, 5s wait, 1 probe closes) and instant retries.
pub fn test_builder<S: WindowStore>(store: S, clock: &ManualClock) -> SlidingWindowLimiterBuilder<S> {
    let breaker = CircuitBreakerConfig::builder()
        .sliding_window_size(4)
        .minimum_calls(4)
        .failure_rate_threshold(50.0)
        .wait_duration_in_open(Duration::from_secs(5))
        .half_open_max_calls(1)
        .half_open_success_threshold(1)
        .build()
        .unwrap();
    SlidingWindowLimiter::builder(store)
        .registry(
            ConfigRegistry::new(limit(100, Duration::from_secs(60)))
                .with_limiter("login", limit(3, Duration::from_secs(10))),
        )
        .retry(3, Backoff::exponential(Duration::from_millis(10)), Jitter::None)
        .circuit_breaker(breaker)
        .clock(Arc::new(clock.clone()))
        .random(Arc::new(SeededRandom::new(42)))
        .sleeper(Arc::new(InstantSleeper))
}

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Captures log output for the current thread while the guard is alive.
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    _guard: tracing::subscriber::DefaultGuard,
}

impl LogCapture {
    pub fn start() -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .without_time()
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        Self { buffer, _guard: guard }
    }

    pub fn contents(&self) -> String {
        String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
    }
}
