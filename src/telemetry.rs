//! Limiter telemetry.
//!
//! The limiter reports decisions, fail-policy outcomes and breaker transitions as
//! [`LimiterEvent`]s. Sinks are `tower::Service<LimiterEvent>` implementations, so the usual
//! tower combinators apply. Delivery is best-effort: a sink that is not ready or that fails
//! simply loses the event, and the limiter's result is never affected.
//!
//! ```rust
//! use windowgate::telemetry::{LimiterEvent, MemorySink};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! let event = LimiterEvent::Decision { limiter: "login".into(), allowed: false };
//! sink.call(event.clone()).await.unwrap();
//! assert_eq!(sink.events(), vec![event]);
//! # }
//! ```

use crate::circuit_breaker::CircuitState;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tower::Service;

/// A `tower::Service` that consumes limiter events.
pub trait TelemetrySink:
    Service<LimiterEvent, Response = (), Error = Self::SinkError> + Clone + Send + Sync + 'static
{
    type SinkError: std::error::Error + Send + 'static;
}

/// Deliver `event` if the sink becomes ready; errors are dropped.
pub async fn emit_best_effort<S>(sink: S, event: LimiterEvent)
where
    S: Service<LimiterEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready) = sink.ready_oneshot().await {
        let _ = ready.call(event).await;
    }
}

/// Why the backing store was considered unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    CircuitOpen,
    RetryExhausted { attempts: usize },
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::CircuitOpen => write!(f, "circuit_open"),
            UnavailableReason::RetryExhausted { attempts } => {
                write!(f, "retry_exhausted(attempts={})", attempts)
            }
        }
    }
}

/// Events emitted by the limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimiterEvent {
    /// The store answered; `allowed` is the admission decision.
    Decision { limiter: String, allowed: bool },
    /// Store unavailable, request allowed by the fail-open policy.
    FailOpen { limiter: String, reason: UnavailableReason },
    /// Store unavailable, request rejected by the fail-closed policy.
    FailClosed { limiter: String, reason: UnavailableReason },
    /// A limiter's circuit breaker changed state. Every change is reported once, in order, by
    /// the next call on the limiter after it happened.
    CircuitTransition { limiter: String, from: CircuitState, to: CircuitState },
    /// The caller cancelled during backoff.
    Cancelled { limiter: String },
}

impl LimiterEvent {
    pub fn limiter(&self) -> &str {
        match self {
            LimiterEvent::Decision { limiter, .. }
            | LimiterEvent::FailOpen { limiter, .. }
            | LimiterEvent::FailClosed { limiter, .. }
            | LimiterEvent::CircuitTransition { limiter, .. }
            | LimiterEvent::Cancelled { limiter } => limiter,
        }
    }
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterEvent::Decision { limiter, allowed } => {
                write!(f, "Decision(limiter={}, allowed={})", limiter, allowed)
            }
            LimiterEvent::FailOpen { limiter, reason } => {
                write!(f, "FailOpen(limiter={}, reason={})", limiter, reason)
            }
            LimiterEvent::FailClosed { limiter, reason } => {
                write!(f, "FailClosed(limiter={}, reason={})", limiter, reason)
            }
            LimiterEvent::CircuitTransition { limiter, from, to } => {
                write!(f, "CircuitTransition(limiter={}, {} -> {})", limiter, from, to)
            }
            LimiterEvent::Cancelled { limiter } => write!(f, "Cancelled(limiter={})", limiter),
        }
    }
}

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// Discards every event. The limiter's default sink.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<LimiterEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: LimiterEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs each event through `tracing` at INFO.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<LimiterEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        tracing::info!(limiter = event.limiter(), event = %event, "limiter_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Bounded in-memory sink; the oldest event is evicted once full.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<LimiterEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Capacity 10,000.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<LimiterEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Events dropped because the sink was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LimiterEvent>> {
        self.events.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<LimiterEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Error from one side of a [`MulticastSink`].
#[derive(Debug)]
pub struct ComposedSinkError(Box<dyn std::error::Error + Send + Sync>);

impl fmt::Display for ComposedSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "telemetry sink error: {}", self.0)
    }
}

impl std::error::Error for ComposedSinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

/// Sends every event to both sinks concurrently.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    first: A,
    second: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A, B> Service<LimiterEvent> for MulticastSink<A, B>
where
    A: Service<LimiterEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: Service<LimiterEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = SinkFuture<ComposedSinkError>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        let mut first = self.first.clone();
        let mut second = self.second.clone();
        let copy = event.clone();

        Box::pin(async move {
            let (a, b) = tokio::join!(first.call(event), second.call(copy));
            a.map_err(|e| ComposedSinkError(Box::new(e)))?;
            b.map_err(|e| ComposedSinkError(Box::new(e)))?;
            Ok(())
        })
    }
}

impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: Service<LimiterEvent, Response = ()> + Clone + Send + Sync + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: Service<LimiterEvent, Response = ()> + Clone + Send + Sync + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = ComposedSinkError;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(allowed: bool) -> LimiterEvent {
        LimiterEvent::Decision { limiter: "api".into(), allowed }
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let sink = MemorySink::with_capacity(2);
        emit_best_effort(sink.clone(), decision(true)).await;
        emit_best_effort(sink.clone(), decision(false)).await;
        emit_best_effort(
            sink.clone(),
            LimiterEvent::Cancelled { limiter: "api".into() },
        )
        .await;

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.events()[0], decision(false));
        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn multicast_reaches_both_sinks() {
        let a = MemorySink::new();
        let b = MemorySink::new();
        emit_best_effort(MulticastSink::new(a.clone(), b.clone()), decision(true)).await;
        assert_eq!(a.events(), vec![decision(true)]);
        assert_eq!(b.events(), vec![decision(true)]);
    }

    #[derive(Clone)]
    struct Failing;

    #[derive(Debug, thiserror::Error)]
    #[error("sink down")]
    struct SinkDown;

    impl Service<LimiterEvent> for Failing {
        type Response = ();
        type Error = SinkDown;
        type Future = SinkFuture<SinkDown>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Err(SinkDown))
        }

        fn call(&mut self, _event: LimiterEvent) -> Self::Future {
            Box::pin(async { Err(SinkDown) })
        }
    }

    #[tokio::test]
    async fn failing_sink_is_ignored() {
        emit_best_effort(Failing, decision(true)).await;
    }

    #[test]
    fn display_is_compact() {
        let event = LimiterEvent::CircuitTransition {
            limiter: "login".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        };
        assert_eq!(event.to_string(), "CircuitTransition(limiter=login, closed -> open)");
        let fail = LimiterEvent::FailOpen {
            limiter: "login".into(),
            reason: UnavailableReason::RetryExhausted { attempts: 6 },
        };
        assert_eq!(fail.to_string(), "FailOpen(limiter=login, reason=retry_exhausted(attempts=6))");
        assert_eq!(fail.limiter(), "login");
    }
}
