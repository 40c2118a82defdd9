//! Tower middleware gating a service with a [`SlidingWindowLimiter`].
//!
//! A key function maps each request to a `"limiter:identifier"` key; the request reaches the
//! inner service only when the limiter admits it.
//!
//! ```rust
//! use std::sync::Arc;
//! use tower::{service_fn, Layer, Service, ServiceExt};
//! use windowgate::middleware::RateLimitLayer;
//! use windowgate::{InMemoryWindowStore, SlidingWindowLimiter};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let limiter = Arc::new(SlidingWindowLimiter::builder(InMemoryWindowStore::new()).build().unwrap());
//! let layer = RateLimitLayer::new(limiter, |user: &String| format!("api:{user}"));
//! let mut svc = layer.layer(service_fn(|user: String| async move {
//!     Ok::<_, std::io::Error>(format!("hello {user}"))
//! }));
//!
//! let reply = svc.ready().await.unwrap().call("ana".to_string()).await.unwrap();
//! assert_eq!(reply, "hello ana");
//! # }
//! ```

use crate::error::RateLimiterError;
use crate::limiter::SlidingWindowLimiter;
use crate::store::WindowStore;
use crate::telemetry::{LimiterEvent, NullSink, TelemetrySink};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Error returned by [`RateLimitService`].
#[derive(Debug)]
pub enum RateLimitError<E> {
    /// The window for `key` is full.
    RateLimited { key: String },
    /// The limiter could not decide (fail-closed, cancelled, or a store rejection).
    Limiter(RateLimiterError),
    /// The inner service failed.
    Inner(E),
}

impl<E> RateLimitError<E> {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RateLimitError::RateLimited { .. })
    }
}

impl<E: fmt::Display> fmt::Display for RateLimitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::RateLimited { key } => write!(f, "rate limit exceeded for '{}'", key),
            RateLimitError::Limiter(e) => write!(f, "{}", e),
            RateLimitError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RateLimitError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RateLimitError::Limiter(e) => Some(e),
            RateLimitError::Inner(e) => Some(e),
            RateLimitError::RateLimited { .. } => None,
        }
    }
}

/// Layer producing [`RateLimitService`]s that share one limiter.
pub struct RateLimitLayer<W, K, T = NullSink> {
    limiter: Arc<SlidingWindowLimiter<W, T>>,
    key_fn: Arc<K>,
}

impl<W, K, T> RateLimitLayer<W, K, T> {
    pub fn new(limiter: Arc<SlidingWindowLimiter<W, T>>, key_fn: K) -> Self {
        Self { limiter, key_fn: Arc::new(key_fn) }
    }
}

impl<W, K, T> Clone for RateLimitLayer<W, K, T> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), key_fn: self.key_fn.clone() }
    }
}

impl<S, W, K, T> Layer<S> for RateLimitLayer<W, K, T> {
    type Service = RateLimitService<S, W, K, T>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService { inner, limiter: self.limiter.clone(), key_fn: self.key_fn.clone() }
    }
}

/// Service that checks the limiter before calling `inner`.
pub struct RateLimitService<S, W, K, T = NullSink> {
    inner: S,
    limiter: Arc<SlidingWindowLimiter<W, T>>,
    key_fn: Arc<K>,
}

impl<S: Clone, W, K, T> Clone for RateLimitService<S, W, K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<S, W, K, T, Req> Service<Req> for RateLimitService<S, W, K, T>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    W: WindowStore + 'static,
    K: Fn(&Req) -> String + Send + Sync + 'static,
    T: TelemetrySink,
    <T as Service<LimiterEvent>>::Future: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = RateLimitError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(RateLimitError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let key = (self.key_fn)(&req);
        // take the service that was driven to readiness, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match limiter.try_acquire(&key).await {
                Ok(true) => inner.call(req).await.map_err(RateLimitError::Inner),
                Ok(false) => Err(RateLimitError::RateLimited { key }),
                Err(e) => Err(RateLimitError::Limiter(e)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigRegistry, LimiterConfig};
    use crate::store::InMemoryWindowStore;
    use std::time::Duration;
    use tower::{service_fn, ServiceExt};

    fn limiter(limit: u64) -> Arc<SlidingWindowLimiter<InMemoryWindowStore>> {
        let registry =
            ConfigRegistry::new(LimiterConfig::new(limit, Duration::from_secs(60)).unwrap());
        Arc::new(
            SlidingWindowLimiter::builder(InMemoryWindowStore::new())
                .registry(registry)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn denies_once_window_is_full() {
        let layer = RateLimitLayer::new(limiter(1), |req: &u32| format!("svc:{req}"));
        let svc = layer.layer(service_fn(|req: u32| async move { Ok::<_, std::io::Error>(req) }));

        assert_eq!(svc.clone().oneshot(7).await.unwrap(), 7);
        let err = svc.clone().oneshot(7).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.to_string(), "rate limit exceeded for 'svc:7'");
        assert_eq!(svc.oneshot(8).await.unwrap(), 8, "other keys unaffected");
    }

    #[tokio::test]
    async fn inner_errors_pass_through() {
        let layer = RateLimitLayer::new(limiter(5), |_: &()| "svc:x".to_string());
        let svc = layer.layer(service_fn(|_: ()| async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        }));
        match svc.oneshot(()).await {
            Err(RateLimitError::Inner(e)) => assert_eq!(e.to_string(), "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
