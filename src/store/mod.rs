//! Backing stores for the sliding-window counter.
//!
//! A [`WindowStore`] keeps, per key, a sorted set of window entries scored by their timestamp in
//! milliseconds. [`WindowStore::acquire`] is the atomic admission step and must be serialized by
//! the store itself (a server-side script, a transaction, or the store's own lock), never by a
//! client-side lock, so that any number of limiter instances can share one store.
//!
//! Implementations obtain their connection inside each call. Nothing is held between calls, so
//! retry sleeps never pin a pooled connection.

use crate::error::StoreError;
use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

pub use memory::InMemoryWindowStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisWindowStore;

/// One atomic admission request against a key's window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    /// Window length; entries scored below `now_millis - window_millis` are evicted first.
    pub window_millis: u64,
    /// Maximum number of entries allowed inside the window.
    pub limit: u64,
    /// Caller's clock reading; the score of the new entry.
    pub now_millis: u64,
    /// Unique member value for the new entry.
    pub member: String,
    /// Expiry applied to the whole key after the check.
    pub ttl_millis: u64,
}

impl WindowRequest {
    /// Lowest score still inside the window.
    pub fn window_start(&self) -> u64 {
        self.now_millis.saturating_sub(self.window_millis)
    }
}

/// Storage interface for sliding-window state.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Atomically: evict entries scored below `now - window`, count the rest, add `member` at
    /// `now` if the count is below `limit`, and refresh the key TTL.
    ///
    /// Returns `Ok(true)` when the entry was added (allow), `Ok(false)` otherwise (deny).
    async fn acquire(&self, key: &str, request: WindowRequest) -> Result<bool, StoreError>;

    /// Count entries with `min_score <= score <= max_score`. Not atomic with respect to
    /// concurrent `acquire` calls.
    async fn count(&self, key: &str, min_score: u64, max_score: u64) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> WindowStore for std::sync::Arc<S>
where
    S: WindowStore + ?Sized,
{
    async fn acquire(&self, key: &str, request: WindowRequest) -> Result<bool, StoreError> {
        (**self).acquire(key, request).await
    }

    async fn count(&self, key: &str, min_score: u64, max_score: u64) -> Result<u64, StoreError> {
        (**self).count(key, min_score, max_score).await
    }
}
