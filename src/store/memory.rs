//! In-process window store.
//!
//! Every key lives behind a single mutex, which plays the role the script engine plays in a
//! shared store: one admission step at a time, evict-count-insert as a unit. Useful for single
//! instance deployments and for tests; it provides no coordination between processes.
//!
//! Expired keys are dropped when they are next touched, and a sweep over all keys runs at most
//! once per sweep interval from inside `acquire`/`count`, so identifiers that never return
//! do not accumulate.

use super::{WindowRequest, WindowStore};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default minimum spacing between full expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct SortedWindow {
    // (score, member); ordering by score first keeps eviction a prefix split
    entries: BTreeSet<(u64, String)>,
    expires_at: u64,
}

impl SortedWindow {
    fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at != 0 && self.expires_at <= now_millis
    }

    fn evict_before(&mut self, min_score: u64) {
        let kept = self.entries.split_off(&(min_score, String::new()));
        self.entries = kept;
    }

    fn count_between(&self, min_score: u64, max_score: u64) -> u64 {
        if min_score > max_score {
            return 0;
        }
        self.entries
            .range((min_score, String::new())..)
            .take_while(|(score, _)| *score <= max_score)
            .count() as u64
    }
}

#[derive(Debug, Default)]
struct Shelf {
    windows: HashMap<String, SortedWindow>,
    swept_at: u64,
}

impl Shelf {
    fn purge(&mut self, now_millis: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.is_expired(now_millis));
        self.swept_at = now_millis;
        before - self.windows.len()
    }

    fn maybe_sweep(&mut self, now_millis: u64, interval: u64) {
        if now_millis.saturating_sub(self.swept_at) >= interval {
            let removed = self.purge(now_millis);
            if removed > 0 {
                tracing::trace!(removed, remaining = self.windows.len(), "expired windows swept");
            }
        }
    }
}

/// Shared in-memory sorted-set store. Clones share the same data.
#[derive(Debug, Clone)]
pub struct InMemoryWindowStore {
    shelf: Arc<Mutex<Shelf>>,
    sweep_interval_millis: u64,
}

impl Default for InMemoryWindowStore {
    fn default() -> Self {
        Self {
            shelf: Arc::default(),
            sweep_interval_millis: DEFAULT_SWEEP_INTERVAL.as_millis() as u64,
        }
    }
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Minimum spacing, in store time, between sweeps of every expired key.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_millis = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Number of stored keys, including expired ones not swept yet.
    pub fn len(&self) -> usize {
        self.lock().windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().windows.is_empty()
    }

    /// Entries currently stored under `key`, expired or not.
    pub fn entries(&self, key: &str) -> usize {
        self.lock().windows.get(key).map_or(0, |w| w.entries.len())
    }

    /// Drop every key whose TTL elapsed at `now_millis`; returns how many were removed.
    pub fn purge_expired(&self, now_millis: u64) -> usize {
        self.lock().purge(now_millis)
    }

    fn lock(&self) -> MutexGuard<'_, Shelf> {
        self.shelf.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn acquire(&self, key: &str, request: WindowRequest) -> Result<bool, StoreError> {
        if request.limit == 0 {
            return Err(StoreError::Rejected("limit must be > 0".into()));
        }
        let now = request.now_millis;
        let mut shelf = self.lock();
        shelf.maybe_sweep(now, self.sweep_interval_millis);

        let window = shelf.windows.entry(key.to_owned()).or_default();
        if window.is_expired(now) {
            window.entries.clear();
        }
        window.expires_at = now.saturating_add(request.ttl_millis);

        // a retry of an already admitted call finds its own entry
        let window_start = request.window_start();
        let entry = (now, request.member);
        if window.entries.contains(&entry) {
            return Ok(true);
        }

        window.evict_before(window_start);
        let allowed = (window.entries.len() as u64) < request.limit;
        if allowed {
            window.entries.insert(entry);
        }
        Ok(allowed)
    }

    async fn count(&self, key: &str, min_score: u64, max_score: u64) -> Result<u64, StoreError> {
        let mut shelf = self.lock();
        shelf.maybe_sweep(max_score, self.sweep_interval_millis);

        let expired = match shelf.windows.get(key) {
            Some(window) if !window.is_expired(max_score) => {
                return Ok(window.count_between(min_score, max_score));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            shelf.windows.remove(key);
        }
        Ok(0)
    }
}
