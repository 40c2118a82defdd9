//! Per-limiter configuration and the settings document that builds a limiter.
//!
//! [`ConfigRegistry`] maps limiter names to [`LimiterConfig`] with a mandatory default, so a
//! lookup never comes back empty. The snapshot sits behind an `ArcSwap`: reads are lock-free and
//! [`ConfigRegistry::reload`] replaces the whole map at once.

use crate::backoff::{Backoff, BackoffError};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError};
use crate::jitter::{Jitter, JitterError};
use crate::key::DEFAULT_KEY_PREFIX;
use crate::retry::BuildError;
use arc_swap::ArcSwap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Invalid limit or window.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("limit must be > 0")]
    ZeroLimit,
    #[error("window must be > 0")]
    ZeroWindow,
}

/// Limit and window for one limiter name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    limit: u64,
    window: Duration,
}

impl LimiterConfig {
    /// ```
    /// use std::time::Duration;
    /// use windowgate::LimiterConfig;
    ///
    /// let cfg = LimiterConfig::new(5, Duration::from_secs(60)).unwrap();
    /// assert_eq!(cfg.window_millis(), 60_000);
    /// assert!(LimiterConfig::new(0, Duration::from_secs(1)).is_err());
    /// ```
    pub fn new(limit: u64, window: Duration) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::ZeroLimit);
        }
        if window.as_millis() == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        Ok(Self { limit, window })
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_millis(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    default: LimiterConfig,
    limiters: HashMap<String, LimiterConfig>,
}

/// Named limiter configurations with a mandatory default. Clones share the same snapshot.
#[derive(Debug, Clone)]
pub struct ConfigRegistry {
    inner: Arc<ArcSwap<Snapshot>>,
}

impl ConfigRegistry {
    pub fn new(default: LimiterConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(Snapshot { default, limiters: HashMap::new() })),
        }
    }

    /// Add or replace one named entry.
    pub fn with_limiter(self, name: impl Into<String>, config: LimiterConfig) -> Self {
        let name = name.into();
        self.inner.rcu(|cur| {
            let mut next = Snapshot::clone(cur);
            next.limiters.insert(name.clone(), config);
            next
        });
        self
    }

    /// The entry for `name`, or the default.
    pub fn config_for(&self, name: &str) -> LimiterConfig {
        let snap = self.inner.load();
        snap.limiters.get(name).copied().unwrap_or(snap.default)
    }

    pub fn default_config(&self) -> LimiterConfig {
        self.inner.load().default
    }

    /// Replace every entry in one swap; concurrent readers see either the old or the new map.
    pub fn reload<I, N>(&self, default: LimiterConfig, entries: I)
    where
        I: IntoIterator<Item = (N, LimiterConfig)>,
        N: Into<String>,
    {
        let limiters = entries.into_iter().map(|(n, c)| (n.into(), c)).collect();
        self.inner.store(Arc::new(Snapshot { default, limiters }));
        tracing::info!("limiter configuration reloaded");
    }

    /// Configured names, sorted. The default is not listed.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.load().limiters.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Error building a limiter from [`RateLimiterSettings`].
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("limiter '{name}': {source}")]
    Limiter {
        name: String,
        #[source]
        source: ConfigError,
    },
    #[error(transparent)]
    CircuitBreaker(#[from] CircuitBreakerError),
    #[error(transparent)]
    Backoff(#[from] BackoffError),
    #[error(transparent)]
    Jitter(#[from] JitterError),
    #[error(transparent)]
    Retry(#[from] BuildError),
    #[error("call_timeout_ms must be > 0")]
    ZeroCallTimeout,
    #[cfg(feature = "json-config")]
    #[error("invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "json-config")]
    #[error("reading settings file: {0}")]
    Io(#[from] std::io::Error),
}

/// Limit and window as written in a settings document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "json-config", derive(serde::Serialize, serde::Deserialize))]
pub struct LimitSettings {
    pub limit: u64,
    pub window_ms: u64,
}

impl LimitSettings {
    fn to_config(self, name: &str) -> Result<LimiterConfig, SettingsError> {
        LimiterConfig::new(self.limit, Duration::from_millis(self.window_ms))
            .map_err(|source| SettingsError::Limiter { name: name.to_owned(), source })
    }
}

/// Retry section. Total attempts are `1 + max_retries`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "json-config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "json-config", serde(default))]
pub struct RetrySettings {
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_fraction: f64,
    pub call_timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 25,
            max_backoff_ms: 400,
            jitter_fraction: 0.2,
            call_timeout_ms: 250,
        }
    }
}

impl RetrySettings {
    pub fn max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }

    pub fn backoff(&self) -> Result<Backoff, BackoffError> {
        Backoff::exponential(Duration::from_millis(self.initial_backoff_ms))
            .with_max(Duration::from_millis(self.max_backoff_ms))
    }

    pub fn jitter(&self) -> Result<Jitter, JitterError> {
        if self.jitter_fraction == 0.0 {
            Ok(Jitter::None)
        } else {
            Jitter::symmetric(self.jitter_fraction)
        }
    }

    pub fn call_timeout(&self) -> Result<Duration, SettingsError> {
        if self.call_timeout_ms == 0 {
            return Err(SettingsError::ZeroCallTimeout);
        }
        Ok(Duration::from_millis(self.call_timeout_ms))
    }
}

/// Circuit breaker section.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "json-config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "json-config", serde(default))]
pub struct CircuitBreakerSettings {
    pub failure_rate_threshold: f64,
    pub sliding_window_size: usize,
    pub minimum_calls: usize,
    pub wait_duration_in_open_ms: u64,
    pub half_open_max_calls: usize,
    pub half_open_success_threshold: usize,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let d = CircuitBreakerConfig::default();
        Self {
            failure_rate_threshold: d.failure_rate_threshold(),
            sliding_window_size: d.sliding_window_size(),
            minimum_calls: d.minimum_calls(),
            wait_duration_in_open_ms: d.wait_duration_in_open().as_millis() as u64,
            half_open_max_calls: d.half_open_max_calls(),
            half_open_success_threshold: d.half_open_success_threshold(),
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_config(&self) -> Result<CircuitBreakerConfig, CircuitBreakerError> {
        CircuitBreakerConfig::builder()
            .failure_rate_threshold(self.failure_rate_threshold)
            .sliding_window_size(self.sliding_window_size)
            .minimum_calls(self.minimum_calls)
            .wait_duration_in_open(Duration::from_millis(self.wait_duration_in_open_ms))
            .half_open_max_calls(self.half_open_max_calls)
            .half_open_success_threshold(self.half_open_success_threshold)
            .build()
    }
}

/// Everything needed to build a limiter, in one document.
///
/// ```
/// # #[cfg(feature = "json-config")] {
/// use windowgate::RateLimiterSettings;
///
/// let settings = RateLimiterSettings::from_json_str(
///     r#"{ "default": { "limit": 100, "window_ms": 60000 },
///          "limiters": { "login": { "limit": 5, "window_ms": 60000 } } }"#,
/// ).unwrap();
/// let registry = settings.registry().unwrap();
/// assert_eq!(registry.config_for("login").limit(), 5);
/// assert_eq!(registry.config_for("search").limit(), 100);
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "json-config", derive(serde::Serialize, serde::Deserialize))]
pub struct RateLimiterSettings {
    #[cfg_attr(feature = "json-config", serde(default))]
    pub fail_open: bool,
    #[cfg_attr(feature = "json-config", serde(default = "default_key_prefix"))]
    pub key_prefix: String,
    pub default: LimitSettings,
    #[cfg_attr(feature = "json-config", serde(default))]
    pub limiters: BTreeMap<String, LimitSettings>,
    #[cfg_attr(feature = "json-config", serde(default))]
    pub retry: RetrySettings,
    #[cfg_attr(feature = "json-config", serde(default))]
    pub circuit_breaker: CircuitBreakerSettings,
}

#[cfg(feature = "json-config")]
fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_owned()
}

impl RateLimiterSettings {
    /// Settings with the given default limit and every other section at its default.
    pub fn new(default: LimitSettings) -> Self {
        Self {
            fail_open: false,
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            default,
            limiters: BTreeMap::new(),
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }

    /// Validate the limit sections into a registry.
    pub fn registry(&self) -> Result<ConfigRegistry, SettingsError> {
        let mut registry = ConfigRegistry::new(self.default.to_config(crate::key::DEFAULT_LIMITER)?);
        for (name, limits) in &self.limiters {
            registry = registry.with_limiter(name.clone(), limits.to_config(name)?);
        }
        Ok(registry)
    }

    #[cfg(feature = "json-config")]
    pub fn from_json_str(json: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(json)?)
    }

    #[cfg(feature = "json-config")]
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    #[cfg(feature = "json-config")]
    pub fn to_json_string(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
