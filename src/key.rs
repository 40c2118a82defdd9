//! Rate-limit keys.
//!
//! A key has the form `"{limiter}:{identifier}"`, split at the first `:`. The limiter name selects
//! the configuration and the circuit breaker; the identifier selects the window. Keys without a
//! usable limiter part fall back to the `default` limiter with the whole key as identifier.

use std::fmt;

/// Limiter name used when a key carries none.
pub const DEFAULT_LIMITER: &str = "default";

/// Default prefix for storage keys.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit";

/// A parsed `limiter:identifier` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey<'a> {
    limiter: &'a str,
    identifier: &'a str,
}

impl<'a> RateLimitKey<'a> {
    /// Parse a raw key. Never fails.
    ///
    /// ```
    /// use windowgate::RateLimitKey;
    ///
    /// let key = RateLimitKey::parse("login:user-42");
    /// assert_eq!(key.limiter_name(), "login");
    /// assert_eq!(key.identifier(), "user-42");
    ///
    /// let bare = RateLimitKey::parse("10.0.0.1");
    /// assert_eq!(bare.limiter_name(), "default");
    /// assert_eq!(bare.identifier(), "10.0.0.1");
    /// ```
    pub fn parse(raw: &'a str) -> Self {
        match raw.split_once(':') {
            Some((limiter, identifier)) if !limiter.is_empty() && !identifier.is_empty() => {
                Self { limiter, identifier }
            }
            _ => Self { limiter: DEFAULT_LIMITER, identifier: raw },
        }
    }

    pub fn limiter_name(&self) -> &'a str {
        self.limiter
    }

    pub fn identifier(&self) -> &'a str {
        self.identifier
    }

    /// `"{prefix}:{limiter}:{identifier}"`
    pub fn storage_key(&self, prefix: &str) -> String {
        format!("{}:{}:{}", prefix, self.limiter, self.identifier)
    }
}

impl fmt::Display for RateLimitKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.limiter, self.identifier)
    }
}
