#![cfg(feature = "json-config")]

use std::time::Duration;
use windowgate::{
    CircuitBreakerConfig, InMemoryWindowStore, LimitSettings, RateLimiterSettings, SettingsError,
    SlidingWindowLimiter,
};

const DOCUMENT: &str = r#"{
  "fail_open": true,
  "key_prefix": "gate",
  "default": { "limit": 100, "window_ms": 60000 },
  "limiters": { "login": { "limit": 2, "window_ms": 60000 } },
  "retry": { "max_retries": 2, "initial_backoff_ms": 10, "max_backoff_ms": 40,
             "jitter_fraction": 0.1, "call_timeout_ms": 100 },
  "circuit_breaker": { "failure_rate_threshold": 75.0, "sliding_window_size": 8,
                       "minimum_calls": 4, "wait_duration_in_open_ms": 1000,
                       "half_open_max_calls": 1, "half_open_success_threshold": 2 }
}"#;

#[tokio::test]
async fn limiter_from_json_document() {
    let settings = RateLimiterSettings::from_json_str(DOCUMENT).unwrap();
    let store = InMemoryWindowStore::new();
    let limiter = SlidingWindowLimiter::from_settings(store.clone(), &settings).unwrap();

    assert!(limiter.is_fail_open());
    assert_eq!(limiter.key_prefix(), "gate");
    assert_eq!(limiter.registry().names(), vec!["login".to_string()]);
    assert_eq!(limiter.breakers().config().failure_rate_threshold(), 75.0);

    assert!(limiter.try_acquire("login:a").await.unwrap());
    assert!(limiter.try_acquire("login:a").await.unwrap());
    assert!(!limiter.try_acquire("login:a").await.unwrap());
    assert_eq!(store.entries("gate:login:a"), 2);
}

#[test]
fn json_round_trip_preserves_settings() {
    let settings = RateLimiterSettings::from_json_str(DOCUMENT).unwrap();
    let again = RateLimiterSettings::from_json_str(&settings.to_json_string().unwrap()).unwrap();
    assert_eq!(settings, again);
}

#[test]
fn settings_file_is_read() {
    let path = std::env::temp_dir().join(format!("windowgate-settings-{}.json", std::process::id()));
    std::fs::write(&path, DOCUMENT).unwrap();
    let settings = RateLimiterSettings::from_json_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(settings.limiters["login"], LimitSettings { limit: 2, window_ms: 60_000 });

    let missing = RateLimiterSettings::from_json_file(path.with_extension("missing")).unwrap_err();
    assert!(matches!(missing, SettingsError::Io(_)));
}

#[test]
fn invalid_sections_are_rejected() {
    let mut settings = RateLimiterSettings::new(LimitSettings { limit: 10, window_ms: 1_000 });
    settings.circuit_breaker.minimum_calls = 50;
    let err = SlidingWindowLimiter::from_settings(InMemoryWindowStore::new(), &settings).unwrap_err();
    assert!(matches!(err, SettingsError::CircuitBreaker(_)));

    let mut settings = RateLimiterSettings::new(LimitSettings { limit: 10, window_ms: 1_000 });
    settings.retry.jitter_fraction = 1.5;
    let err = SlidingWindowLimiter::from_settings(InMemoryWindowStore::new(), &settings).unwrap_err();
    assert!(matches!(err, SettingsError::Jitter(_)));

    let mut settings = RateLimiterSettings::new(LimitSettings { limit: 10, window_ms: 1_000 });
    settings.retry.max_backoff_ms = 5;
    let err = SlidingWindowLimiter::from_settings(InMemoryWindowStore::new(), &settings).unwrap_err();
    assert!(matches!(err, SettingsError::Backoff(_)));
}

#[test]
fn defaults_fill_missing_sections() {
    let settings =
        RateLimiterSettings::from_json_str(r#"{ "default": { "limit": 5, "window_ms": 1000 } }"#)
            .unwrap();
    assert!(!settings.fail_open);
    assert_eq!(settings.retry.max_attempts(), 6);
    assert_eq!(settings.retry.call_timeout().unwrap(), Duration::from_millis(250));
    assert_eq!(settings.circuit_breaker.to_config().unwrap(), CircuitBreakerConfig::default());
}
