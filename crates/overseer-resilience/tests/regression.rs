#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Regression tests for overseer-resilience: circuit breaker lifecycle,
//! rate limit windows, and request deduplication.

use overseer_core::OverseerError;
use overseer_resilience::*;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- CircuitBreaker ---

#[tokio::test]
async fn test_breaker_opens_recovers_and_closes() {
    let breaker = CircuitBreaker::new(
        "payments",
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_ms: 60,
            success_threshold: 2,
        },
    );

    for _ in 0..3 {
        let res = breaker
            .call(|| async { Err::<(), _>(OverseerError::Tool("503".into())) })
            .await;
        assert!(matches!(res, Err(OverseerError::Tool(_))));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let calls = AtomicU32::new(0);
    let rejected = breaker
        .call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    match rejected {
        Err(OverseerError::CircuitOpen { name, retry_after_ms }) => {
            assert_eq!(name, "payments");
            assert!(retry_after_ms <= 60);
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(80)).await;
    breaker.call(|| async { Ok(()) }).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    breaker.call(|| async { Ok(()) }).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);

    let snap = breaker.snapshot();
    assert_eq!(snap.failure_count, 0);
    assert!(snap.opened_at.is_none());
    assert_eq!(snap.rejected_calls, 1);
}

#[tokio::test]
async fn test_registry_call_creates_breaker_on_demand() {
    let registry = CircuitBreakerRegistry::default();
    let out = registry.call("search", || async { Ok(5) }).await.unwrap();
    assert_eq!(out, 5);
    let snaps = registry.snapshots();
    assert_eq!(snaps.len(), 1);
    assert_eq!(snaps[0].name, "search");
    assert_eq!(snaps[0].state, CircuitState::Closed);
    assert_eq!(snaps[0].config, CircuitBreakerConfig::default());
}

#[test]
fn test_breaker_config_defaults_from_toml_like_json() {
    let cfg: CircuitBreakerConfig = serde_json::from_value(json!({})).unwrap();
    assert_eq!(cfg.failure_threshold, 5);
    assert_eq!(cfg.recovery_timeout_ms, 30_000);
    assert_eq!(cfg.success_threshold, 2);
}

// --- RateLimiter ---

#[tokio::test]
async fn test_rate_limit_allows_exactly_five_per_minute() {
    let limiter = RateLimiter::new(RateLimitConfig::per_minute(5));
    for _ in 0..5 {
        assert!(limiter.check("agent-a").await.allowed);
    }
    let denied = limiter.check("agent-a").await;
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);
    let retry = denied.retry_after.unwrap();
    assert!(retry > Duration::ZERO && retry <= Duration::from_secs(60));

    // Principals are tracked independently.
    assert!(limiter.check("agent-b").await.allowed);
}

#[tokio::test]
async fn test_rate_limit_enforce_maps_to_error() {
    let limiter = RateLimiter::new(RateLimitConfig::per_minute(1));
    limiter.enforce("p").await.unwrap();
    let err = limiter.enforce("p").await.unwrap_err();
    assert!(matches!(
        err,
        OverseerError::RateLimitExceeded { ref principal, .. } if principal == "p"
    ));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_rate_limit_custom_config_overrides_default() {
    let limiter = RateLimiter::new(RateLimitConfig::per_minute(1));
    limiter
        .set_custom_config("vip", RateLimitConfig::per_minute(3))
        .await;
    for _ in 0..3 {
        assert!(limiter.check("vip").await.allowed);
    }
    assert!(!limiter.check("vip").await.allowed);

    let usage = limiter.usage("vip").await;
    let minute = usage
        .iter()
        .find(|u| u.window == RateWindow::Minute)
        .unwrap();
    assert_eq!(minute.used, 3);
    assert_eq!(minute.limit, 3);

    limiter.reset("vip").await;
    assert!(limiter.check("vip").await.allowed);
}

// --- RequestDeduplicator ---

async fn run_batch(keys: Vec<String>) -> u32 {
    let dedup = Arc::new(RequestDeduplicator::<String>::new());
    let runs = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::new();
    for key in keys {
        let dedup = Arc::clone(&dedup);
        let runs = Arc::clone(&runs);
        handles.push(tokio::spawn(async move {
            let echo = key.clone();
            dedup
                .deduplicate(key, move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    Ok(echo)
                })
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    runs.load(Ordering::SeqCst)
}

#[tokio::test]
async fn test_dedup_identical_requests_execute_once() {
    let key = canonical_key("search", &json!({"q": "rust", "limit": 10}));
    let runs = run_batch(vec![key; 5]).await;
    assert_eq!(runs, 1);
}

#[tokio::test]
async fn test_dedup_distinct_requests_execute_each() {
    let keys = (0..5)
        .map(|i| canonical_key("search", &json!({"q": "rust", "page": i})))
        .collect();
    let runs = run_batch(keys).await;
    assert_eq!(runs, 5);
}
