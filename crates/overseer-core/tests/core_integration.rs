#![allow(clippy::unwrap_used, clippy::expect_used)]

use overseer_core::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// 1. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn test_error_display_and_from_impls() {
    let not_found = OverseerError::TaskNotFound("t-1".to_string());
    assert_eq!(not_found.to_string(), "Task not found: t-1");

    let dup = OverseerError::AgentAlreadyRegistered("coder-1".to_string());
    assert_eq!(dup.to_string(), "Agent already registered: coder-1");

    let open = OverseerError::CircuitOpen {
        name: "search-api".to_string(),
        retry_after_ms: 1500,
    };
    assert_eq!(
        open.to_string(),
        "Circuit 'search-api' is open; retry after 1500ms"
    );

    let limited = OverseerError::RateLimitExceeded {
        principal: "user-9".to_string(),
        retry_after_ms: 42,
    };
    assert!(limited.to_string().contains("user-9"));

    let bad_json = serde_json::from_str::<serde_json::Value>("not json");
    let err: OverseerError = bad_json.unwrap_err().into();
    assert!(err.to_string().starts_with("JSON error:"));

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
    let err: OverseerError = io_err.into();
    assert!(err.to_string().starts_with("IO error:"));
}

// ---------------------------------------------------------------------------
// 2. Errors are cloneable and comparable so shared outcomes stay identical
// ---------------------------------------------------------------------------

#[test]
fn test_error_clone_is_equal() {
    let err = OverseerError::violation("a", ViolationKind::InvalidParameters, "forbidden: path");
    let copy = err.clone();
    assert_eq!(err, copy);
}

// ---------------------------------------------------------------------------
// 3. ViolationKind serializes to snake_case
// ---------------------------------------------------------------------------

#[test]
fn test_violation_kind_serialization() {
    let json = serde_json::to_string(&ViolationKind::AccessDenied).unwrap();
    assert_eq!(json, "\"access_denied\"");
    let kind: ViolationKind = serde_json::from_str("\"rate_limited\"").unwrap();
    assert_eq!(kind, ViolationKind::RateLimited);
}

// ---------------------------------------------------------------------------
// 4. Per-subscriber ordering under concurrent publishers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_bus_preserves_order_per_subscriber() {
    let bus: MessageBus<(u32, u32)> = MessageBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.register(
        "sub",
        handler_fn(move |msg: (u32, u32)| {
            let sink = Arc::clone(&sink);
            async move {
                tokio::task::yield_now().await;
                sink.lock().await.push(msg);
                Ok(())
            }
        }),
    )
    .unwrap();
    bus.subscribe("sub", "events").unwrap();

    let mut publishers = Vec::new();
    for publisher in 0..4u32 {
        let bus = bus.clone();
        publishers.push(tokio::spawn(async move {
            for seq in 0..50u32 {
                bus.publish("events", (publisher, seq));
                tokio::task::yield_now().await;
            }
        }));
    }
    for p in publishers {
        p.await.unwrap();
    }
    bus.shutdown().await;

    let seen = seen.lock().await;
    assert_eq!(seen.len(), 200);
    // Each publisher's messages arrive in the order they were published.
    for publisher in 0..4u32 {
        let seqs: Vec<u32> = seen
            .iter()
            .filter(|(p, _)| *p == publisher)
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(seqs, (0..50).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_bus_delivers_a_b_c_in_order() {
    let bus: MessageBus<&'static str> = MessageBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.register(
        "sub",
        handler_fn(move |msg| {
            let sink = Arc::clone(&sink);
            async move {
                // Slow handler: later messages queue up behind it.
                tokio::time::sleep(Duration::from_millis(5)).await;
                sink.lock().await.push(msg);
                Ok(())
            }
        }),
    )
    .unwrap();
    bus.subscribe("sub", "t").unwrap();
    for m in ["A", "B", "C"] {
        bus.publish("t", m);
    }
    bus.unregister("sub").await.unwrap();
    assert_eq!(*seen.lock().await, vec!["A", "B", "C"]);
}
