use futures_util::future::{BoxFuture, FutureExt, Shared};
use overseer_core::{OverseerError, OverseerResult};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

type SharedOutcome<T> = Shared<BoxFuture<'static, OverseerResult<T>>>;

/// Counters for a [`RequestDeduplicator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    /// Operations actually run.
    pub executed: u64,
    /// Callers that joined an operation already in flight.
    pub deduplicated: u64,
    pub in_flight: usize,
}

/// Collapses concurrent identical requests into a single execution.
///
/// The first caller for a key runs the operation; callers arriving while it
/// is in flight await the same outcome. The key is released as soon as the
/// operation finishes, so a later call runs again.
pub struct RequestDeduplicator<T> {
    in_flight: Arc<Mutex<HashMap<String, SharedOutcome<T>>>>,
    executed: AtomicU64,
    deduplicated: AtomicU64,
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            executed: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
        }
    }

    /// Run `op` unless an identical request keyed by `key` is in flight, in
    /// which case wait for and return its outcome.
    pub async fn deduplicate<F, Fut>(&self, key: impl Into<String>, op: F) -> OverseerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OverseerResult<T>> + Send + 'static,
    {
        let key = key.into();
        let shared = {
            let mut map = self.in_flight.lock();
            if let Some(existing) = map.get(&key) {
                self.deduplicated.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Joining in-flight request");
                existing.clone()
            } else {
                self.executed.fetch_add(1, Ordering::Relaxed);
                let registry = Arc::clone(&self.in_flight);
                let owned_key = key.clone();
                let fut = op();
                let shared = async move {
                    // A panicking operation must still release its key.
                    let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(payload) => {
                            let reason = panic_message(payload.as_ref());
                            warn!(key = %owned_key, reason = %reason, "Deduplicated operation panicked");
                            Err(OverseerError::Tool(format!("operation panicked: {reason}")))
                        }
                    };
                    registry.lock().remove(&owned_key);
                    outcome
                }
                .boxed()
                .shared();
                map.insert(key, shared.clone());
                shared
            }
        };
        shared.await
    }

    /// Number of distinct requests currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            executed: self.executed.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}

impl<T> Default for RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Stable key for `operation` applied to `params`.
///
/// Object keys are sorted recursively before hashing, so two parameter
/// objects that differ only in key order produce the same key.
pub fn canonical_key(operation: &str, params: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(params, &mut canonical);
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    format!("{operation}:{}", hex::encode(hasher.finalize()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(&map[k], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use overseer_core::OverseerError;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn test_identical_calls_run_once() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new());
        let runs = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let dedup = Arc::clone(&dedup);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                dedup
                    .deduplicate("same", move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(99)
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 99);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let stats = dedup.stats();
        assert_eq!(stats.executed, 1);
        assert_eq!(stats.deduplicated, 4);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_errors_are_shared() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new());
        let a = {
            let d = Arc::clone(&dedup);
            tokio::spawn(async move {
                d.deduplicate("k", || async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Err(OverseerError::Tool("boom".into()))
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = dedup.deduplicate("k", || async { Ok(1) }).await;
        assert_eq!(b, Err(OverseerError::Tool("boom".into())));
        assert!(a.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_key_released_after_completion() {
        let dedup = RequestDeduplicator::<u32>::new();
        assert_eq!(dedup.deduplicate("k", || async { Ok(1) }).await.unwrap(), 1);
        assert_eq!(dedup.deduplicate("k", || async { Ok(2) }).await.unwrap(), 2);
        assert_eq!(dedup.stats().executed, 2);
    }

    #[tokio::test]
    async fn test_panicking_operation_releases_its_key() {
        let dedup = Arc::new(RequestDeduplicator::<u32>::new());
        let outcome = dedup
            .deduplicate("k", || async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                if true {
                    panic!("worker blew up");
                }
                Ok(0)
            })
            .await;
        match outcome {
            Err(OverseerError::Tool(msg)) => assert!(msg.contains("worker blew up")),
            other => panic!("expected a tool error, got {other:?}"),
        }
        assert_eq!(dedup.in_flight(), 0);
        assert_eq!(dedup.deduplicate("k", || async { Ok(7) }).await.unwrap(), 7);
        assert_eq!(dedup.stats().executed, 2);
    }

    #[test]
    fn test_canonical_key_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": "s"}});
        let b = json!({"a": {"x": "s", "y": [1, 2]}, "b": 1});
        assert_eq!(canonical_key("search", &a), canonical_key("search", &b));
        assert_ne!(canonical_key("search", &a), canonical_key("fetch", &a));
        let c = json!({"a": {"x": "s", "y": [2, 1]}, "b": 1});
        assert_ne!(canonical_key("search", &a), canonical_key("search", &c));
    }
}
