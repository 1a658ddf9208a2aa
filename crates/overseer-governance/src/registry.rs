use crate::audit::AuditLog;
use crate::tool::{Tool, ToolOutput, ToolSpec};
use crate::usage::{ToolUsageRecord, UsageLedger, UsageReport, UsageStatus};
use overseer_core::{OverseerError, OverseerResult};
use overseer_resilience::{canonical_key, CircuitBreakerRegistry, DedupStats, RequestDeduplicator};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct RegisteredTool {
    spec: ToolSpec,
    tool: Arc<dyn Tool>,
}

/// Catalog of governed tools and the ledger of every call made to them.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    ledger: UsageLedger,
    audit: Option<Arc<AuditLog>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    dedup: RequestDeduplicator<Value>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            ledger: UsageLedger::new(),
            audit: None,
            breakers: None,
            dedup: RequestDeduplicator::new(),
        }
    }

    /// Mirror every usage record to a JSONL audit file.
    pub fn with_audit_log(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Run tool calls through per-tool circuit breakers named `tool:<name>`.
    pub fn with_circuit_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Add a tool, replacing any earlier registration under the same name.
    pub fn register(&self, spec: ToolSpec, tool: Arc<dyn Tool>) -> OverseerResult<()> {
        if spec.name.trim().is_empty() {
            return Err(OverseerError::Config("tool name must not be empty".into()));
        }
        let name = spec.name.clone();
        let replaced = self
            .tools
            .write()
            .insert(name.clone(), RegisteredTool { spec, tool })
            .is_some();
        if replaced {
            warn!(tool = %name, "Replaced existing tool registration");
        } else {
            info!(tool = %name, "Registered tool");
        }
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tools.write().remove(name).is_some()
    }

    pub fn spec(&self, name: &str) -> Option<ToolSpec> {
        self.tools.read().get(name).map(|t| t.spec.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// All tool specs, sorted by name.
    pub fn list_specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.read().values().map(|t| t.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn tool_count(&self) -> usize {
        self.tools.read().len()
    }

    /// Append a usage record to the ledger and the audit log.
    pub fn record_usage(&self, record: ToolUsageRecord) {
        if let Some(audit) = &self.audit {
            audit.record(&record);
        }
        self.ledger.append(record);
    }

    /// How many idempotent calls ran versus joined one already in flight.
    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    pub fn usage_records(&self) -> Vec<ToolUsageRecord> {
        self.ledger.records()
    }

    pub fn usage_report(&self, window: Option<Duration>) -> UsageReport {
        self.ledger.report(window)
    }

    /// Invoke a tool and record the outcome. Governance checks happen in the
    /// guard before this is reached.
    pub(crate) async fn invoke(
        &self,
        agent_id: &str,
        user_id: Option<&str>,
        tool_name: &str,
        params: Map<String, Value>,
    ) -> OverseerResult<ToolOutput> {
        let (tool, idempotent) = self
            .tools
            .read()
            .get(tool_name)
            .map(|t| (Arc::clone(&t.tool), t.spec.idempotent))
            .ok_or_else(|| OverseerError::Tool(format!("Unknown tool: {tool_name}")))?;

        let recorded_params = Value::Object(params.clone());
        let run = {
            let breakers = self.breakers.clone();
            let breaker_name = format!("tool:{tool_name}");
            move || async move {
                match breakers {
                    Some(breakers) => breakers.call(&breaker_name, || tool.invoke(params)).await,
                    None => tool.invoke(params).await,
                }
            }
        };
        let started = Instant::now();
        let outcome = if idempotent {
            self.dedup
                .deduplicate(canonical_key(tool_name, &recorded_params), run)
                .await
        } else {
            run().await
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                let output_size = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
                debug!(tool = %tool_name, agent_id = %agent_id, duration_ms, "Tool call succeeded");
                self.record_usage(
                    ToolUsageRecord::new(
                        agent_id,
                        user_id.map(String::from),
                        tool_name,
                        recorded_params,
                        UsageStatus::Success,
                    )
                    .with_timing(duration_ms, output_size),
                );
                Ok(ToolOutput {
                    tool_name: tool_name.to_string(),
                    value,
                    duration_ms,
                    output_size,
                })
            }
            Err(e) => {
                warn!(tool = %tool_name, agent_id = %agent_id, error = %e, "Tool call failed");
                self.record_usage(
                    ToolUsageRecord::new(
                        agent_id,
                        user_id.map(String::from),
                        tool_name,
                        recorded_params,
                        UsageStatus::Error,
                    )
                    .with_timing(duration_ms, 0),
                );
                Err(e)
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::tool::tool_fn;
    use overseer_resilience::{CircuitBreakerConfig, CircuitState};
    use serde_json::json;

    #[test]
    fn test_register_and_list() {
        let reg = ToolRegistry::new();
        reg.register(ToolSpec::new("b"), tool_fn(|_| async { Ok(json!(null)) }))
            .unwrap();
        reg.register(ToolSpec::new("a"), tool_fn(|_| async { Ok(json!(null)) }))
            .unwrap();
        assert!(reg
            .register(ToolSpec::new(" "), tool_fn(|_| async { Ok(json!(null)) }))
            .is_err());
        let names: Vec<String> = reg.list_specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(reg.unregister("a"));
        assert_eq!(reg.tool_count(), 1);
    }

    #[tokio::test]
    async fn test_invoke_records_usage() {
        let reg = ToolRegistry::new();
        reg.register(
            ToolSpec::new("echo"),
            tool_fn(|p| async move { Ok(Value::Object(p)) }),
        )
        .unwrap();
        let mut params = Map::new();
        params.insert("x".into(), json!(1));
        let out = reg.invoke("a1", Some("u1"), "echo", params).await.unwrap();
        assert_eq!(out.value, json!({"x": 1}));
        assert_eq!(out.output_size, 7);

        let records = reg.usage_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, UsageStatus::Success);
        assert_eq!(records[0].user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_failing_tool_trips_its_breaker() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout_ms: 60_000,
            success_threshold: 1,
        }));
        let reg = ToolRegistry::new().with_circuit_breakers(Arc::clone(&breakers));
        reg.register(
            ToolSpec::new("flaky"),
            tool_fn(|_| async { Err(OverseerError::Tool("timeout".into())) }),
        )
        .unwrap();

        for _ in 0..2 {
            let err = reg.invoke("a1", None, "flaky", Map::new()).await.unwrap_err();
            assert!(matches!(err, OverseerError::Tool(_)));
        }
        let err = reg.invoke("a1", None, "flaky", Map::new()).await.unwrap_err();
        assert!(matches!(err, OverseerError::CircuitOpen { .. }));
        assert_eq!(
            breakers.get("tool:flaky").unwrap().state(),
            CircuitState::Open
        );
        assert_eq!(reg.usage_report(None).by_tool["flaky"].calls, 3);
    }

    #[tokio::test]
    async fn test_concurrent_identical_calls_to_idempotent_tool_run_once() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let runs = Arc::new(AtomicU32::new(0));
        let reg = Arc::new(ToolRegistry::new());
        let counter = Arc::clone(&runs);
        reg.register(
            ToolSpec::new("lookup").idempotent(),
            tool_fn(move |p| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Value::Object(p))
                }
            }),
        )
        .unwrap();

        let mut params = Map::new();
        params.insert("q".into(), json!("rust"));
        let calls: Vec<_> = (0..4)
            .map(|i| {
                let reg = Arc::clone(&reg);
                let params = params.clone();
                tokio::spawn(async move {
                    reg.invoke(&format!("a{i}"), None, "lookup", params).await
                })
            })
            .collect();
        for call in calls {
            assert_eq!(call.await.unwrap().unwrap().value, json!({"q": "rust"}));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let stats = reg.dedup_stats();
        assert_eq!((stats.executed, stats.deduplicated, stats.in_flight), (1, 3, 0));
        // Each caller still gets its own usage record.
        assert_eq!(reg.usage_report(None).by_tool["lookup"].calls, 4);

        // Different parameters are a different request.
        params.insert("q".into(), json!("go"));
        reg.invoke("a0", None, "lookup", params).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_idempotent_tool_runs_every_call() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let runs = Arc::new(AtomicU32::new(0));
        let reg = Arc::new(ToolRegistry::new());
        let counter = Arc::clone(&runs);
        reg.register(
            ToolSpec::new("append"),
            tool_fn(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(json!(null))
                }
            }),
        )
        .unwrap();
        let calls: Vec<_> = (0..3)
            .map(|_| {
                let reg = Arc::clone(&reg);
                tokio::spawn(async move { reg.invoke("a1", None, "append", Map::new()).await })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(reg.dedup_stats().executed, 0);
    }
}
