#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for overseer-governance: access precedence, approval
//! gating through a channel, and audit persistence.

use async_trait::async_trait;
use overseer_core::{
    ApprovalChannel, ApprovalDecision, ApprovalRequest, OverseerError, OverseerResult, RiskLevel,
    ViolationKind,
};
use overseer_governance::*;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn registry_with_tools(calls: Arc<AtomicU32>) -> Arc<ToolRegistry> {
    let reg = Arc::new(ToolRegistry::new());
    let counting = move || {
        let calls = Arc::clone(&calls);
        tool_fn(move |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"ok": true}))
            }
        })
    };
    reg.register(ToolSpec::new("search").with_rate_limit(3), counting())
        .unwrap();
    reg.register(
        ToolSpec::new("transfer_funds")
            .requiring_approval()
            .with_risk_level(RiskLevel::Critical)
            .with_rate_limit(1),
        counting(),
    )
    .unwrap();
    reg.register(
        ToolSpec::new("file_read").with_forbidden_parameters(["password"]),
        counting(),
    )
    .unwrap();
    reg
}

// --- Access precedence ---

#[tokio::test]
async fn test_ungranted_tool_is_always_denied() {
    let calls = Arc::new(AtomicU32::new(0));
    let perms = PermissionsEngine::new(registry_with_tools(Arc::clone(&calls)));
    perms.grant("analyst", "search");

    // Exhaust analyst's search window; transfer_funds is still plain Deny.
    for _ in 0..3 {
        perms.admit("analyst", "search");
    }
    assert!(matches!(
        perms.check_access("analyst", "search"),
        AccessDecision::RateLimited { .. }
    ));
    for _ in 0..5 {
        assert!(matches!(
            perms.check_access("analyst", "transfer_funds"),
            AccessDecision::Deny { .. }
        ));
    }
}

#[tokio::test]
async fn test_approval_gated_tool_requires_approval_not_allow() {
    let calls = Arc::new(AtomicU32::new(0));
    let reg = registry_with_tools(Arc::clone(&calls));
    let perms = Arc::new(PermissionsEngine::new(Arc::clone(&reg)));
    perms.grant("treasurer", "transfer_funds");
    assert_eq!(
        perms.check_access("treasurer", "transfer_funds"),
        AccessDecision::RequireApproval
    );

    let guard = ExecutionGuard::new(Arc::clone(&perms));
    let outcome = guard
        .execute(
            &InvocationContext::agent("treasurer"),
            "transfer_funds",
            Map::new(),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, GuardOutcome::PendingApproval(_)));
    // Parked, not executed.
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The parked call consumed the per-minute budget of 1.
    let err = guard
        .execute(
            &InvocationContext::agent("treasurer"),
            "transfer_funds",
            Map::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OverseerError::ContractViolation {
            violation: ViolationKind::RateLimited,
            ..
        }
    ));
}

// --- Guard + approval channel ---

struct RecordingChannel {
    approve: bool,
    seen: parking_lot::Mutex<Vec<ApprovalRequest>>,
}

#[async_trait]
impl ApprovalChannel for RecordingChannel {
    async fn request_approval(&self, request: ApprovalRequest) -> OverseerResult<ApprovalDecision> {
        self.seen.lock().push(request);
        Ok(if self.approve {
            ApprovalDecision::approve("ops")
        } else {
            ApprovalDecision::reject("ops", "outside change window")
        })
    }
}

#[tokio::test]
async fn test_approval_channel_resolves_synchronously() {
    let calls = Arc::new(AtomicU32::new(0));
    let reg = registry_with_tools(Arc::clone(&calls));
    let perms = Arc::new(PermissionsEngine::new(Arc::clone(&reg)));
    perms.set_permissions("treasurer", ToolPermissionSet::all());

    let channel = Arc::new(RecordingChannel {
        approve: true,
        seen: parking_lot::Mutex::new(Vec::new()),
    });
    let guard = ExecutionGuard::new(perms).with_approval_channel(channel.clone());
    let mut params = Map::new();
    params.insert("amount".into(), json!(100));
    let out = guard
        .execute_with_approval(
            &InvocationContext::agent("treasurer").with_user("cfo"),
            "transfer_funds",
            params,
        )
        .await
        .unwrap();
    assert_eq!(out.value, json!({"ok": true}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let seen = channel.seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].risk_level, RiskLevel::Critical);
    assert_eq!(seen[0].parameters, json!({"amount": 100}));
}

#[tokio::test]
async fn test_rejected_approval_never_runs_tool() {
    let calls = Arc::new(AtomicU32::new(0));
    let reg = registry_with_tools(Arc::clone(&calls));
    let perms = Arc::new(PermissionsEngine::new(Arc::clone(&reg)));
    perms.grant("treasurer", "transfer_funds");
    let guard = ExecutionGuard::new(perms).with_approval_channel(Arc::new(RecordingChannel {
        approve: false,
        seen: parking_lot::Mutex::new(Vec::new()),
    }));
    let err = guard
        .execute_with_approval(
            &InvocationContext::agent("treasurer"),
            "transfer_funds",
            Map::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OverseerError::Tool(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let report = reg.usage_report(None);
    assert_eq!(report.by_tool["transfer_funds"].count(UsageStatus::Rejected), 1);
}

#[tokio::test]
async fn test_forbidden_parameters_are_a_violation() {
    let calls = Arc::new(AtomicU32::new(0));
    let reg = registry_with_tools(Arc::clone(&calls));
    let perms = Arc::new(PermissionsEngine::new(Arc::clone(&reg)));
    perms.grant("reader", "file_read");
    let guard = ExecutionGuard::new(perms);

    let mut params = Map::new();
    params.insert("path".into(), Value::from("/etc/hosts"));
    params.insert("password".into(), Value::from("hunter2"));
    let err = guard
        .execute(&InvocationContext::agent("reader"), "file_read", params)
        .await
        .unwrap_err();
    match err {
        OverseerError::ContractViolation {
            agent_id,
            violation,
            details,
        } => {
            assert_eq!(agent_id, "reader");
            assert_eq!(violation, ViolationKind::InvalidParameters);
            assert!(details.contains("password"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// --- Audit ---

#[tokio::test]
async fn test_usage_is_mirrored_to_audit_file() {
    let tmp = tempfile::tempdir().unwrap();
    let audit = Arc::new(AuditLog::new(tmp.path().to_path_buf()));
    let calls = Arc::new(AtomicU32::new(0));
    let reg = Arc::new(ToolRegistry::new().with_audit_log(Arc::clone(&audit)));
    reg.register(
        ToolSpec::new("search"),
        tool_fn(move |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!([]))
            }
        }),
    )
    .unwrap();
    let perms = Arc::new(PermissionsEngine::new(Arc::clone(&reg)));
    perms.grant("a1", "search");
    let guard = ExecutionGuard::new(perms);

    guard
        .execute(&InvocationContext::agent("a1"), "search", Map::new())
        .await
        .unwrap();
    guard
        .execute(&InvocationContext::agent("a2"), "search", Map::new())
        .await
        .unwrap_err();
    audit.flush().await;

    let contents = tokio::fs::read_to_string(audit.path()).await.unwrap();
    let records: Vec<ToolUsageRecord> = contents
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, UsageStatus::Success);
    assert_eq!(records[1].status, UsageStatus::Denied);
    assert_eq!(records[1].agent_id, "a2");

    let report = reg.usage_report(None);
    assert_eq!(report.by_agent["a1"].calls, 1);
    assert_eq!(report.by_agent["a2"].count(UsageStatus::Denied), 1);
}
