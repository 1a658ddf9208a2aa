//! Single entry point through which agents invoke tools.

use crate::permissions::{AccessDecision, PermissionsEngine};
use crate::registry::ToolRegistry;
use crate::tool::ToolOutput;
use crate::usage::{ToolUsageRecord, UsageStatus};
use chrono::{DateTime, Utc};
use overseer_core::{
    ApprovalChannel, ApprovalDecision, ApprovalRequest, OverseerError, OverseerResult, RiskLevel,
    ViolationKind,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Who is making a tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    pub agent_id: String,
    pub user_id: Option<String>,
}

impl InvocationContext {
    pub fn agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Handle for a call parked until a reviewer decides on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingApproval {
    pub approval_id: String,
    pub agent_id: String,
    pub user_id: Option<String>,
    pub tool_name: String,
    pub risk_level: RiskLevel,
    pub parameters: Map<String, Value>,
    pub requested_at: DateTime<Utc>,
}

impl PendingApproval {
    fn to_request(&self) -> ApprovalRequest {
        ApprovalRequest {
            approval_id: self.approval_id.clone(),
            agent_id: self.agent_id.clone(),
            tool_name: self.tool_name.clone(),
            risk_level: self.risk_level,
            parameters: Value::Object(self.parameters.clone()),
        }
    }
}

/// Result of [`ExecutionGuard::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum GuardOutcome {
    Completed(ToolOutput),
    PendingApproval(PendingApproval),
}

/// Enforces permissions, parameter rules and approval gating before a tool
/// runs, and records every outcome.
pub struct ExecutionGuard {
    registry: Arc<ToolRegistry>,
    permissions: Arc<PermissionsEngine>,
    pending: Mutex<HashMap<String, PendingApproval>>,
    approval_channel: Option<Arc<dyn ApprovalChannel>>,
}

impl ExecutionGuard {
    pub fn new(permissions: Arc<PermissionsEngine>) -> Self {
        Self {
            registry: Arc::clone(permissions.registry()),
            permissions,
            pending: Mutex::new(HashMap::new()),
            approval_channel: None,
        }
    }

    pub fn with_approval_channel(mut self, channel: Arc<dyn ApprovalChannel>) -> Self {
        self.approval_channel = Some(channel);
        self
    }

    pub fn permissions(&self) -> &Arc<PermissionsEngine> {
        &self.permissions
    }

    /// Invoke `tool_name` on behalf of `ctx`.
    ///
    /// Allowed calls run immediately. Calls to approval-gated tools are parked
    /// and returned as [`GuardOutcome::PendingApproval`]. Denials, exhausted
    /// tool limits and forbidden parameters fail with
    /// [`OverseerError::ContractViolation`].
    pub async fn execute(
        &self,
        ctx: &InvocationContext,
        tool_name: &str,
        params: Map<String, Value>,
    ) -> OverseerResult<GuardOutcome> {
        // Denials outrank forbidden parameters. The tool window is charged
        // only once the parameters pass.
        let decision = self.permissions.check_access(&ctx.agent_id, tool_name);
        self.reject_unless_admitted(ctx, tool_name, &params, &decision)?;

        if let Err(invalid) = self.permissions.validate_parameters(tool_name, &params) {
            warn!(agent_id = %ctx.agent_id, tool = %tool_name, "{invalid}");
            self.record(ctx, tool_name, &params, UsageStatus::Denied);
            return Err(OverseerError::violation(
                &ctx.agent_id,
                ViolationKind::InvalidParameters,
                invalid.to_string(),
            ));
        }

        let decision = self.permissions.admit(&ctx.agent_id, tool_name);
        self.reject_unless_admitted(ctx, tool_name, &params, &decision)?;

        if decision == AccessDecision::RequireApproval {
            let pending = PendingApproval {
                approval_id: Uuid::new_v4().to_string(),
                agent_id: ctx.agent_id.clone(),
                user_id: ctx.user_id.clone(),
                tool_name: tool_name.to_string(),
                risk_level: self
                    .registry
                    .spec(tool_name)
                    .map(|s| s.risk_level)
                    .unwrap_or_default(),
                parameters: params,
                requested_at: Utc::now(),
            };
            info!(
                approval_id = %pending.approval_id,
                agent_id = %ctx.agent_id,
                tool = %tool_name,
                risk = ?pending.risk_level,
                "Tool call awaiting approval"
            );
            self.record(ctx, tool_name, &pending.parameters, UsageStatus::PendingApproval);
            self.pending
                .lock()
                .insert(pending.approval_id.clone(), pending.clone());
            return Ok(GuardOutcome::PendingApproval(pending));
        }

        let output = self
            .registry
            .invoke(&ctx.agent_id, ctx.user_id.as_deref(), tool_name, params)
            .await?;
        Ok(GuardOutcome::Completed(output))
    }

    fn reject_unless_admitted(
        &self,
        ctx: &InvocationContext,
        tool_name: &str,
        params: &Map<String, Value>,
        decision: &AccessDecision,
    ) -> OverseerResult<()> {
        match decision {
            AccessDecision::Allow | AccessDecision::RequireApproval => Ok(()),
            AccessDecision::Deny { reason } => {
                self.record(ctx, tool_name, params, UsageStatus::Denied);
                Err(OverseerError::violation(
                    &ctx.agent_id,
                    ViolationKind::AccessDenied,
                    reason.clone(),
                ))
            }
            AccessDecision::RateLimited { retry_after_ms } => {
                self.record(ctx, tool_name, params, UsageStatus::RateLimited);
                Err(OverseerError::violation(
                    &ctx.agent_id,
                    ViolationKind::RateLimited,
                    format!("tool '{tool_name}' rate limit exhausted; retry after {retry_after_ms}ms"),
                ))
            }
        }
    }

    /// Like [`execute`](Self::execute), but asks the configured approval
    /// channel immediately instead of returning a pending handle.
    pub async fn execute_with_approval(
        &self,
        ctx: &InvocationContext,
        tool_name: &str,
        params: Map<String, Value>,
    ) -> OverseerResult<ToolOutput> {
        match self.execute(ctx, tool_name, params).await? {
            GuardOutcome::Completed(output) => Ok(output),
            GuardOutcome::PendingApproval(pending) => {
                let Some(channel) = &self.approval_channel else {
                    self.pending.lock().remove(&pending.approval_id);
                    return Err(OverseerError::Config(format!(
                        "tool '{tool_name}' requires approval but no approval channel is configured"
                    )));
                };
                let decision = match channel.request_approval(pending.to_request()).await {
                    Ok(d) => d,
                    Err(e) => {
                        self.pending.lock().remove(&pending.approval_id);
                        return Err(e);
                    }
                };
                self.resolve_approval(&pending.approval_id, decision)
                    .await?
                    .ok_or_else(|| {
                        OverseerError::Tool(format!("call to '{tool_name}' was rejected"))
                    })
            }
        }
    }

    /// Apply a reviewer's decision to a parked call. Returns the tool output
    /// when approved and `None` when rejected.
    pub async fn resolve_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> OverseerResult<Option<ToolOutput>> {
        let pending = self
            .pending
            .lock()
            .remove(approval_id)
            .ok_or_else(|| OverseerError::ApprovalNotFound(approval_id.to_string()))?;
        let ctx = InvocationContext {
            agent_id: pending.agent_id,
            user_id: pending.user_id,
        };

        if !decision.approved {
            info!(
                approval_id = %approval_id,
                reviewer = %decision.reviewer,
                reason = decision.reason.as_deref().unwrap_or(""),
                "Tool call rejected"
            );
            self.record(&ctx, &pending.tool_name, &pending.parameters, UsageStatus::Rejected);
            return Ok(None);
        }

        info!(approval_id = %approval_id, reviewer = %decision.reviewer, "Tool call approved");
        let output = self
            .registry
            .invoke(
                &ctx.agent_id,
                ctx.user_id.as_deref(),
                &pending.tool_name,
                pending.parameters,
            )
            .await?;
        Ok(Some(output))
    }

    /// Parked calls, oldest first.
    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        let mut list: Vec<PendingApproval> = self.pending.lock().values().cloned().collect();
        list.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        list
    }

    fn record(
        &self,
        ctx: &InvocationContext,
        tool_name: &str,
        params: &Map<String, Value>,
        status: UsageStatus,
    ) {
        self.registry.record_usage(ToolUsageRecord::new(
            &ctx.agent_id,
            ctx.user_id.clone(),
            tool_name,
            Value::Object(params.clone()),
            status,
        ));
    }
}
