//! Approval types for gated tool calls.
//!
//! These types live in `overseer-core` so that `overseer-governance` (which
//! parks calls awaiting sign-off) and hosts (which surface them to reviewers)
//! share them without depending on each other.

use crate::OverseerResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Declared risk level of a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Lenient parser used for config values; unknown strings map to `Medium`.
    pub fn parse_level(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "low" => RiskLevel::Low,
            "medium" => RiskLevel::Medium,
            "high" => RiskLevel::High,
            "critical" => RiskLevel::Critical,
            _ => RiskLevel::Medium,
        }
    }
}

/// A request sent to a reviewer for approval of a parked tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub agent_id: String,
    pub tool_name: String,
    pub risk_level: RiskLevel,
    pub parameters: serde_json::Value,
}

/// The decision made by a reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub reason: Option<String>,
    pub reviewer: String,
}

impl ApprovalDecision {
    pub fn approve(reviewer: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: None,
            reviewer: reviewer.into(),
        }
    }

    pub fn reject(reviewer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
            reviewer: reviewer.into(),
        }
    }
}

/// Channel through which approval requests are sent and decisions are received.
/// Implementations can be CLI prompts, WebSocket handlers, chat bots, etc.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn request_approval(&self, request: ApprovalRequest) -> OverseerResult<ApprovalDecision>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(RiskLevel::parse_level("HIGH"), RiskLevel::High);
        assert_eq!(RiskLevel::parse_level("whatever"), RiskLevel::Medium);
        assert!(RiskLevel::Critical > RiskLevel::Low);
    }
}
