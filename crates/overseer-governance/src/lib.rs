//! Tool-access governance for Overseer agents.
//!
//! Every tool call an agent makes goes through the [`ExecutionGuard`], which
//! consults the [`PermissionsEngine`] and either runs the tool, parks the call
//! for approval, or raises a contract violation. Every outcome lands in the
//! [`ToolRegistry`]'s usage ledger and, when configured, a JSONL [`AuditLog`].

pub mod audit;
pub mod guard;
pub mod permissions;
pub mod registry;
pub mod tool;
pub mod usage;

pub use audit::AuditLog;
pub use guard::{ExecutionGuard, GuardOutcome, InvocationContext, PendingApproval};
pub use permissions::{AccessDecision, InvalidParameters, PermissionsEngine, ToolPermissionSet};
pub use registry::ToolRegistry;
pub use tool::{tool_fn, Tool, ToolOutput, ToolSpec};
pub use usage::{ToolUsageRecord, UsageLedger, UsageReport, UsageStatus, UsageSummary};
