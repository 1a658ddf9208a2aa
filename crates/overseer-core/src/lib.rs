//! Core types shared by every Overseer crate.
//!
//! This crate provides the unified error type, the approval types used by
//! gated tool calls, and the in-process message bus that connects the
//! orchestrator to its agents.
//!
//! # Main types
//!
//! - [`OverseerError`]: Unified error enum for all Overseer subsystems.
//! - [`OverseerResult`]: Convenience alias for `Result<T, OverseerError>`.
//! - [`ViolationKind`]: Kind of tool-governance contract an agent broke.
//! - [`MessageBus`]: Ordered per-channel publish/subscribe delivery.
//! - [`MessageHandler`]: Receiver side of a bus channel.
//! - [`RiskLevel`], [`ApprovalDecision`]: Approval gating for risky tools.

/// Approval types for gated tool calls.
pub mod approval;
/// Asynchronous message bus.
pub mod bus;
/// Error taxonomy.
pub mod error;

pub use approval::{ApprovalChannel, ApprovalDecision, ApprovalRequest, RiskLevel};
pub use bus::{handler_fn, BusStats, MessageBus, MessageHandler};
pub use error::{OverseerError, OverseerResult, ViolationKind};
