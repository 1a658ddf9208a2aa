//! Resilience primitives for Overseer.
//!
//! Everything here guards calls into dependencies that can fail or be
//! overwhelmed: circuit breakers, multi-window rate limits, and collapsing of
//! identical concurrent requests.
//!
//! # Main types
//!
//! - [`CircuitBreaker`] and [`CircuitBreakerRegistry`]: fail fast on a
//!   dependency that keeps failing, then probe it for recovery.
//! - [`RateLimiter`]: per-principal minute/hour/day request limits.
//! - [`RequestDeduplicator`]: run identical in-flight requests once.

/// Circuit breakers keyed by dependency name.
pub mod circuit_breaker;
/// Identical-request collapsing.
pub mod dedup;
/// Multi-window rate limiting.
pub mod rate_limit;
/// Fixed-window counter shared by the limiters.
pub mod window;

pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerSnapshot, CircuitState,
};
pub use dedup::{canonical_key, DedupStats, RequestDeduplicator};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter, RateWindow, WindowUsage};
pub use window::FixedWindow;
