//! Resilience building blocks for the remote-call engine
//!
//! # Data Flow
//! ```text
//! execute(call):
//!     → circuit_breaker.rs (fail fast if the target is known-bad)
//!     → transport attempt, bounded by the per-request timeout
//!     → on retryable failure: retry.rs (exponential backoff, retry)
//!     → on exhaustion: crate::dlq (capture + escalate)
//! ```
//!
//! # Design Decisions
//! - Breaker check-and-transition is one critical section
//! - One breaker per target host by default; global scope preserved as an option
//! - Backoff is jitter-free by default so the delay sequence is exact

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    BreakerRegistry, BreakerScope, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    ProbeGuard, StateTransition, Verdict,
};
pub use retry::RetryConfig;
