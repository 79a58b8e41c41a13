//! SISU - resilient remote-call engine
//!
//! Client-side wrapper for outbound HTTP calls to unreliable upstream
//! services: pooled transport, per-target circuit breakers, exponential
//! backoff retries, and an in-process dead letter queue with escalation.
//!
//! # Control Flow
//!
//! ```text
//! caller ──► ResilientClient.execute()
//!               │ CircuitBreaker.can_execute()?  ── no ──► CircuitOpen (fail fast)
//!               ▼
//!            attempt loop ──► pooled Transport ──► classify
//!               │  success ──► record_success ──► Response
//!               │  4xx     ──► UpstreamClient (immediate, breaker-neutral)
//!               │  failure ──► record_failure ──► backoff sleep ──► retry
//!               ▼
//!            retries exhausted ──► DeadLetterQueue.add ──► EscalationHook
//!                                      │
//!                                      └──► AlertManager (backlog check)
//! ```
//!
//! External collaborators plug in via traits: [`Transport`] (the network),
//! [`AlertSink`] (monitoring) and [`EscalationHook`] (ticketing). Tests
//! drive the whole engine through in-process implementations.
//!
//! The engine is deliberately not a service mesh: no distributed consensus,
//! no durable queueing. The DLQ is in-process and non-durable; entries
//! vanish on restart and remediation is external.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod alert;
pub mod client;
pub mod dlq;
pub mod error;
pub mod resilience;
pub mod transport;

pub use alert::{AlertEvent, AlertKind, AlertManager, AlertSink, LogAlertSink, Severity};
pub use client::{ClientBuilder, RequestOptions, ResilientClient};
pub use dlq::{
    DeadLetterEntry, DeadLetterQueue, DeadLetterStatus, EscalationHook, Incident,
    IncidentPriority, LogEscalationHook,
};
pub use error::{CallError, HookError, Result, TransportError};
pub use resilience::{
    BreakerRegistry, BreakerScope, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    ProbeGuard, RetryConfig, StateTransition, Verdict,
};
pub use transport::{CallRequest, HttpTransport, PoolConfig, Response, Transport};
