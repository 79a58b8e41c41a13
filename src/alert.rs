//! Alerting for circuit transitions and DLQ backlog
//!
//! The [`AlertManager`] is stateless: it maps engine events onto
//! [`AlertEvent`]s and hands them to the configured [`AlertSink`]
//! (monitoring, chat, pager - an external collaborator). Sink failures are
//! logged and swallowed; alerting never changes a call's outcome.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::HookError;
use crate::resilience::{CircuitState, StateTransition};

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Medium,
}

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    CircuitStateChange,
    DlqBacklog,
}

/// Event delivered to the alert sink
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub target: String,
    pub severity: Severity,
    pub payload: serde_json::Value,
}

/// External alert collaborator (monitoring / notification service)
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &'static str;

    async fn notify(&self, event: AlertEvent) -> Result<(), HookError>;
}

/// Default sink: writes alerts to the process log
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, event: AlertEvent) -> Result<(), HookError> {
        match event.severity {
            Severity::High => tracing::warn!(
                kind = ?event.kind,
                alert_target = %event.target,
                payload = %event.payload,
                "high severity alert"
            ),
            Severity::Medium => tracing::info!(
                kind = ?event.kind,
                alert_target = %event.target,
                payload = %event.payload,
                "alert"
            ),
        }
        Ok(())
    }
}

/// Stateless notifier for breaker transitions and DLQ growth
pub struct AlertManager {
    sink: Arc<dyn AlertSink>,
    /// DLQ sizes strictly above this fire a backlog alert on every add
    dlq_backlog_threshold: usize,
}

impl AlertManager {
    pub fn new(sink: Arc<dyn AlertSink>, dlq_backlog_threshold: usize) -> Self {
        Self {
            sink,
            dlq_backlog_threshold,
        }
    }

    /// Emit an alert for a circuit breaker state transition
    ///
    /// Severity is High when the new state is Open, Medium otherwise.
    pub async fn circuit_transition(&self, target: &str, transition: StateTransition) {
        let severity = if transition.to == CircuitState::Open {
            Severity::High
        } else {
            Severity::Medium
        };
        self.dispatch(AlertEvent {
            kind: AlertKind::CircuitStateChange,
            target: target.to_string(),
            severity,
            payload: serde_json::json!({
                "from": transition.from.as_str(),
                "to": transition.to.as_str(),
            }),
        })
        .await;
    }

    /// Check the DLQ depth after an add and alert on backlog
    ///
    /// Level-triggered: re-fires on every add while the size stays above
    /// the threshold, so a growing backlog keeps paging.
    pub async fn dlq_depth(&self, size: usize) {
        if size > self.dlq_backlog_threshold {
            self.dispatch(AlertEvent {
                kind: AlertKind::DlqBacklog,
                target: "dead_letter_queue".to_string(),
                severity: Severity::High,
                payload: serde_json::json!({
                    "size": size,
                    "threshold": self.dlq_backlog_threshold,
                }),
            })
            .await;
        }
    }

    async fn dispatch(&self, event: AlertEvent) {
        if let Err(e) = self.sink.notify(event).await {
            tracing::warn!(sink = self.sink.name(), error = %e, "alert sink failed");
        }
    }
}
