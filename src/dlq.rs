//! Dead letter queue
//!
//! Append-only, in-memory ledger of calls that exhausted their retries.
//! Every captured entry triggers the escalation hook (e.g. ticket creation
//! in an ITSM system) exactly once, best-effort: a hook failure is logged
//! and swallowed, never rolled back into the enqueue or the call outcome.
//!
//! Entries are non-durable by design - they vanish on process restart. The
//! queue never evicts and is never cleared by the engine itself; draining
//! and resolution belong to external inspection code.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{CallError, HookError, body_snippet};
use crate::transport::CallRequest;

/// Review status of a dead-lettered call
///
/// The engine only ever produces `PendingManualReview`; the terminal states
/// exist for external remediation tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    PendingManualReview,
    Resolved,
    Discarded,
}

/// A call that permanently failed, immutable once created
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub enqueued_at: SystemTime,
    pub method: String,
    pub url: String,
    /// Serialized request arguments (headers + body summary) for replay
    pub serialized_args: String,
    /// Terminal error that exhausted the retries
    pub error: String,
    /// Attempts actually executed (initial + retries)
    pub retry_count: u32,
    pub status: DeadLetterStatus,
}

/// Priority of an escalated incident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentPriority {
    High,
    Medium,
    Low,
}

/// Escalation payload handed to the external hook
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub summary: String,
    pub detail: String,
    pub priority: IncidentPriority,
    pub source_entry_id: Uuid,
}

/// External escalation collaborator (e.g. a ticketing system)
///
/// Fire-and-forget from the engine's perspective: failures are logged, the
/// original call's result never changes.
#[async_trait]
pub trait EscalationHook: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &'static str;

    async fn create_incident(&self, incident: Incident) -> Result<(), HookError>;
}

/// Default hook: records the incident in the process log
pub struct LogEscalationHook;

#[async_trait]
impl EscalationHook for LogEscalationHook {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn create_incident(&self, incident: Incident) -> Result<(), HookError> {
        tracing::error!(
            entry_id = %incident.source_entry_id,
            priority = ?incident.priority,
            summary = %incident.summary,
            detail = %incident.detail,
            "incident escalated"
        );
        Ok(())
    }
}

/// In-memory dead letter queue
///
/// Thread-safe for concurrent producers; entry order is insertion order as
/// serialized by the internal lock.
pub struct DeadLetterQueue {
    entries: Mutex<Vec<DeadLetterEntry>>,
    /// O(1) size mirror, kept in sync under the entries lock
    len: AtomicUsize,
    /// Metrics: entries ever captured
    total_captured: AtomicU64,
    hook: Option<Arc<dyn EscalationHook>>,
}

impl DeadLetterQueue {
    pub fn new(hook: Option<Arc<dyn EscalationHook>>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            len: AtomicUsize::new(0),
            total_captured: AtomicU64::new(0),
            hook,
        }
    }

    /// Capture a permanently-failed call and escalate it
    ///
    /// Appends the entry, then invokes the escalation hook exactly once.
    /// Returns the new entry's id.
    pub async fn add(&self, request: &CallRequest, error: &CallError, retry_count: u32) -> Uuid {
        let entry = DeadLetterEntry {
            id: Uuid::new_v4(),
            enqueued_at: SystemTime::now(),
            method: request.method.to_string(),
            url: request.url.to_string(),
            serialized_args: serialize_args(request),
            error: error.to_string(),
            retry_count,
            status: DeadLetterStatus::PendingManualReview,
        };
        let id = entry.id;

        let size = {
            let mut entries = self.entries.lock();
            entries.push(entry);
            self.len.store(entries.len(), Ordering::Release);
            entries.len()
        };
        self.total_captured.fetch_add(1, Ordering::Relaxed);

        tracing::warn!(
            entry_id = %id,
            url = %request.url,
            error = %error,
            attempts = retry_count,
            dlq_size = size,
            "call exhausted retries, captured to dead letter queue"
        );

        if let Some(hook) = &self.hook {
            let incident = Incident {
                summary: format!(
                    "Remote call {} {} failed permanently",
                    request.method, request.url
                ),
                detail: format!(
                    "exhausted {retry_count} attempts; last error: {error}; dlq entry {id}"
                ),
                priority: IncidentPriority::High,
                source_entry_id: id,
            };
            if let Err(e) = hook.create_incident(incident).await {
                tracing::warn!(
                    hook = hook.name(),
                    entry_id = %id,
                    error = %e,
                    "escalation hook failed, entry kept"
                );
            }
        }

        id
    }

    /// Current entry count, O(1)
    pub fn size(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Entries ever captured (monotonic, unaffected by draining)
    pub fn total_captured(&self) -> u64 {
        self.total_captured.load(Ordering::Relaxed)
    }

    /// Clone all entries without removing them (external inspection)
    pub fn snapshot(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().clone()
    }

    /// Remove and return up to `n` oldest entries (external reprocessing)
    pub fn drain(&self, n: usize) -> Vec<DeadLetterEntry> {
        let mut entries = self.entries.lock();
        let count = n.min(entries.len());
        let drained = entries.drain(..count).collect();
        self.len.store(entries.len(), Ordering::Release);
        drained
    }

    /// Remove all entries (external operator action, never the engine)
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.len.store(0, Ordering::Release);
    }
}

/// Render request arguments for the entry, body truncated to a snippet
fn serialize_args(request: &CallRequest) -> String {
    let headers: serde_json::Map<String, serde_json::Value> = request
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                serde_json::Value::String(value.to_str().unwrap_or("<binary>").to_string()),
            )
        })
        .collect();

    let body = request
        .body
        .as_deref()
        .map(body_snippet)
        .unwrap_or_default();

    serde_json::json!({
        "headers": headers,
        "body": body,
        "body_bytes": request.body.as_ref().map(|b| b.len()).unwrap_or(0),
        "timeout_override_ms": request
            .timeout_override
            .map(|t| t.as_millis() as u64),
    })
    .to_string()
}
