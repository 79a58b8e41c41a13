//! Error types for sisu

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Result type alias for sisu operations
pub type Result<T> = std::result::Result<T, CallError>;

/// Maximum upstream body bytes carried inside error values and DLQ entries.
///
/// Full bodies stay on the [`crate::transport::Response`]; errors only keep
/// a snippet so log lines and dead-letter entries stay bounded.
const BODY_SNIPPET_LIMIT: usize = 2048;

/// Render an upstream body for inclusion in an error value.
pub(crate) fn body_snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= BODY_SNIPPET_LIMIT {
        text.into_owned()
    } else {
        let mut end = BODY_SNIPPET_LIMIT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}… ({} bytes total)", &text[..end], body.len())
    }
}

/// Transport-level failure for a single attempt
///
/// These never carry an HTTP status: the request either did not complete
/// or the response body could not be read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The attempt exceeded its per-request timeout
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Connection-level failure (DNS, refused, reset, TLS)
    #[error("connection error: {0}")]
    Connection(String),

    /// The request could not be sent at all
    #[error("request failed: {0}")]
    Request(String),

    /// The response arrived but its body could not be read
    #[error("failed to read response body: {0}")]
    Body(String),
}

/// Error type surfaced by [`crate::client::ResilientClient::execute`]
///
/// The taxonomy encodes the propagation policy:
///
/// - [`CallError::CircuitOpen`] — fail fast, the transport was never invoked
/// - [`CallError::UpstreamClient`] — 4xx, returned immediately, never retried,
///   does not count against the circuit breaker
/// - [`CallError::UpstreamServer`] / [`CallError::Transport`] — retryable,
///   counted against the breaker
/// - [`CallError::RetriesExhausted`] — all attempts failed; the call has been
///   captured to the dead letter queue and the last failure is wrapped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Circuit breaker rejected the call before any transport activity
    #[error("circuit open for '{target}', failing fast")]
    CircuitOpen { target: String },

    /// Upstream returned a 5xx response
    #[error("upstream server error {status}: {body}")]
    UpstreamServer { status: StatusCode, body: String },

    /// Upstream returned a 4xx response (caller defect, not upstream health)
    #[error("upstream client error {status}: {body}")]
    UpstreamClient { status: StatusCode, body: String },

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// All attempts failed; the call was enqueued to the dead letter queue
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<CallError>,
    },

    /// Malformed request (relative URL, missing host, bad header value)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration rejected at construction time
    #[error("configuration error: {0}")]
    Config(String),
}

impl CallError {
    /// Whether this failure is eligible for local retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::UpstreamServer { .. } | CallError::Transport(_)
        )
    }
}

/// Error returned by external collaborators (alert sinks, escalation hooks)
///
/// Hook failures are logged and swallowed by the engine; they never change
/// the outcome of the call that triggered them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HookError(pub String);
