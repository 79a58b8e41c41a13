//! ResilientClient - orchestration of breaker, transport, retries and DLQ
//!
//! # Control Flow
//! ```text
//! execute(method, url, options)
//!     → breaker.can_execute()?           (fail fast: CircuitOpen, no transport call)
//!     → loop: transport attempt
//!         → 2xx/3xx: breaker.record_success(), return response
//!         → 4xx:     return immediately, breaker untouched
//!         → 5xx/transport: breaker.record_failure(), backoff sleep, retry
//!     → retries exhausted: DLQ.add() once, backlog alert check,
//!       RetriesExhausted surfaced to the caller
//! ```
//!
//! The breaker is consulted once per operation, before the first attempt.
//! Backoff sleeps suspend only the calling task; the transport, breakers
//! and DLQ stay available to concurrent calls through the same client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use url::Url;

use crate::alert::{AlertManager, AlertSink, LogAlertSink};
use crate::dlq::{DeadLetterQueue, EscalationHook, LogEscalationHook};
use crate::error::{CallError, TransportError, body_snippet};
use crate::resilience::{
    BreakerRegistry, BreakerScope, CircuitBreakerConfig, RetryConfig, Verdict,
};
use crate::transport::{CallRequest, HttpTransport, PoolConfig, Response, Transport};

const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");

/// Default DLQ size above which backlog alerts fire
const DEFAULT_DLQ_ALERT_THRESHOLD: usize = 10;

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Override the transport's per-attempt timeout for this call
    pub timeout_override: Option<Duration>,
    /// Passed through as an `Idempotency-Key` header so the upstream can
    /// deduplicate retried non-idempotent calls. Never synthesized: retries
    /// of POST/PUT without one can duplicate side effects upstream.
    pub idempotency_key: Option<String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body and set the content type
    pub fn json<T: Serialize>(mut self, value: &T) -> Result<Self, CallError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| CallError::InvalidRequest(format!("json body: {e}")))?;
        self.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(Bytes::from(body));
        Ok(self)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Builder for [`ResilientClient`]
///
/// All configuration is supplied at construction; there is no hot reload.
pub struct ClientBuilder {
    circuit_breaker: CircuitBreakerConfig,
    breaker_scope: BreakerScope,
    retry: RetryConfig,
    pool: PoolConfig,
    transport: Option<Arc<dyn Transport>>,
    alert_sink: Option<Arc<dyn AlertSink>>,
    escalation_hook: Option<Arc<dyn EscalationHook>>,
    dlq_alert_threshold: usize,
}

impl ClientBuilder {
    fn new() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            breaker_scope: BreakerScope::default(),
            retry: RetryConfig::default(),
            pool: PoolConfig::default(),
            transport: None,
            alert_sink: None,
            escalation_hook: None,
            dlq_alert_threshold: DEFAULT_DLQ_ALERT_THRESHOLD,
        }
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Breaker granularity: per target host (default) or one global breaker
    pub fn breaker_scope(mut self, scope: BreakerScope) -> Self {
        self.breaker_scope = scope;
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    /// Inject a transport (testing seam); replaces the pooled HTTP transport
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    pub fn escalation_hook(mut self, hook: Arc<dyn EscalationHook>) -> Self {
        self.escalation_hook = Some(hook);
        self
    }

    /// DLQ size above which backlog alerts fire (default 10)
    pub fn dlq_alert_threshold(mut self, threshold: usize) -> Self {
        self.dlq_alert_threshold = threshold;
        self
    }

    /// Validate the configuration and construct the client
    pub fn build(self) -> Result<ResilientClient, CallError> {
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        self.pool.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&self.pool)?),
        };
        let sink = self
            .alert_sink
            .unwrap_or_else(|| Arc::new(LogAlertSink));
        let hook = self
            .escalation_hook
            .unwrap_or_else(|| Arc::new(LogEscalationHook));

        Ok(ResilientClient {
            transport,
            breakers: BreakerRegistry::new(self.breaker_scope, self.circuit_breaker),
            retry: self.retry,
            dlq: Arc::new(DeadLetterQueue::new(Some(hook))),
            alerts: AlertManager::new(sink, self.dlq_alert_threshold),
            retry_count: AtomicU64::new(0),
            recovered_count: AtomicU64::new(0),
        })
    }
}

/// Resilient remote-call client
///
/// Owns one transport, one breaker registry, one retry policy, one dead
/// letter queue and one alert manager; safe to share across tasks.
pub struct ResilientClient {
    transport: Arc<dyn Transport>,
    breakers: BreakerRegistry,
    retry: RetryConfig,
    dlq: Arc<DeadLetterQueue>,
    alerts: AlertManager,
    /// Metrics: total retry attempts performed
    retry_count: AtomicU64,
    /// Metrics: calls that succeeded after at least one retry
    recovered_count: AtomicU64,
}

impl ResilientClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The dead letter queue, for external inspection and replay
    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    /// The breaker registry, for monitoring
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Total retry attempts performed
    pub fn retry_count(&self) -> u64 {
        self.retry_count.load(Ordering::Relaxed)
    }

    /// Calls that recovered after at least one retry
    pub fn recovered_count(&self) -> u64 {
        self.recovered_count.load(Ordering::Relaxed)
    }

    /// Convenience GET with default options
    pub async fn get(&self, url: &str) -> Result<Response, CallError> {
        self.execute(Method::GET, url, RequestOptions::default())
            .await
    }

    /// Execute a remote call with circuit breaking, retries and dead
    /// lettering
    ///
    /// `url` must be absolute with a host. Each attempt is bounded by the
    /// transport's request timeout (or `options.timeout_override`); the
    /// whole operation is not - callers needing an overall deadline wrap
    /// this future in `tokio::time::timeout`, which cancels at the next
    /// backoff sleep. A cancelled call releases any half-open probe slot
    /// it held.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<Response, CallError> {
        let url = Url::parse(url)
            .map_err(|e| CallError::InvalidRequest(format!("invalid url '{url}': {e}")))?;
        let target = target_key(&url)?;

        // The request is built before the breaker is consulted: a caller
        // defect must not consume a half-open probe slot
        let mut headers = options.headers;
        if let Some(key) = options.idempotency_key {
            let value = HeaderValue::from_str(&key)
                .map_err(|e| CallError::InvalidRequest(format!("idempotency key: {e}")))?;
            headers.insert(IDEMPOTENCY_KEY, value);
        }
        let request = CallRequest {
            method,
            url,
            headers,
            body: options.body,
            timeout_override: options.timeout_override,
        };

        let breaker = self.breakers.breaker_for(&target);
        // Held for the whole call. If we leave without recording an outcome
        // (4xx return, cancelled future) the dropped guard gives the
        // half-open probe slot back.
        let _probe = match breaker.can_execute() {
            Verdict::Reject => {
                tracing::debug!(upstream = %target, "circuit open, failing fast");
                return Err(CallError::CircuitOpen { target });
            }
            Verdict::Allow(transition, probe) => {
                if let Some(transition) = transition {
                    self.alerts.circuit_transition(&target, transition).await;
                }
                probe
            }
        };

        let mut attempt: u32 = 0;
        loop {
            match classify(self.transport.send(&request).await) {
                Outcome::Success(response) => {
                    if let Some(transition) = breaker.record_success() {
                        self.alerts.circuit_transition(&target, transition).await;
                    }
                    if attempt > 0 {
                        self.recovered_count.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(
                            upstream = %target,
                            attempt,
                            "call recovered after retry"
                        );
                    }
                    return Ok(response);
                }

                // Caller defect, not upstream health: surfaced immediately,
                // never retried, and the breaker records nothing
                Outcome::ClientError(err) => {
                    tracing::debug!(upstream = %target, error = %err, "client error, not retrying");
                    return Err(err);
                }

                Outcome::Failure(err) => {
                    if let Some(transition) = breaker.record_failure() {
                        self.alerts.circuit_transition(&target, transition).await;
                    }

                    if attempt < self.retry.max_retries {
                        let delay = self.retry.delay_for_retry(attempt);
                        self.retry_count.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            upstream = %target,
                            attempt,
                            max_retries = self.retry.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "call failed, backing off before retry"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    } else {
                        let attempts = attempt + 1;
                        self.dlq.add(&request, &err, attempts).await;
                        self.alerts.dlq_depth(self.dlq.size()).await;
                        return Err(CallError::RetriesExhausted {
                            attempts,
                            source: Box::new(err),
                        });
                    }
                }
            }
        }
    }
}

/// How one attempt's result feeds the breaker and the retry loop
enum Outcome {
    /// 2xx/3xx - recorded as breaker success, returned to the caller
    Success(Response),
    /// 4xx - returned immediately, breaker-neutral
    ClientError(CallError),
    /// 5xx or transport failure - recorded as breaker failure, retryable
    Failure(CallError),
}

fn classify(result: Result<Response, TransportError>) -> Outcome {
    match result {
        Ok(response) if response.status().is_server_error() => Outcome::Failure(
            CallError::UpstreamServer {
                status: response.status(),
                body: body_snippet(response.body()),
            },
        ),
        Ok(response) if response.status().is_client_error() => Outcome::ClientError(
            CallError::UpstreamClient {
                status: response.status(),
                body: body_snippet(response.body()),
            },
        ),
        Ok(response) => Outcome::Success(response),
        Err(err) => Outcome::Failure(CallError::Transport(err)),
    }
}

/// Breaker key for a URL: `host` or `host:port`
fn target_key(url: &Url) -> Result<String, CallError> {
    let host = url
        .host_str()
        .ok_or_else(|| CallError::InvalidRequest(format!("url '{url}' has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn test_target_key_includes_explicit_port() {
        let url = Url::parse("http://crm.internal:8080/api/v1/tickets").unwrap();
        assert_eq!(target_key(&url).unwrap(), "crm.internal:8080");

        let url = Url::parse("https://erp.internal/api").unwrap();
        assert_eq!(target_key(&url).unwrap(), "erp.internal");
    }

    #[test]
    fn test_target_key_rejects_hostless_urls() {
        let url = Url::parse("mailto:ops@example.com").unwrap();
        assert!(matches!(
            target_key(&url),
            Err(CallError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_classification_boundaries() {
        let response = |status: StatusCode| {
            Ok(Response::new(status, HeaderMap::new(), Bytes::new()))
        };

        assert!(matches!(
            classify(response(StatusCode::OK)),
            Outcome::Success(_)
        ));
        assert!(matches!(
            classify(response(StatusCode::NOT_MODIFIED)),
            Outcome::Success(_)
        ));
        assert!(matches!(
            classify(response(StatusCode::NOT_FOUND)),
            Outcome::ClientError(CallError::UpstreamClient { .. })
        ));
        assert!(matches!(
            classify(response(StatusCode::INTERNAL_SERVER_ERROR)),
            Outcome::Failure(CallError::UpstreamServer { .. })
        ));
        assert!(matches!(
            classify(Err(TransportError::Connection("refused".into()))),
            Outcome::Failure(CallError::Transport(_))
        ));
    }

    #[test]
    fn test_request_options_builder() {
        let options = RequestOptions::new()
            .header(
                http::header::ACCEPT,
                HeaderValue::from_static("application/json"),
            )
            .body("payload")
            .timeout(Duration::from_secs(3))
            .idempotency_key("order-42");

        assert_eq!(options.headers.len(), 1);
        assert_eq!(options.body.unwrap(), Bytes::from("payload"));
        assert_eq!(options.timeout_override, Some(Duration::from_secs(3)));
        assert_eq!(options.idempotency_key.as_deref(), Some("order-42"));
    }

    #[test]
    fn test_json_options_set_content_type() {
        let options = RequestOptions::new()
            .json(&serde_json::json!({"ticket": 7}))
            .unwrap();

        assert_eq!(
            options.headers.get(http::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(options.body.unwrap(), Bytes::from("{\"ticket\":7}"));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = ResilientClient::builder()
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 0,
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(CallError::Config(_))));

        let result = ResilientClient::builder()
            .retry(RetryConfig {
                exponential_base: 0.5,
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(CallError::Config(_))));
    }

    #[tokio::test]
    async fn test_execute_rejects_relative_urls() {
        let client = ResilientClient::builder().build().unwrap();
        let result = client.get("api/v1/tickets").await;
        assert!(matches!(result, Err(CallError::InvalidRequest(_))));
    }
}
