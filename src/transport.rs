//! Pooled HTTP transport behind an injectable trait
//!
//! The [`Transport`] trait is the seam between the engine and the network:
//! production code uses [`HttpTransport`] (a pooled reqwest client), tests
//! drive the engine through in-process mocks. Neither the trait nor
//! [`Response`] leaks reqwest types.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use url::Url;

use crate::error::{CallError, TransportError};

/// Connection pool and timeout bounds applied by the transport
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Cap on concurrent in-flight requests through this transport
    pub max_connections: usize,
    /// Idle keep-alive connections retained per host
    pub max_keep_alive: usize,
    /// How long an idle keep-alive connection survives
    pub keep_alive_expiry: Duration,
    /// Timeout for a single attempt (not the whole retrying operation)
    pub request_timeout: Duration,
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            max_keep_alive: 16,
            keep_alive_expiry: Duration::from_secs(90),
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Validate invariants; called by the client builder
    pub fn validate(&self) -> Result<(), CallError> {
        if self.max_connections == 0 {
            return Err(CallError::Config("pool max_connections must be > 0".into()));
        }
        if self.max_keep_alive == 0 {
            return Err(CallError::Config("pool max_keep_alive must be > 0".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(CallError::Config("pool request_timeout must be > 0".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(CallError::Config("pool connect_timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// A fully-prepared outbound call, reused verbatim across retry attempts
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Per-request override of the transport's attempt timeout
    pub timeout_override: Option<Duration>,
}

/// Upstream response facade
///
/// The body is fully buffered; upstream payloads are treated opaquely
/// (status code plus bytes), whether JSON, XML or anything else.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body rendered as (lossy) UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Transport seam - performs one attempt of one call
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Perform a single attempt. Implementations must bound the attempt by
    /// the configured request timeout (or the request's override) and must
    /// be safe for concurrent use.
    async fn send(&self, request: &CallRequest) -> Result<Response, TransportError>;
}

/// Production transport: pooled reqwest client
///
/// reqwest enforces `max_keep_alive`/`keep_alive_expiry` per host and the
/// per-attempt timeouts; it has no global in-flight cap, so
/// `max_connections` is enforced here with a semaphore.
pub struct HttpTransport {
    client: reqwest::Client,
    permits: Semaphore,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &PoolConfig) -> Result<Self, CallError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_keep_alive)
            .pool_idle_timeout(config.keep_alive_expiry)
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| CallError::Config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            permits: Semaphore::new(config.max_connections),
            request_timeout: config.request_timeout,
        })
    }

    fn classify_error(err: reqwest::Error, timeout: Duration) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(timeout)
        } else if err.is_connect() {
            TransportError::Connection(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, request: &CallRequest) -> Result<Response, TransportError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Connection("connection pool closed".into()))?;

        let timeout = request.timeout_override.unwrap_or(self.request_timeout);
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .timeout(timeout);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::classify_error(e, timeout))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?;

        Ok(Response::new(status, headers, body))
    }
}
