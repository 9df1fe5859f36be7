//! Delivery transport for batches.

use crate::retry::parse_retry_after;
use crate::{OutboxResult, Payload};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Why a delivery attempt produced no HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The request did not complete in time.
    Timeout,
    /// Connection, TLS or protocol failure.
    Network(String),
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    /// HTTP status, 0 when no response was received.
    pub status: u16,
    /// Set when no response was received.
    pub error: Option<DeliveryFailure>,
    /// Response headers.
    pub headers: HashMap<String, String>,
}

impl DeliveryResult {
    /// A response was received with `status`.
    pub fn from_status(status: u16, headers: HashMap<String, String>) -> Self {
        Self {
            status,
            error: None,
            headers,
        }
    }

    /// No response was received.
    pub fn failed(failure: DeliveryFailure) -> Self {
        Self {
            status: 0,
            error: Some(failure),
            headers: HashMap::new(),
        }
    }

    /// Shorthand for a 200 response without headers.
    pub fn ok() -> Self {
        Self::from_status(200, HashMap::new())
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Server-requested retry delay.
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("Retry-After").and_then(parse_retry_after)
    }
}

/// Per-request options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Request timeout.
    pub timeout: Duration,
}

/// Delivers batches to a collector.
///
/// Implementations never fail: every problem is reported through the
/// returned [`DeliveryResult`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, batch: &[Payload], options: &SendOptions) -> DeliveryResult;
}

/// JSON-over-HTTP transport.
///
/// Each batch is POSTed as a JSON array to the endpoint.
pub struct HttpTransport {
    endpoint: String,
    client: Client,
    auth_token: Option<String>,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    pub fn new(endpoint: impl Into<String>, auth_token: Option<String>) -> OutboxResult<Self> {
        let client = Client::builder().build()?;

        Ok(Self {
            endpoint: endpoint.into(),
            client,
            auth_token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &[Payload], options: &SendOptions) -> DeliveryResult {
        debug!(url = %self.endpoint, events = batch.len(), "Sending batch");

        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(options.timeout)
            .json(batch);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|v| (name.as_str().to_string(), v.to_string()))
                    })
                    .collect();
                debug!(url = %self.endpoint, status, "Batch response");
                DeliveryResult::from_status(status, headers)
            }
            Err(e) if e.is_timeout() => DeliveryResult::failed(DeliveryFailure::Timeout),
            Err(e) => DeliveryResult::failed(DeliveryFailure::Network(e.to_string())),
        }
    }
}
