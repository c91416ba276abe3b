//! HTTP client for forwarding message payloads to the REST backend.

use std::time::{Duration, Instant};

use relay_core::ForwardMethod;
use serde_json::{Map, Value};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// User agent sent on every outbound request.
pub const USER_AGENT: &str = "relay-forwarder/1.0";

/// Configuration for the forwarding client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// User agent string.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30), user_agent: USER_AGENT.to_string() }
    }
}

/// One outbound call.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    /// HTTP verb.
    pub method: ForwardMethod,
    /// Full destination URL.
    pub url: String,
    /// JSON body.
    pub payload: Map<String, Value>,
    /// Attempt number, for logging.
    pub attempt: u32,
}

/// Successful backend response.
#[derive(Debug, Clone)]
pub struct ForwardResponse {
    /// HTTP status code, always 2xx.
    pub status_code: u16,
    /// Time from send to response headers.
    pub duration: Duration,
}

/// Pooled HTTP client issuing JSON `PUT` and `POST` calls.
#[derive(Debug, Clone)]
pub struct ForwardClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl ForwardClient {
    /// Creates a client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the underlying client
    /// cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Creates a client with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Sends the payload and classifies the result.
    ///
    /// # Errors
    ///
    /// - `HttpStatus` for any non-2xx response
    /// - `Timeout` when the configured timeout elapses
    /// - `NetworkError` for every other transport failure
    pub async fn forward(&self, request: &ForwardRequest) -> Result<ForwardResponse> {
        let span = info_span!(
            "forward",
            method = %request.method,
            url = %request.url,
            attempt = request.attempt
        );

        async move {
            let start = Instant::now();
            let builder = match request.method {
                ForwardMethod::Put => self.client.put(&request.url),
                ForwardMethod::Post => self.client.post(&request.url),
            };

            let response = match builder.json(&request.payload).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(duration_ms = start.elapsed().as_millis() as u64, "request failed: {e}");
                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let duration = start.elapsed();
            let status = response.status();
            debug!(status = status.as_u16(), duration_ms = duration.as_millis() as u64, "response");

            if !status.is_success() {
                return Err(DeliveryError::http_status(status));
            }

            Ok(ForwardResponse { status_code: status.as_u16(), duration })
        }
        .instrument(span)
        .await
    }
}
