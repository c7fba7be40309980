//! Delivery of batches to the remote collector
//!
//! The collector accepts `POST <api_endpoint>` with a JSON body
//! `{ batchId, timestamp, count, events }`. Any 2xx status is success;
//! every other status, and every transport-level error, is a delivery failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::types::{BatchPayload, SanitizedEvent};

/// Something that can hand a batch payload to the collector.
///
/// The sync engine holds an `Arc<dyn Transport>`, so hosts can swap the HTTP
/// client for their own delivery mechanism.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one payload. `Ok` means the collector acknowledged it.
    async fn deliver(&self, payload: &BatchPayload) -> Result<()>;
}

/// Send a single sanitized event outside any stored batch.
///
/// Used in immediate mode and as the fallback when the local store rejects a
/// write. The payload gets a throwaway batch id.
pub async fn deliver_event(transport: &dyn Transport, event: SanitizedEvent) -> Result<()> {
    let payload = BatchPayload::new(uuid::Uuid::new_v4().to_string(), vec![event.into_inner()]);
    transport.deliver(&payload).await
}

/// HTTP client for the collector endpoint
#[derive(Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// Create a transport from pipeline configuration
    ///
    /// Returns an error if no endpoint is configured or the api key is not a
    /// valid header value.
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let endpoint = config
            .api_endpoint
            .clone()
            .ok_or_else(|| Error::Config("pipeline.api_endpoint is required".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.api_key {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(client: reqwest::Client, url: String, body: Vec<u8>) -> Result<()> {
        let response = client
            .post(&url)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        Err(Error::Transport(format!(
            "collector returned {}: {}",
            status, error_text
        )))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, payload: &BatchPayload) -> Result<()> {
        let body = serde_json::to_vec(payload)?;

        tracing::debug!(
            batch_id = %payload.batch_id,
            count = payload.count,
            endpoint = %self.endpoint,
            "Posting batch to collector"
        );

        // The request runs on its own task: dropping this future (shutdown,
        // a cancelled caller) does not abort a POST that is already in flight.
        let request = tokio::spawn(Self::post(
            self.http_client.clone(),
            self.endpoint.clone(),
            body,
        ));

        request
            .await
            .map_err(|e| Error::Transport(format!("delivery task failed: {}", e)))?
    }
}
