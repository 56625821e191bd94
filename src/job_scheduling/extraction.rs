//! Client for the extraction worker that performs the actual crawl

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::errors::{AppError, AppResult, UpstreamError, UpstreamResult};

/// Body posted to `<extraction-base>/extract`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionRequest {
    pub url: String,
    pub depth: u32,
    pub task_id: String,
}

/// Dispatches one task to an extraction worker
#[async_trait]
pub trait ExtractionClient: Send + Sync {
    /// Returns the worker's response body on a 2xx answer
    async fn extract(&self, request: &ExtractionRequest) -> UpstreamResult<serde_json::Value>;
}

/// [`ExtractionClient`] speaking JSON over HTTP
#[derive(Debug, Clone)]
pub struct HttpExtractionClient {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpExtractionClient {
    /// Create a client posting to `endpoint` with a whole-request `timeout`
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn map_send_error(&self, error: reqwest::Error) -> UpstreamError {
        if error.is_timeout() {
            UpstreamError::Timeout {
                url: self.endpoint.clone(),
                seconds: self.timeout.as_secs(),
            }
        } else {
            UpstreamError::from(error)
        }
    }
}

#[async_trait]
impl ExtractionClient for HttpExtractionClient {
    async fn extract(&self, request: &ExtractionRequest) -> UpstreamResult<serde_json::Value> {
        debug!(
            "Dispatching task {} ({}) to {}",
            request.task_id, request.url, self.endpoint
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| self.map_send_error(e))?;

        if !status.is_success() {
            let message = String::from_utf8_lossy(&body).chars().take(512).collect::<String>();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                message: if message.is_empty() {
                    status.canonical_reason().unwrap_or("Unknown").to_string()
                } else {
                    message
                },
            });
        }

        if body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        // Non-JSON bodies are kept as text
        Ok(serde_json::from_slice(&body).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&body).into_owned())
        }))
    }
}
