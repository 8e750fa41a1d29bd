// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Export destinations.
//!
//! A [`Backend`] performs exactly one delivery attempt and classifies its result.
//! Retrying and backoff are the exporter's business, not the backend's.

use crate::constants::DEFAULT_EXPORT_PATH;
use crate::errors::PipelineError;
use crate::record::Batch;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use std::error::Error;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, error};
use zstd::stream::write::Encoder;

pub const API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    Success,
    /// Worth retrying: timeouts, throttling, server errors.
    Transient(String),
    /// The backend refused the batch; retrying cannot help.
    Permanent(String),
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, batch: &Batch) -> ExportOutcome;
}

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    /// zstd level; `None` sends uncompressed JSON.
    pub compression_level: Option<i32>,
}

/// POSTs batches as JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    compression_level: Option<i32>,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, PipelineError> {
        let url = normalize_endpoint(&config.endpoint)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if config.compression_level.is_some() {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        }
        if let Some(api_key) = &config.api_key {
            let mut value = HeaderValue::from_str(api_key)
                .map_err(|e| PipelineError::Backend(format!("invalid API key header: {e}")))?;
            value.set_sensitive(true);
            headers.insert(API_KEY_HEADER, value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_idle_timeout(Some(Duration::from_secs(270)))
            .tcp_keepalive(Some(Duration::from_secs(120)))
            .build()
            .map_err(|e| PipelineError::Backend(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url,
            headers,
            compression_level: config.compression_level,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn encode(&self, batch: &Batch) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
        let body = serde_json::to_vec(batch)?;
        let Some(level) = self.compression_level else {
            return Ok(body);
        };
        let mut encoder = Encoder::new(Vec::new(), level)?;
        encoder.write_all(&body)?;
        Ok(encoder.finish()?)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        self.url.as_str()
    }

    async fn send(&self, batch: &Batch) -> ExportOutcome {
        let body = match self.encode(batch) {
            Ok(body) => body,
            Err(e) => {
                error!("EXPORT | Failed to encode batch {}: {e}", batch.sequence);
                return ExportOutcome::Permanent(format!("encoding failed: {e}"));
            }
        };

        let response = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                let outcome = classify_status(status);
                if outcome != ExportOutcome::Success {
                    debug!(
                        "EXPORT | {} answered {status}: {:?}",
                        self.url,
                        response.text().await.unwrap_or_default()
                    );
                }
                outcome
            }
            Err(e) => ExportOutcome::Transient(format!("request failed: {e}")),
        }
    }
}

/// Maps an HTTP status to an outcome: 2xx succeed, throttling and server errors
/// may be retried, any other status is final.
pub fn classify_status(status: StatusCode) -> ExportOutcome {
    if status.is_success() {
        return ExportOutcome::Success;
    }
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        return ExportOutcome::Transient(format!("status {status}"));
    }
    ExportOutcome::Permanent(format!("status {status}"))
}

/// Parses an endpoint, appending the default ingestion path when it has none.
pub fn normalize_endpoint(endpoint: &str) -> Result<Url, PipelineError> {
    let mut url = Url::parse(endpoint.trim())
        .map_err(|e| PipelineError::Backend(format!("invalid endpoint {endpoint:?}: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(PipelineError::Backend(format!(
            "unsupported scheme in endpoint {endpoint:?}"
        )));
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(DEFAULT_EXPORT_PATH);
    }
    Ok(url)
}
