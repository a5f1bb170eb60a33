//! # HTTP Write Forwarder
//!
//! Delivers ingested lines to a remote write endpoint. Each payload is one
//! HTTP/1.1 `POST` with `Content-Type: text/plain`; only a `200 OK` counts as
//! delivered. Nothing is retried: a failed payload is reported to the caller,
//! which decides what a failure means for its batch.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{StatusCode, Url};
use thiserror::Error;

use crate::core::poller::Record;

/// Path appended to the endpoint for every write.
pub const WRITE_PATH: &str = "/api/write";

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Invalid write endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("Failed to send to {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to send to {endpoint}, status = {status}")]
    Status { endpoint: String, status: u16 },
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// `host:port` of the write endpoint.
    pub endpoint: String,
    /// Connect and request timeout.
    pub timeout: Duration,
    /// Skip payloads containing a double quote; the write endpoint only takes
    /// numeric values and rejects quoted strings.
    pub skip_quoted: bool,
}

impl ForwarderConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(10),
            skip_quoted: true,
        }
    }
}

/// A plain-text HTTP writer.
///
/// The underlying `reqwest::Client` is reused across sends to keep the
/// connection to the endpoint alive.
pub struct HttpForwarder {
    inner: reqwest::Client,
    endpoint: String,
    write_url: Url,
    skip_quoted: bool,
}

impl HttpForwarder {
    /// Creates a forwarder for `config.endpoint`.
    ///
    /// # Errors
    /// [`ForwardError::InvalidEndpoint`] if `http://{endpoint}/api/write` is not a
    /// valid URL, [`ForwardError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: ForwarderConfig) -> Result<Self, ForwardError> {
        let write_url = write_url(&config.endpoint)?;

        let inner = reqwest::Client::builder()
            .http1_only()
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .build()
            .map_err(|source| ForwardError::Transport {
                endpoint: config.endpoint.clone(),
                source,
            })?;

        Ok(Self {
            inner,
            endpoint: config.endpoint,
            write_url,
            skip_quoted: config.skip_quoted,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn write_url(&self) -> &Url {
        &self.write_url
    }

    /// Posts one payload.
    pub async fn send(&self, payload: &str) -> Result<(), ForwardError> {
        let response = self
            .inner
            .post(self.write_url.clone())
            .header(CONTENT_TYPE, "text/plain")
            .body(payload.to_string())
            .send()
            .await
            .map_err(|source| ForwardError::Transport {
                endpoint: self.endpoint.clone(),
                source,
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            log::error!("Failed to send {} to {}", payload, self.endpoint);
            return Err(ForwardError::Status {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Posts every record in order and returns how many were sent.
    ///
    /// Records skipped by the quote filter are not counted. The first failure
    /// stops the batch; records after it are not attempted.
    pub async fn put(&self, records: &[Record]) -> Result<usize, ForwardError> {
        let mut sent = 0;
        for record in records {
            if self.skip_quoted && record.payload.contains('"') {
                log::debug!("Skipping quoted payload: {}", record.payload);
                continue;
            }
            self.send(&record.payload).await?;
            sent += 1;
        }
        Ok(sent)
    }
}

fn write_url(endpoint: &str) -> Result<Url, ForwardError> {
    let invalid = || ForwardError::InvalidEndpoint(endpoint.to_string());
    if endpoint.trim().is_empty() || endpoint.contains('/') {
        return Err(invalid());
    }
    Url::parse(&format!("http://{}{}", endpoint, WRITE_PATH)).map_err(|_| invalid())
}
