//! One-shot HTTP forwarding.
//!
//! Performs the POST behind an HTTP frame and turns the outcome into a
//! correlated reply. Failures still produce a reply, carrying a JSON-RPC
//! error envelope, so the caller's waiter settles instead of timing out.

// Rust guideline compliant 2026-02

use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::codec::{HttpFrame, Reply};
use crate::protocol::jsonrpc::{self, ErrorResponse};
use crate::protocol::TransportKind;

/// Why a forwarded HTTP call produced no JSON.
#[derive(Debug, Error)]
pub enum HttpForwardError {
    /// URL is not an `http(s)://` URL.
    #[error("invalid HTTP relay URL {url}: {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Relay did not answer in time.
    #[error("HTTP relay timed out")]
    Timeout,
    /// Could not reach the relay.
    #[error("could not reach HTTP relay: {0}")]
    Connect(String),
    /// Relay answered with a non-JSON error status.
    #[error("HTTP relay returned status {0}")]
    Status(u16),
    /// Response body exceeded the configured limit.
    #[error("HTTP relay response exceeds {0} bytes")]
    TooLarge(usize),
    /// Response body was not JSON.
    #[error("HTTP relay returned invalid JSON: {0}")]
    InvalidJson(String),
    /// Any other transport failure.
    #[error("HTTP relay request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for HttpForwardError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// Forwards JSON-RPC bodies to HTTP relays.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: Client,
    max_body_size: usize,
}

impl HttpForwarder {
    /// Forwarder with a per-request `timeout` and a response size cap.
    pub fn new(timeout: Duration, max_body_size: usize) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            max_body_size,
        })
    }

    /// POST `body` to `url` and parse the JSON response.
    pub async fn post(&self, url: &str, body: &str) -> Result<Value, HttpForwardError> {
        match TransportKind::from_url(url) {
            Ok(TransportKind::Http) => {}
            Ok(TransportKind::WebSocket) => {
                return Err(HttpForwardError::InvalidUrl {
                    url: url.to_string(),
                    reason: "expected http:// or https://".to_string(),
                })
            }
            Err(reason) => {
                return Err(HttpForwardError::InvalidUrl {
                    url: url.to_string(),
                    reason,
                })
            }
        }

        log::debug!("[HttpForward] POST {url} ({} bytes)", body.len());

        let mut response = self
            .client
            .post(url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await?;

        let status = response.status();
        if response
            .content_length()
            .is_some_and(|len| len > self.max_body_size as u64)
        {
            return Err(HttpForwardError::TooLarge(self.max_body_size));
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if bytes.len() + chunk.len() > self.max_body_size {
                return Err(HttpForwardError::TooLarge(self.max_body_size));
            }
            bytes.extend_from_slice(&chunk);
        }

        // JSON-RPC servers often answer errors with 4xx/5xx and a JSON body;
        // keep that body when it parses.
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => {
                log::debug!("[HttpForward] {url} -> {status} ({} bytes)", bytes.len());
                Ok(value)
            }
            Err(_) if !status.is_success() => Err(HttpForwardError::Status(status.as_u16())),
            Err(e) => Err(HttpForwardError::InvalidJson(e.to_string())),
        }
    }

    /// Perform `frame` and build the correlated reply.
    pub async fn handle(&self, frame: HttpFrame) -> Reply {
        let payload = match self.post(&frame.url, &frame.body).await {
            Ok(value) => value,
            Err(e) => {
                log::warn!("[HttpForward] {} failed: {e}", frame.url);
                let id = serde_json::from_str::<Value>(&frame.body)
                    .map(|body| jsonrpc::payload_id(&body))
                    .unwrap_or_else(|_| Value::from(0));
                ErrorResponse::new(id, e.to_string()).to_value()
            }
        };
        Reply::Http {
            correlation_id: frame.correlation_id,
            payload,
        }
    }
}
