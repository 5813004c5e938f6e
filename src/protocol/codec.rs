//! Mini-protocol framing carried inside mix messages.
//!
//! Client → provider ([`Request`]):
//!
//! ```text
//! open:<url>                          open a WebSocket session to <url>
//! close                               close this tag's session
//! <url>:::::<body>:::::<corr-id>      one-shot HTTP POST of <body> to <url>
//! {"jsonrpc":"2.0","id":..,...}       forward on this tag's session
//! ```
//!
//! Provider → client ([`Reply`]):
//!
//! ```text
//! opened | closed                     session lifecycle acknowledgements
//! <corr-id>:::::<json>                HTTP result for a correlated call
//! {"error":{..},"id":0,...}           session-level failure
//! {...}                               data from the relay
//! ```
//!
//! Control tokens are bare words and the HTTP frame starts with a URL
//! scheme, so none of them parse as JSON; a JSON-RPC payload can never be
//! mistaken for a control message. Correlation ids are fixed-width
//! lowercase hex and never contain the separator. URLs and bodies that
//! contain the separator are rejected at encode time instead of escaped.

// Rust guideline compliant 2026-02

use std::fmt;

use data_encoding::HEXLOWER;
use serde_json::Value;

use super::jsonrpc::{self, ErrorResponse};
use crate::error::FrameError;

/// Field separator for HTTP frames.
pub const SEPARATOR: &str = ":::::";

/// Prefix of the open request; the relay URL follows.
pub const OPEN_PREFIX: &str = "open:";

/// Close request.
pub const CLOSE: &str = "close";

/// Open acknowledgement.
pub const OPENED: &str = "opened";

/// Close acknowledgement.
pub const CLOSED: &str = "closed";

/// Random identifier matching an HTTP reply to its waiting call.
///
/// 16 random bytes rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Width of the textual form.
    pub const LEN: usize = 32;

    /// Generate a fresh id from the thread-local CSPRNG.
    pub fn random() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(HEXLOWER.encode(&bytes))
    }

    /// Parse the textual form.
    pub fn parse(s: &str) -> Result<Self, FrameError> {
        let valid = s.len() == Self::LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(FrameError::InvalidCorrelationId(s.to_string()))
        }
    }

    /// Textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A one-shot HTTP call to be performed by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpFrame {
    /// Relay endpoint.
    pub url: String,
    /// Request body (serialized JSON-RPC).
    pub body: String,
    /// Id echoed back with the result.
    pub correlation_id: CorrelationId,
}

impl HttpFrame {
    /// Encode as `<url>:::::<body>:::::<id>`.
    pub fn encode(&self) -> Result<String, FrameError> {
        if self.url.is_empty() {
            return Err(FrameError::MissingUrl);
        }
        if self.url.contains(SEPARATOR) {
            return Err(FrameError::SeparatorInField { field: "url" });
        }
        if self.body.contains(SEPARATOR) {
            return Err(FrameError::SeparatorInField { field: "body" });
        }
        // A trailing ':' would merge into the first separator.
        if self.url.ends_with(':') {
            return Err(FrameError::Ambiguous { field: "url" });
        }
        Ok(format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.url, self.body, self.correlation_id
        ))
    }

    /// Decode, splitting on the first and last separator.
    pub fn decode(message: &str) -> Result<Self, FrameError> {
        let first = message.find(SEPARATOR).ok_or(FrameError::MissingSeparator)?;
        let last = message.rfind(SEPARATOR).ok_or(FrameError::MissingSeparator)?;
        if last < first + SEPARATOR.len() {
            return Err(FrameError::MissingSeparator);
        }

        let url = &message[..first];
        let body = &message[first + SEPARATOR.len()..last];
        let id = &message[last + SEPARATOR.len()..];

        if url.is_empty() {
            return Err(FrameError::MissingUrl);
        }
        if body.contains(SEPARATOR) {
            return Err(FrameError::SeparatorInField { field: "body" });
        }

        Ok(Self {
            url: url.to_string(),
            body: body.to_string(),
            correlation_id: CorrelationId::parse(id)?,
        })
    }
}

/// Message sent by a client to the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Open a WebSocket session to the URL.
    Open(String),
    /// Close the session.
    Close,
    /// One-shot HTTP call.
    Http(HttpFrame),
    /// JSON-RPC payload for the session.
    Payload(Value),
}

impl Request {
    /// Encode for the mix transport.
    pub fn encode(&self) -> Result<String, FrameError> {
        match self {
            Self::Open(url) if url.is_empty() => Err(FrameError::MissingUrl),
            Self::Open(url) => Ok(format!("{OPEN_PREFIX}{url}")),
            Self::Close => Ok(CLOSE.to_string()),
            Self::Http(frame) => frame.encode(),
            Self::Payload(value) if jsonrpc::is_payload(value) => Ok(value.to_string()),
            Self::Payload(_) => Err(FrameError::NotJsonRpc),
        }
    }

    /// Classify and decode an inbound message on the provider side.
    pub fn decode(message: &str) -> Result<Self, FrameError> {
        if message.trim().is_empty() {
            return Err(FrameError::Empty);
        }
        if message == CLOSE {
            return Ok(Self::Close);
        }
        if let Some(url) = message.strip_prefix(OPEN_PREFIX) {
            if url.is_empty() {
                return Err(FrameError::MissingUrl);
            }
            return Ok(Self::Open(url.to_string()));
        }
        if message.starts_with("http://") || message.starts_with("https://") {
            return HttpFrame::decode(message).map(Self::Http);
        }

        let value: Value =
            serde_json::from_str(message).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
        if jsonrpc::is_payload(&value) {
            Ok(Self::Payload(value))
        } else {
            Err(FrameError::NotJsonRpc)
        }
    }
}

/// Message sent by the provider back to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Session is open.
    Opened,
    /// Session is closed.
    Closed,
    /// Result of a correlated HTTP call.
    Http {
        /// Id of the call this answers.
        correlation_id: CorrelationId,
        /// JSON response (or error envelope).
        payload: Value,
    },
    /// Session-level error (addressed to id `0`).
    Failure(ErrorResponse),
    /// Data from the relay.
    Payload(Value),
}

impl Reply {
    /// Encode for the mix transport.
    pub fn encode(&self) -> String {
        match self {
            Self::Opened => OPENED.to_string(),
            Self::Closed => CLOSED.to_string(),
            Self::Http {
                correlation_id,
                payload,
            } => format!("{correlation_id}{SEPARATOR}{payload}"),
            Self::Failure(err) => err.to_value().to_string(),
            Self::Payload(value) => value.to_string(),
        }
    }

    /// Classify and decode an inbound message on the client side.
    pub fn decode(message: &str) -> Result<Self, FrameError> {
        if message.trim().is_empty() {
            return Err(FrameError::Empty);
        }
        match message {
            OPENED => return Ok(Self::Opened),
            CLOSED => return Ok(Self::Closed),
            _ => {}
        }

        // JSON replies open with a bracket; anything else may be an HTTP result.
        let is_json = message.trim_start().starts_with(['{', '[']);
        if !is_json {
            let id_part = message.get(..CorrelationId::LEN);
            let rest = message.get(CorrelationId::LEN..);
            if let (Some(id), Some(rest)) = (id_part, rest) {
                if let Some(json) = rest.strip_prefix(SEPARATOR) {
                    let correlation_id = CorrelationId::parse(id)?;
                    let payload = serde_json::from_str(json)
                        .map_err(|e| FrameError::InvalidJson(e.to_string()))?;
                    return Ok(Self::Http {
                        correlation_id,
                        payload,
                    });
                }
            }
        }

        let value: Value =
            serde_json::from_str(message).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
        match jsonrpc::as_error(&value) {
            Some(err) if err.is_session_level() => Ok(Self::Failure(err)),
            _ => Ok(Self::Payload(value)),
        }
    }
}
